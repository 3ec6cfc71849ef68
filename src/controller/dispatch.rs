//! Reconciliation dispatcher
//!
//! Entry point for every dequeued key: resolve the (source, managed) pair from
//! the triggering object, run the configured sync strategy, and translate the
//! result into the controller's requeue contract.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::core::v1::{Endpoints, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::controller::Action;
use kube::{Client, Resource};
use tracing::{debug, error, info, instrument};

use super::endpoints::sync_endpoints;
use super::slices::{release_slices, sync_slices};
use super::{KubeClient, KubeClientImpl, Outcome};
use crate::config::{Config, SyncMode};
use crate::identity::{resolve, ObjectKey, ResolutionMode};
use crate::mapper::{port_policy, PortPolicy};
use crate::metrics::ReconcileTimer;
use crate::Error;

/// First retry delay after a failed reconcile
const BACKOFF_BASE: Duration = Duration::from_secs(30);

/// Upper bound on the retry delay
const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Controller context shared across reconciliations
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client, config).build();
/// ```
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Process configuration
    pub config: Arc<Config>,
    /// Port policy selected from configuration
    pub policy: Arc<dyn PortPolicy>,
    /// Consecutive failures per key, reset on success
    failures: Mutex<HashMap<ObjectKey, u32>>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, config: Config) -> ContextBuilder {
        ContextBuilder::new(client, config)
    }

    /// Create a context for testing with a mock client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>, config: Config) -> Self {
        Self::assemble(kube, config)
    }

    fn assemble(kube: Arc<dyn KubeClient>, config: Config) -> Self {
        let policy: Arc<dyn PortPolicy> = Arc::from(port_policy(&config.port_policy));
        Self {
            kube,
            config: Arc::new(config),
            policy,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure for `key` and return the delay before the next attempt
    fn next_backoff(&self, key: &ObjectKey) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let attempts = failures.entry(key.clone()).or_insert(0);
        let delay = backoff_delay(*attempts);
        *attempts = attempts.saturating_add(1);
        delay
    }

    fn reset_backoff(&self, key: &ObjectKey) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// Drop the failure history of a trigger that was deleted
    pub fn forget(&self, key: &ObjectKey) {
        self.reset_backoff(key);
    }

    #[cfg(test)]
    fn tracked_failures(&self) -> usize {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    config: Config,
}

impl ContextBuilder {
    fn new(client: Client, config: Config) -> Self {
        Self { client, config }
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context::assemble(Arc::new(KubeClientImpl::new(self.client)), self.config)
    }
}

/// Delay for the `attempt`-th consecutive failure (zero-based)
fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    BACKOFF_BASE.saturating_mul(factor).min(BACKOFF_MAX)
}

/// Resolve the pair for `trigger` and run the configured strategy
pub async fn dispatch(trigger: &ObjectMeta, ctx: &Context) -> Result<Outcome, Error> {
    let pair = resolve(trigger, &ctx.config.identity);
    if pair.mode == ResolutionMode::Dynamic {
        debug!(source = %pair.source, managed = %pair.managed, "using annotated source");
    }

    match ctx.config.sync_mode {
        SyncMode::Endpoints => sync_endpoints(ctx.kube.as_ref(), ctx.policy.as_ref(), &pair).await,
        SyncMode::EndpointSlices => {
            // A Service queued while unannotated and not the static alias has
            // just opted out of dynamic mode
            let trigger_key = ObjectKey::from_meta(trigger);
            if pair.mode == ResolutionMode::Static && trigger_key != pair.managed {
                release_slices(ctx.kube.as_ref(), &trigger_key).await?;
                return Ok(Outcome::Released);
            }
            sync_slices(ctx.kube.as_ref(), ctx.policy.as_ref(), &pair).await
        }
    }
}

async fn reconcile_trigger(
    trigger: &'static str,
    meta: &ObjectMeta,
    ctx: &Context,
) -> Result<Action, Error> {
    let timer = ReconcileTimer::start(trigger);
    match dispatch(meta, ctx).await {
        Ok(outcome) => {
            timer.finish(outcome);
            ctx.reset_backoff(&ObjectKey::from_meta(meta));
            debug!(outcome = outcome.as_str(), "reconcile complete");
            match outcome {
                Outcome::Released => Ok(Action::await_change()),
                _ => Ok(Action::requeue(ctx.config.resync_interval)),
            }
        }
        Err(e) => {
            timer.error();
            Err(e)
        }
    }
}

/// Reconcile triggered by an `Endpoints` change (whole-object strategy)
#[instrument(skip(endpoints, ctx), fields(endpoints = %ObjectKey::from_meta(endpoints.meta())))]
pub async fn reconcile_endpoints(
    endpoints: Arc<Endpoints>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    reconcile_trigger("endpoints", endpoints.meta(), &ctx).await
}

/// Reconcile triggered by a Service change (per-slice strategy)
#[instrument(skip(service, ctx), fields(service = %ObjectKey::from_meta(service.meta())))]
pub async fn reconcile_service(service: Arc<Service>, ctx: Arc<Context>) -> Result<Action, Error> {
    reconcile_trigger("service", service.meta(), &ctx).await
}

/// Error policy for both controllers
///
/// Logs the failure and requeues with a per-key exponential backoff.
pub fn error_policy<K>(obj: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action
where
    K: Resource,
{
    let key = ObjectKey::from_meta(obj.meta());
    let delay = ctx.next_backoff(&key);
    error!(
        ?error,
        key = %key,
        retryable = error.is_retryable(),
        retry_in_secs = delay.as_secs(),
        "reconciliation failed"
    );
    if !error.is_retryable() {
        info!(key = %key, "error needs a configuration or object fix; retrying at backoff cadence");
    }
    Action::requeue(delay)
}

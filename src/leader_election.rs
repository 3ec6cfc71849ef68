//! Lease-based leader election
//!
//! Only one replica reconciles at a time. Ownership of a
//! `coordination.k8s.io/v1` Lease is decided with resourceVersion
//! compare-and-swap: a write based on a stale read fails with 409 and the
//! candidate simply tries again later.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Error, FIELD_MANAGER};

/// Lease name shared by all replicas
pub const LEADER_LEASE_NAME: &str = "f668ae63.endpoint-copier-operator";

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// What a candidate may do with the lease it just read
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseState {
    /// We hold it; renew
    Held,
    /// Nobody holds a live lease; take it over
    Expired {
        /// Transitions recorded so far
        transitions: i32,
    },
    /// Someone else holds a live lease
    Taken,
}

/// Classify a lease for `identity` at `now`
///
/// A lease with no holder, no renew time or no duration counts as expired.
pub fn lease_state(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> LeaseState {
    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    if holder == Some(identity) {
        return LeaseState::Held;
    }

    let live = match (
        holder,
        spec.and_then(|s| s.renew_time.as_ref()),
        spec.and_then(|s| s.lease_duration_seconds),
    ) {
        (Some(_), Some(renewed), Some(duration)) => {
            now <= renewed.0 + chrono::Duration::seconds(i64::from(duration))
        }
        _ => false,
    };

    if live {
        LeaseState::Taken
    } else {
        LeaseState::Expired {
            transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0),
        }
    }
}

/// Competes for the operator lease
pub struct LeaderElector {
    client: Client,
    namespace: String,
    identity: String,
}

impl LeaderElector {
    /// Create an elector for `identity` (normally the pod name)
    pub fn new(client: Client, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            identity: identity.to_string(),
        }
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn lease(
        &self,
        now: DateTime<Utc>,
        resource_version: Option<String>,
        transitions: i32,
    ) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(LEADER_LEASE_NAME.to_string()),
                namespace: Some(self.namespace.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    /// Block until leadership is acquired
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(identity = %self.identity, lease = LEADER_LEASE_NAME, "waiting for leadership");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "leadership acquired");
                    return self.guard();
                }
                Ok(false) => debug!(identity = %self.identity, "lease held by another replica"),
                Err(e) => warn!(identity = %self.identity, error = %e, "failed to acquire lease"),
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    fn guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move { elector.renew_until_lost(lost_tx).await });
        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, Error> {
        let api = self.api();
        let now = Utc::now();

        let Some(existing) = api.get_opt(LEADER_LEASE_NAME).await? else {
            let lease = self.lease(now, None, 0);
            return conflict_is_false(api.create(&PostParams::default(), &lease).await);
        };

        match lease_state(existing.spec.as_ref(), &self.identity, now) {
            LeaseState::Taken => Ok(false),
            LeaseState::Held => {
                let mut renewed = existing;
                if let Some(spec) = renewed.spec.as_mut() {
                    spec.renew_time = Some(MicroTime(now));
                }
                conflict_is_false(
                    api.replace(LEADER_LEASE_NAME, &PostParams::default(), &renewed)
                        .await,
                )
            }
            LeaseState::Expired { transitions } => {
                let lease = self.lease(
                    now,
                    existing.metadata.resource_version.clone(),
                    transitions + 1,
                );
                let acquired = conflict_is_false(
                    api.replace(LEADER_LEASE_NAME, &PostParams::default(), &lease)
                        .await,
                )?;
                if acquired {
                    info!(
                        identity = %self.identity,
                        transitions = transitions + 1,
                        "took over expired lease"
                    );
                }
                Ok(acquired)
            }
        }
    }

    async fn renew_until_lost(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;
            match self.try_acquire_or_renew().await {
                Ok(true) => debug!(identity = %self.identity, "lease renewed"),
                Ok(false) | Err(_) => {
                    warn!(identity = %self.identity, "leadership lost");
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    /// Clear the holder so a standby can take over without waiting for expiry
    async fn release(&self) -> Result<(), Error> {
        let api = self.api();
        let Some(lease) = api.get_opt(LEADER_LEASE_NAME).await? else {
            return Ok(());
        };
        if lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref()) != Some(&self.identity) {
            debug!(identity = %self.identity, "not the lease holder, nothing to release");
            return Ok(());
        }

        let past = Utc::now() - chrono::Duration::seconds(60);
        let patch = json!({
            "spec": {
                "holderIdentity": null,
                "renewTime": past.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
            }
        });
        api.patch(
            LEADER_LEASE_NAME,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        info!(identity = %self.identity, "lease released");
        Ok(())
    }
}

/// 409 means another replica won the race, which is not an error
fn conflict_is_false<T>(result: Result<T, kube::Error>) -> Result<bool, Error> {
    match result {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Held leadership; renewal stops when dropped
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Release the lease during graceful shutdown
    pub async fn release(self) -> Result<(), Error> {
        self.renewal_task.abort();
        self.elector.release().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
    }
}

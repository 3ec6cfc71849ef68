//! Controller runner - wires watch streams, change filters and reconcilers
//!
//! One controller runs per process, chosen by the sync mode:
//!
//! - **Per-slice**: the primary kind is `Service` (the managed alias). Source
//!   EndpointSlice changes are mapped to the managed Services that copy from them.
//! - **Whole-object**: the primary kind is `Endpoints`. The static source record
//!   and annotated managed records trigger directly; a change to a dynamic source
//!   is fanned out to its annotated dependents.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::channel::mpsc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::reflector::{self, ObjectRef};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client, Resource};

use crate::config::SyncMode;
use crate::controller::{error_policy, reconcile_endpoints, reconcile_service, Context};
use crate::filter::{
    accept_endpoints_trigger, accept_managed, accept_source_slice, slice_owner, tracked, Change,
};
use crate::identity::{is_enabled, DependentIndex, ObjectKey, StaticIdentity};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller future ready to be polled
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build the controller for the configured sync mode
pub fn build_controllers(client: Client, ctx: Arc<Context>) -> Vec<ControllerFuture> {
    match ctx.config.sync_mode {
        SyncMode::EndpointSlices => {
            tracing::info!("- EndpointSlice controller");
            vec![build_slice_controller(client, ctx)]
        }
        SyncMode::Endpoints => {
            tracing::info!("- Endpoints controller");
            vec![build_endpoints_controller(client, ctx)]
        }
    }
}

fn build_slice_controller(client: Client, ctx: Arc<Context>) -> ControllerFuture {
    let statics = ctx.config.identity.clone();
    let services: Api<Service> = Api::all(client.clone());
    let slices: Api<EndpointSlice> = Api::all(client);

    let index = DependentIndex::new();
    let (reader, writer) = reflector::store();
    let primary_statics = statics.clone();
    let primary = tracked(
        watcher::watcher(services, watcher_config())
            .default_backoff()
            .reflect(writer)
            .inspect(observe_primary::<Service>(index.clone(), ctx.clone())),
        move |change: &Change<'_>| accept_managed(change, &primary_statics),
    );

    let filter_statics = statics.clone();
    let filter_index = index.clone();
    let source_slices = tracked(
        watcher::watcher(slices, watcher_config()).default_backoff(),
        move |change: &Change<'_>| {
            accept_source_slice(change, &filter_statics)
                || slice_owner(change.subject())
                    .is_some_and(|owner| filter_index.has_dependents(&owner))
        },
    );

    Box::pin(
        Controller::for_stream(primary, reader)
            .watches_stream(source_slices, move |slice: EndpointSlice| {
                slice_triggers(&slice, &statics, &index)
            })
            .shutdown_on_signal()
            .run(reconcile_service, error_policy, ctx)
            .for_each(log_reconcile_result("EndpointSlice")),
    )
}

fn build_endpoints_controller(client: Client, ctx: Arc<Context>) -> ControllerFuture {
    let statics = ctx.config.identity.clone();
    let endpoints: Api<Endpoints> = Api::all(client.clone());

    let index = DependentIndex::new();
    let (reader, writer) = reflector::store();
    let (fanout_tx, fanout_rx) = mpsc::unbounded::<ObjectRef<Endpoints>>();

    let mut observe = observe_primary::<Endpoints>(index.clone(), ctx.clone());
    let raw = watcher::watcher(endpoints, watcher_config())
        .default_backoff()
        .reflect(writer)
        .inspect(move |event| {
            observe(event);
            if let Ok(watcher::Event::Apply(ep) | watcher::Event::Delete(ep)) = event {
                let source = ObjectKey::from_meta(ep.meta());
                for dependent in index.dependents(&source) {
                    // Receiver lives as long as the controller
                    let _ = fanout_tx.unbounded_send(dependent);
                }
            }
        });

    let primary_statics = statics.clone();
    let primary = tracked(raw, move |change: &Change<'_>| {
        accept_endpoints_trigger(change, &primary_statics)
    });

    let mut controller = Controller::for_stream(primary, reader.clone()).reconcile_on(fanout_rx);

    if ctx.policy.uses_declared_ports() {
        let services: Api<Service> = Api::all(client);
        let filter_statics = statics.clone();
        let managed_services = tracked(
            watcher::watcher(services, watcher_config()).default_backoff(),
            move |change: &Change<'_>| accept_managed(change, &filter_statics),
        );
        controller = controller.watches_stream(managed_services, move |service: Service| {
            let key = ObjectKey::from_meta(service.meta());
            let same_named = reader.get(&ObjectRef::new(&key.name).within(&key.namespace));
            service_triggers(&service, &statics, same_named.as_deref())
        });
    }

    Box::pin(
        controller
            .shutdown_on_signal()
            .run(reconcile_endpoints, error_policy, ctx)
            .for_each(log_reconcile_result("Endpoints")),
    )
}

/// Keeps the dependent index current and drops backoff state for deleted
/// primaries
fn observe_primary<K: Resource>(
    index: DependentIndex,
    ctx: Arc<Context>,
) -> impl FnMut(&Result<watcher::Event<K>, watcher::Error>) {
    move |event: &Result<watcher::Event<K>, watcher::Error>| {
        let Ok(event) = event else {
            return;
        };
        index.apply_event(event);
        if let watcher::Event::Delete(obj) = event {
            ctx.forget(&ObjectKey::from_meta(obj.meta()));
        }
    }
}

/// Managed Services to reconcile when a source slice changes
pub fn slice_triggers(
    slice: &EndpointSlice,
    statics: &StaticIdentity,
    index: &DependentIndex,
) -> Vec<ObjectRef<Service>> {
    let Some(owner) = slice_owner(slice.meta()) else {
        return Vec::new();
    };
    let mut refs = index.dependents(&owner);
    if owner == statics.source {
        refs.push(ObjectRef::new(&statics.managed.name).within(&statics.managed.namespace));
    }
    refs
}

/// `Endpoints` triggers to reconcile when a managed Service's ports change
///
/// The static managed Service maps to the static source record (the static
/// trigger); an annotated managed `Endpoints` record of the same name maps to
/// itself.
pub fn service_triggers(
    service: &Service,
    statics: &StaticIdentity,
    same_named: Option<&Endpoints>,
) -> Vec<ObjectRef<Endpoints>> {
    let key = ObjectKey::from_meta(service.meta());
    let mut refs: Vec<ObjectRef<Endpoints>> = same_named
        .filter(|ep| is_enabled(ep.meta()) && key.matches(ep.meta()))
        .map(ObjectRef::from_obj)
        .into_iter()
        .collect();
    if key == statics.managed {
        refs.push(ObjectRef::new(&statics.source.name).within(&statics.source.namespace));
    }
    refs
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::warn!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

//! Per-slice sync strategy and garbage collection
//!
//! Every source EndpointSlice gets exactly one managed slice with a deterministic
//! name, written with server-side apply. Managed slices carry provenance labels
//! (source slice, source Service, source namespace). A sync removes every managed
//! slice that does not mirror a live slice of the current source; garbage
//! collection after the source is deleted only touches slices derived from it.

use std::collections::{BTreeMap, HashSet};

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::{KubeClient, Outcome};
use crate::identity::{ObjectKey, ServicePair};
use crate::mapper::{map_endpoints, slice_ports, DesiredPort, PortPolicy};
use crate::{
    metrics, Error, MANAGED_BY_LABEL, OPERATOR_NAME, SERVICE_NAME_LABEL, SOURCE_NAMESPACE_LABEL,
    SOURCE_SERVICE_LABEL, SOURCE_SLICE_LABEL,
};

/// Sync all managed slices for one pair
///
/// A missing source Service triggers garbage collection. A failure to apply or
/// prune a single slice is logged and the remaining slices are still attempted.
#[instrument(skip(kube, policy, pair), fields(source = %pair.source, managed = %pair.managed))]
pub async fn sync_slices(
    kube: &dyn KubeClient,
    policy: &dyn PortPolicy,
    pair: &ServicePair,
) -> Result<Outcome, Error> {
    // An unset source cannot have produced any managed slices
    if pair.source.is_empty() {
        debug!("source not configured");
        return Ok(Outcome::SourceMissing);
    }

    if kube
        .get_service(&pair.source.namespace, &pair.source.name)
        .await?
        .is_none()
    {
        let deleted = collect_garbage(kube, pair).await?;
        info!(deleted, "source service gone, removed derived slices");
        return Ok(Outcome::CleanedUp);
    }

    let Some(managed) = kube
        .get_service(&pair.managed.namespace, &pair.managed.name)
        .await?
    else {
        debug!("managed service not found");
        return Ok(Outcome::ManagedMissing);
    };

    let source_slices = kube
        .list_endpoint_slices(
            &pair.source.namespace,
            &format!("{}={}", SERVICE_NAME_LABEL, pair.source.name),
        )
        .await?;

    let declared = managed
        .spec
        .as_ref()
        .and_then(|s| s.ports.clone())
        .unwrap_or_default();
    let ports = policy.compute_ports(&declared);

    let mut applied = 0usize;
    for source in &source_slices {
        let desired = desired_slice(pair, &managed, source, &ports);
        let name = desired.name_any();
        match kube.apply_endpoint_slice(&desired).await {
            Ok(()) => {
                applied += 1;
                debug!(slice = %name, "applied managed slice");
            }
            Err(e) => {
                warn!(slice = %name, error = %e, "failed to apply managed slice");
                metrics::record_item_failure("apply");
            }
        }
    }
    metrics::record_slices_applied(applied as u64);

    let live: HashSet<String> = source_slices.iter().map(|s| s.name_any()).collect();
    let existing = kube
        .list_endpoint_slices(
            &pair.managed.namespace,
            &managed_slice_selector(&pair.managed.name),
        )
        .await?;
    let pruned = delete_all(kube, select_stale(&existing, &pair.source, &live)).await;

    info!(
        source_slices = source_slices.len(),
        applied, pruned, "synced managed slices"
    );
    Ok(Outcome::Synced)
}

/// Delete every managed slice derived from the pair's source
///
/// Returns how many deletions succeeded. Listing failures are returned;
/// individual delete failures are logged and skipped.
pub async fn collect_garbage(kube: &dyn KubeClient, pair: &ServicePair) -> Result<usize, Error> {
    let existing = kube
        .list_endpoint_slices(
            &pair.managed.namespace,
            &managed_slice_selector(&pair.managed.name),
        )
        .await?;
    Ok(delete_all(kube, select_derived(&existing, &pair.source)).await)
}

/// Delete every slice this operator wrote under a Service that is no longer managed
///
/// Runs when an alias opts out of dynamic mode. Whatever source it copied from,
/// nothing under it should stay published.
#[instrument(skip(kube, service), fields(service = %service))]
pub async fn release_slices(
    kube: &dyn KubeClient,
    service: &ObjectKey,
) -> Result<usize, Error> {
    let existing = kube
        .list_endpoint_slices(&service.namespace, &managed_slice_selector(&service.name))
        .await?;
    let owned: Vec<&EndpointSlice> = existing
        .iter()
        .filter(|slice| is_operator_managed(slice))
        .collect();
    let deleted = delete_all(kube, owned).await;
    if deleted > 0 {
        info!(deleted, "service no longer managed, removed its slices");
    }
    Ok(deleted)
}

async fn delete_all(kube: &dyn KubeClient, doomed: Vec<&EndpointSlice>) -> usize {
    let mut deleted = 0usize;
    for slice in doomed {
        let namespace = slice.namespace().unwrap_or_default();
        let name = slice.name_any();
        match kube.delete_endpoint_slice(&namespace, &name).await {
            Ok(()) => {
                deleted += 1;
                debug!(slice = %name, "deleted managed slice");
            }
            Err(e) => {
                warn!(slice = %name, error = %e, "failed to delete managed slice");
                metrics::record_item_failure("delete");
            }
        }
    }
    metrics::record_slices_deleted(deleted as u64);
    deleted
}

/// Label selector for slices this operator manages for a Service
pub fn managed_slice_selector(managed_name: &str) -> String {
    format!(
        "{}={},{}={}",
        SERVICE_NAME_LABEL, managed_name, MANAGED_BY_LABEL, OPERATOR_NAME
    )
}

/// Managed slices that no longer mirror the current source
///
/// A slice is stale when it was derived from another source (the managed
/// Service was pointed elsewhere) or from a source slice that is not live.
pub fn select_stale<'a>(
    slices: &'a [EndpointSlice],
    source: &ObjectKey,
    live: &HashSet<String>,
) -> Vec<&'a EndpointSlice> {
    slices
        .iter()
        .filter(|slice| is_operator_managed(slice))
        .filter(|slice| {
            let current = derived_from(slice, source)
                && slice
                    .labels()
                    .get(SOURCE_SLICE_LABEL)
                    .is_some_and(|origin| live.contains(origin));
            !current
        })
        .collect()
}

/// Managed slices derived from `source`, live or not
pub fn select_derived<'a>(
    slices: &'a [EndpointSlice],
    source: &ObjectKey,
) -> Vec<&'a EndpointSlice> {
    slices
        .iter()
        .filter(|slice| is_operator_managed(slice) && derived_from(slice, source))
        .collect()
}

fn is_operator_managed(slice: &EndpointSlice) -> bool {
    slice.labels().get(MANAGED_BY_LABEL).map(String::as_str) == Some(OPERATOR_NAME)
}

fn derived_from(slice: &EndpointSlice, source: &ObjectKey) -> bool {
    let labels = slice.labels();
    labels.get(SOURCE_SERVICE_LABEL) == Some(&source.name)
        && labels.get(SOURCE_NAMESPACE_LABEL) == Some(&source.namespace)
}

/// Deterministic name of the managed slice derived from `source_slice`
///
/// Two source slices with the same name in different namespaces get different
/// names, so dynamic pairs never collide.
pub fn managed_slice_name(
    managed_name: &str,
    source_namespace: &str,
    source_slice: &str,
) -> String {
    format!(
        "{}-{}",
        managed_name,
        deterministic_hash(&format!("{}/{}", source_namespace, source_slice))
    )
}

/// First 8 bytes of SHA-256 as hex
fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Build the managed slice for one source slice
pub fn desired_slice(
    pair: &ServicePair,
    managed: &Service,
    source: &EndpointSlice,
    ports: &[DesiredPort],
) -> EndpointSlice {
    let source_name = source.name_any();
    let labels = BTreeMap::from([
        (SERVICE_NAME_LABEL.to_string(), pair.managed.name.clone()),
        (MANAGED_BY_LABEL.to_string(), OPERATOR_NAME.to_string()),
        (SOURCE_SLICE_LABEL.to_string(), source_name.clone()),
        (SOURCE_SERVICE_LABEL.to_string(), pair.source.name.clone()),
        (SOURCE_NAMESPACE_LABEL.to_string(), pair.source.namespace.clone()),
    ]);

    EndpointSlice {
        metadata: ObjectMeta {
            name: Some(managed_slice_name(
                &pair.managed.name,
                &pair.source.namespace,
                &source_name,
            )),
            namespace: Some(pair.managed.namespace.clone()),
            labels: Some(labels),
            owner_references: owner_reference(managed).map(|r| vec![r]),
            ..Default::default()
        },
        address_type: source.address_type.clone(),
        endpoints: map_endpoints(&source.endpoints),
        ports: slice_ports(ports),
    }
}

fn owner_reference(service: &Service) -> Option<OwnerReference> {
    Some(OwnerReference {
        api_version: "v1".to_string(),
        kind: "Service".to_string(),
        name: service.metadata.name.clone()?,
        uid: service.metadata.uid.clone()?,
        controller: Some(true),
        block_owner_deletion: None,
    })
}

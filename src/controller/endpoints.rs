//! Whole-object sync strategy
//!
//! The managed `Endpoints` record is rebuilt from the source on every cycle and
//! written with an unconditional replace. A missing source or managed record is
//! not an error: there is nothing to sync yet.

use k8s_openapi::api::core::v1::{EndpointSubset, Endpoints};
use tracing::{debug, info, instrument};

use super::{KubeClient, Outcome};
use crate::identity::ServicePair;
use crate::mapper::{map_subsets, DesiredPort, PortPolicy};
use crate::{Error, MANAGED_BY_LABEL, OPERATOR_NAME};

/// Sync one managed `Endpoints` record from its source
#[instrument(skip(kube, policy, pair), fields(source = %pair.source, managed = %pair.managed))]
pub async fn sync_endpoints(
    kube: &dyn KubeClient,
    policy: &dyn PortPolicy,
    pair: &ServicePair,
) -> Result<Outcome, Error> {
    if pair.source.is_empty() {
        debug!("source not configured");
        return Ok(Outcome::SourceMissing);
    }

    let Some(source) = kube
        .get_endpoints(&pair.source.namespace, &pair.source.name)
        .await?
    else {
        debug!("source endpoints not found");
        return Ok(Outcome::SourceMissing);
    };

    let Some(managed) = kube
        .get_endpoints(&pair.managed.namespace, &pair.managed.name)
        .await?
    else {
        debug!("managed endpoints not found");
        return Ok(Outcome::ManagedMissing);
    };

    let declared = if policy.uses_declared_ports() {
        match kube
            .get_service(&pair.managed.namespace, &pair.managed.name)
            .await?
        {
            Some(service) => service.spec.and_then(|s| s.ports).unwrap_or_default(),
            None => {
                debug!("managed service not found");
                return Ok(Outcome::ManagedMissing);
            }
        }
    } else {
        Vec::new()
    };

    let ports = policy.compute_ports(&declared);
    let desired = desired_endpoints(
        &managed,
        source.subsets.as_deref().unwrap_or_default(),
        &ports,
    );

    if is_current(&managed, &desired) {
        debug!("managed endpoints already up to date");
        return Ok(Outcome::Unchanged);
    }

    kube.replace_endpoints(&desired).await?;
    info!(
        subsets = desired.subsets.as_ref().map_or(0, Vec::len),
        "updated managed endpoints"
    );
    Ok(Outcome::Synced)
}

/// The managed record with its subsets rebuilt from the source
///
/// Identity and unrelated labels are kept; the managed-by label is set.
pub fn desired_endpoints(
    managed: &Endpoints,
    source_subsets: &[EndpointSubset],
    ports: &[DesiredPort],
) -> Endpoints {
    let mut desired = managed.clone();
    desired.metadata.resource_version = None;
    desired.metadata.managed_fields = None;
    desired
        .metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(MANAGED_BY_LABEL.to_string(), OPERATOR_NAME.to_string());

    let subsets = map_subsets(source_subsets, ports);
    desired.subsets = (!subsets.is_empty()).then_some(subsets);
    desired
}

fn is_current(managed: &Endpoints, desired: &Endpoints) -> bool {
    managed.subsets == desired.subsets && managed.metadata.labels == desired.metadata.labels
}

//! Kubernetes client boundary for the sync strategies
//!
//! Reads map 404 to `Ok(None)` and deletes map 404 to `Ok(())`, so callers
//! never see not-found as an error.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::error::is_not_found;
use crate::{Error, FIELD_MANAGER};

/// Trait abstracting the cluster operations the sync strategies need
///
/// Mocked in tests; [`KubeClientImpl`] talks to the real API server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get an `Endpoints` record, `None` if it does not exist
    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>, Error>;

    /// Replace an `Endpoints` record unconditionally
    ///
    /// Any resourceVersion on the object is ignored; the last writer wins.
    async fn replace_endpoints(&self, endpoints: &Endpoints) -> Result<(), Error>;

    /// Get a Service, `None` if it does not exist
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    /// List EndpointSlices in a namespace matching a label selector
    async fn list_endpoint_slices(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<EndpointSlice>, Error>;

    /// Server-side apply an EndpointSlice, owning only the fields it sets
    async fn apply_endpoint_slice(&self, slice: &EndpointSlice) -> Result<(), Error>;

    /// Delete an EndpointSlice; an already-deleted slice is success
    async fn delete_endpoint_slice(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn namespace_of(obj: &impl ResourceExt) -> Result<String, Error> {
    obj.namespace()
        .ok_or_else(|| Error::validation(format!("{} has no namespace", obj.name_any())))
}

/// Server-side apply body for a slice
///
/// Serializing the typed object carries `apiVersion` and `kind`, which apply
/// requires. Server-owned metadata is stripped.
fn apply_body(slice: &EndpointSlice) -> Result<serde_json::Value, Error> {
    let mut body = slice.clone();
    body.metadata.managed_fields = None;
    body.metadata.resource_version = None;
    body.metadata.uid = None;
    body.metadata.creation_timestamp = None;
    serde_json::to_value(&body).map_err(|e| {
        Error::serialization(format!("endpoint slice {}: {}", slice.name_any(), e))
    })
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>, Error> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn replace_endpoints(&self, endpoints: &Endpoints) -> Result<(), Error> {
        let namespace = namespace_of(endpoints)?;
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), &namespace);

        let mut desired = endpoints.clone();
        desired.metadata.resource_version = None;
        api.replace(&endpoints.name_any(), &PostParams::default(), &desired)
            .await?;
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_endpoint_slices(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<EndpointSlice>, Error> {
        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items)
    }

    async fn apply_endpoint_slice(&self, slice: &EndpointSlice) -> Result<(), Error> {
        let namespace = namespace_of(slice)?;
        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), &namespace);

        let body = apply_body(slice)?;

        api.patch(
            &slice.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&body),
        )
        .await?;
        Ok(())
    }

    async fn delete_endpoint_slice(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!(namespace = %namespace, name = %name, "endpoint slice already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

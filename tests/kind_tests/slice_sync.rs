//! Integration tests for per-slice mode
//!
//! These tests tell the story of a Service alias whose EndpointSlices follow a
//! source Service: copied on creation, remapped to the alias's target port, and
//! cleaned up once the source goes away.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointPort, EndpointSlice};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;

use endpoint_copier_operator::config::{
    ApiserverPort, Config, EndpointsPortSource, SyncMode, DEFAULT_RESYNC_INTERVAL,
};
use endpoint_copier_operator::controller::managed_slice_selector;
use endpoint_copier_operator::identity::{ObjectKey, StaticIdentity};
use endpoint_copier_operator::{
    ENABLED_ANNOTATION, SERVICE_NAME_LABEL, SOURCE_NAMESPACE_ANNOTATION, SOURCE_NAME_ANNOTATION,
};

use super::helpers::{
    cleanup_namespace, ensure_test_cluster, fresh_namespace, service, wait_for, RunningOperator,
};

const TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// Test Fixtures
// =============================================================================

fn slice_config(namespace: &str) -> Config {
    Config::new(
        StaticIdentity {
            source: ObjectKey::new(namespace, "backend"),
            managed: ObjectKey::new(namespace, "backend-vip"),
        },
        SyncMode::EndpointSlices,
        EndpointsPortSource::Apiserver,
        ApiserverPort::default(),
        DEFAULT_RESYNC_INTERVAL,
    )
    .expect("valid config")
}

fn source_slice(namespace: &str, service: &str, name: &str, ips: &[&str]) -> EndpointSlice {
    EndpointSlice {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                SERVICE_NAME_LABEL.to_string(),
                service.to_string(),
            )])),
            ..Default::default()
        },
        address_type: "IPv4".to_string(),
        endpoints: ips
            .iter()
            .map(|ip| Endpoint {
                addresses: vec![ip.to_string()],
                ..Default::default()
            })
            .collect(),
        ports: Some(vec![EndpointPort {
            name: Some("api".to_string()),
            port: Some(6443),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
    }
}

async fn managed_slices(client: &Client, namespace: &str, managed: &str) -> Vec<EndpointSlice> {
    let api: Api<EndpointSlice> = Api::namespaced(client.clone(), namespace);
    api.list(&ListParams::default().labels(&managed_slice_selector(managed)))
        .await
        .map(|list| list.items)
        .unwrap_or_default()
}

fn addresses(slice: &EndpointSlice) -> Vec<String> {
    let mut ips: Vec<String> = slice
        .endpoints
        .iter()
        .flat_map(|e| e.addresses.clone())
        .collect();
    ips.sort();
    ips
}

fn first_port(slice: &EndpointSlice) -> Option<i32> {
    slice.ports.as_ref()?.first()?.port
}

// =============================================================================
// Stories
// =============================================================================

/// Story: the alias mirrors the source's slices on its own target port
///
/// An operator creates a source Service with a hand-written EndpointSlice and an
/// alias Service that targets a different port. The alias gets one managed slice
/// with the same addresses and the alias's target port.
///
/// When the source Service and its slice are deleted, the managed slice is
/// garbage collected.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_alias_follows_source_slices() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let ns = "copier-slices";
    fresh_namespace(&client, ns).await;

    let services: Api<Service> = Api::namespaced(client.clone(), ns);
    let slices: Api<EndpointSlice> = Api::namespaced(client.clone(), ns);

    services
        .create(&PostParams::default(), &service(ns, "backend", 443, 6443, &[]))
        .await
        .expect("failed to create source service");
    services
        .create(&PostParams::default(), &service(ns, "backend-vip", 443, 8443, &[]))
        .await
        .expect("failed to create managed service");
    slices
        .create(
            &PostParams::default(),
            &source_slice(ns, "backend", "backend-manual", &["10.0.0.1", "10.0.0.2"]),
        )
        .await
        .expect("failed to create source slice");

    let _operator = RunningOperator::start(client.clone(), slice_config(ns));

    wait_for(TIMEOUT, || {
        let client = client.clone();
        async move {
            let managed = managed_slices(&client, ns, "backend-vip").await;
            managed.len() == 1
                && addresses(&managed[0]) == vec!["10.0.0.1", "10.0.0.2"]
                && first_port(&managed[0]) == Some(8443)
        }
    })
    .await
    .expect("managed slice was not created");

    services
        .delete("backend", &DeleteParams::default())
        .await
        .expect("failed to delete source service");
    slices
        .delete("backend-manual", &DeleteParams::default())
        .await
        .expect("failed to delete source slice");

    wait_for(TIMEOUT, || {
        let client = client.clone();
        async move { managed_slices(&client, ns, "backend-vip").await.is_empty() }
    })
    .await
    .expect("managed slice was not garbage collected");

    cleanup_namespace(&client, ns).await;
}

/// Story: an annotated Service copies from a source in another namespace
///
/// A team annotates their own Service to follow a shared backend. The operator
/// picks it up without any static configuration and writes the managed slice
/// in the team's namespace.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_annotated_alias_copies_across_namespaces() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let source_ns = "copier-shared";
    let alias_ns = "copier-team";
    fresh_namespace(&client, source_ns).await;
    fresh_namespace(&client, alias_ns).await;

    let source_services: Api<Service> = Api::namespaced(client.clone(), source_ns);
    let alias_services: Api<Service> = Api::namespaced(client.clone(), alias_ns);
    let source_slices: Api<EndpointSlice> = Api::namespaced(client.clone(), source_ns);

    source_services
        .create(&PostParams::default(), &service(source_ns, "db", 5432, 5432, &[]))
        .await
        .expect("failed to create source service");
    source_slices
        .create(
            &PostParams::default(),
            &source_slice(source_ns, "db", "db-manual", &["10.1.0.7"]),
        )
        .await
        .expect("failed to create source slice");

    // The static pair points elsewhere; only the annotations select this alias
    let _operator = RunningOperator::start(client.clone(), slice_config("copier-unused"));

    alias_services
        .create(
            &PostParams::default(),
            &service(
                alias_ns,
                "db-alias",
                5432,
                15432,
                &[
                    (ENABLED_ANNOTATION, "true"),
                    (SOURCE_NAME_ANNOTATION, "db"),
                    (SOURCE_NAMESPACE_ANNOTATION, source_ns),
                ],
            ),
        )
        .await
        .expect("failed to create alias service");

    wait_for(TIMEOUT, || {
        let client = client.clone();
        async move {
            let managed = managed_slices(&client, alias_ns, "db-alias").await;
            managed.len() == 1
                && addresses(&managed[0]) == vec!["10.1.0.7"]
                && first_port(&managed[0]) == Some(15432)
        }
    })
    .await
    .expect("annotated alias was not synced");

    // A new source address reaches the alias through the dynamic fan-out
    source_slices
        .create(
            &PostParams::default(),
            &source_slice(source_ns, "db", "db-manual-2", &["10.1.0.8"]),
        )
        .await
        .expect("failed to create second source slice");

    wait_for(TIMEOUT, || {
        let client = client.clone();
        async move { managed_slices(&client, alias_ns, "db-alias").await.len() == 2 }
    })
    .await
    .expect("second source slice was not copied");

    cleanup_namespace(&client, source_ns).await;
    cleanup_namespace(&client, alias_ns).await;
}

//! Integration tests for whole-object mode
//!
//! The managed `Endpoints` record is overwritten with the source's addresses
//! and the fixed apiserver port.

use std::time::Duration;

use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, EndpointSubset, Endpoints};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;

use endpoint_copier_operator::config::{
    ApiserverPort, Config, EndpointsPortSource, SyncMode, DEFAULT_RESYNC_INTERVAL,
};
use endpoint_copier_operator::identity::{ObjectKey, StaticIdentity};
use endpoint_copier_operator::{MANAGED_BY_LABEL, OPERATOR_NAME};

use super::helpers::{
    cleanup_namespace, ensure_test_cluster, fresh_namespace, wait_for, RunningOperator,
};

const TIMEOUT: Duration = Duration::from_secs(60);

fn endpoints(namespace: &str, name: &str, ips: &[&str]) -> Endpoints {
    let subsets = if ips.is_empty() {
        None
    } else {
        Some(vec![EndpointSubset {
            addresses: Some(
                ips.iter()
                    .map(|ip| EndpointAddress {
                        ip: ip.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(vec![EndpointPort {
                name: Some("https".to_string()),
                port: 443,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }])
    };
    Endpoints {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        subsets,
    }
}

async fn managed_state(client: &Client, namespace: &str) -> Option<(Vec<String>, Vec<i32>, bool)> {
    let api: Api<Endpoints> = Api::namespaced(client.clone(), namespace);
    let ep = api.get_opt("apiserver-vip").await.ok()??;
    let labeled = ep
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(MANAGED_BY_LABEL))
        .map(String::as_str)
        == Some(OPERATOR_NAME);
    let subsets = ep.subsets.unwrap_or_default();
    let mut ips: Vec<String> = subsets
        .iter()
        .flat_map(|s| s.addresses.clone().unwrap_or_default())
        .map(|a| a.ip)
        .collect();
    ips.sort();
    let ports = subsets
        .iter()
        .flat_map(|s| s.ports.clone().unwrap_or_default())
        .map(|p| p.port)
        .collect();
    Some((ips, ports, labeled))
}

/// Story: the managed record tracks the source's addresses on the apiserver port
///
/// The managed `Endpoints` record starts empty. After the operator starts it
/// carries the source's addresses, the fixed port 6443 and the managed-by
/// label. When the source gains an address, the managed record follows.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_managed_endpoints_follow_source() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let ns = "copier-endpoints";
    fresh_namespace(&client, ns).await;

    let api: Api<Endpoints> = Api::namespaced(client.clone(), ns);
    api.create(&PostParams::default(), &endpoints(ns, "apiserver", &["172.18.0.2"]))
        .await
        .expect("failed to create source endpoints");
    api.create(&PostParams::default(), &endpoints(ns, "apiserver-vip", &[]))
        .await
        .expect("failed to create managed endpoints");

    let config = Config::new(
        StaticIdentity {
            source: ObjectKey::new(ns, "apiserver"),
            managed: ObjectKey::new(ns, "apiserver-vip"),
        },
        SyncMode::Endpoints,
        EndpointsPortSource::Apiserver,
        ApiserverPort::default(),
        DEFAULT_RESYNC_INTERVAL,
    )
    .expect("valid config");
    let _operator = RunningOperator::start(client.clone(), config);

    wait_for(TIMEOUT, || {
        let client = client.clone();
        async move {
            managed_state(&client, ns).await
                == Some((vec!["172.18.0.2".to_string()], vec![6443], true))
        }
    })
    .await
    .expect("managed endpoints were not synced");

    let patch = json!({
        "subsets": [{
            "addresses": [{"ip": "172.18.0.2"}, {"ip": "172.18.0.3"}],
            "ports": [{"name": "https", "port": 443, "protocol": "TCP"}]
        }]
    });
    api.patch("apiserver", &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .expect("failed to update source endpoints");

    wait_for(TIMEOUT, || {
        let client = client.clone();
        async move {
            managed_state(&client, ns).await.map(|(ips, _, _)| ips)
                == Some(vec!["172.18.0.2".to_string(), "172.18.0.3".to_string()])
        }
    })
    .await
    .expect("managed endpoints did not follow the source");

    cleanup_namespace(&client, ns).await;
}

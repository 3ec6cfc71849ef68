//! Address and port mapping
//!
//! Pure functions that compute what a managed endpoint record should contain.
//! Addresses are copied verbatim from the source; ports come from a
//! [`PortPolicy`] chosen once at startup.

use std::fmt;

use k8s_openapi::api::core::v1::{EndpointPort, EndpointSubset, ServicePort};
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointPort as SlicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::config::{ApiserverPort, PortPolicyKind};
use crate::DEFAULT_PROTOCOL;

/// A port the managed record should publish
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredPort {
    /// Port name, carried from the declared Service port
    pub name: Option<String>,
    /// Port number
    pub port: i32,
    /// Protocol
    pub protocol: String,
}

impl DesiredPort {
    /// As a core/v1 `EndpointPort` for whole-object records
    pub fn to_endpoint_port(&self) -> EndpointPort {
        EndpointPort {
            name: self.name.clone(),
            port: self.port,
            protocol: Some(self.protocol.clone()),
            ..Default::default()
        }
    }

    /// As a discovery/v1 `EndpointPort` for slices
    pub fn to_slice_port(&self) -> SlicePort {
        SlicePort {
            name: self.name.clone(),
            port: Some(self.port),
            protocol: Some(self.protocol.clone()),
            ..Default::default()
        }
    }
}

/// Computes the published ports from the managed Service's declared ports
pub trait PortPolicy: Send + Sync + fmt::Debug {
    /// Desired ports for one managed record
    fn compute_ports(&self, declared: &[ServicePort]) -> Vec<DesiredPort>;

    /// Whether [`compute_ports`](Self::compute_ports) reads the declared ports
    ///
    /// When false the caller may skip fetching the managed Service.
    fn uses_declared_ports(&self) -> bool {
        true
    }
}

/// Numeric target port if set, otherwise the declared port
fn resolve_target_port(declared: &ServicePort) -> DesiredPort {
    let port = match &declared.target_port {
        Some(IntOrString::Int(target)) => *target,
        _ => declared.port,
    };
    DesiredPort {
        name: declared.name.clone(),
        port,
        protocol: declared
            .protocol
            .clone()
            .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
    }
}

/// Per-slice policy: each declared port resolved through its target port
#[derive(Clone, Debug, Default)]
pub struct SliceTargetPorts;

impl PortPolicy for SliceTargetPorts {
    fn compute_ports(&self, declared: &[ServicePort]) -> Vec<DesiredPort> {
        declared.iter().map(resolve_target_port).collect()
    }
}

/// Whole-object policy driven by the managed Service's ports
///
/// Same resolution as [`SliceTargetPorts`]; the resulting list is applied to
/// every subset.
#[derive(Clone, Debug, Default)]
pub struct ServiceTargetPorts;

impl PortPolicy for ServiceTargetPorts {
    fn compute_ports(&self, declared: &[ServicePort]) -> Vec<DesiredPort> {
        declared.iter().map(resolve_target_port).collect()
    }
}

/// Whole-object policy publishing one fixed (port, protocol) pair
#[derive(Clone, Debug)]
pub struct FixedApiserverPort {
    port: i32,
    protocol: String,
}

impl FixedApiserverPort {
    /// Create the policy from the configured apiserver port
    pub fn new(apiserver: &ApiserverPort) -> Self {
        Self {
            port: apiserver.port,
            protocol: apiserver.protocol.clone(),
        }
    }
}

impl PortPolicy for FixedApiserverPort {
    fn compute_ports(&self, _declared: &[ServicePort]) -> Vec<DesiredPort> {
        vec![DesiredPort {
            name: None,
            port: self.port,
            protocol: self.protocol.clone(),
        }]
    }

    fn uses_declared_ports(&self) -> bool {
        false
    }
}

/// Build the policy selected by configuration
pub fn port_policy(kind: &PortPolicyKind) -> Box<dyn PortPolicy> {
    match kind {
        PortPolicyKind::SliceTargetPort => Box::new(SliceTargetPorts),
        PortPolicyKind::ServiceTargetPort => Box::new(ServiceTargetPorts),
        PortPolicyKind::ApiserverFixed(apiserver) => Box::new(FixedApiserverPort::new(apiserver)),
    }
}

// =============================================================================
// Addresses
// =============================================================================

/// Rebuild source subsets with the desired ports
///
/// One output subset per source subset. Ready and not-ready addresses are
/// copied; the source's ports are dropped and replaced.
pub fn map_subsets(source: &[EndpointSubset], ports: &[DesiredPort]) -> Vec<EndpointSubset> {
    let ports: Vec<EndpointPort> = ports.iter().map(DesiredPort::to_endpoint_port).collect();
    source
        .iter()
        .map(|subset| EndpointSubset {
            addresses: non_empty(subset.addresses.clone()),
            not_ready_addresses: non_empty(subset.not_ready_addresses.clone()),
            ports: non_empty(Some(ports.clone())),
        })
        .collect()
}

/// Copy a source slice's endpoints
pub fn map_endpoints(source: &[Endpoint]) -> Vec<Endpoint> {
    source.to_vec()
}

/// Desired ports as slice ports
pub fn slice_ports(ports: &[DesiredPort]) -> Option<Vec<SlicePort>> {
    non_empty(Some(ports.iter().map(DesiredPort::to_slice_port).collect()))
}

// The API server omits empty lists, so `None` keeps comparisons with stored objects stable.
fn non_empty<T>(items: Option<Vec<T>>) -> Option<Vec<T>> {
    items.filter(|v| !v.is_empty())
}

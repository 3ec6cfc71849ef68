//! Process configuration for the endpoint copier
//!
//! Built once at startup from command-line flags and shared immutably through
//! the controller context.

use std::time::Duration;

use crate::identity::StaticIdentity;
use crate::Error;

/// Protocols accepted for the apiserver-fixed port override
const VALID_PROTOCOLS: [&str; 3] = ["TCP", "UDP", "SCTP"];

/// Default safety-net resync after a successful reconcile
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Which endpoint representation is synced
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    /// One managed `Endpoints` record, overwritten every cycle
    Endpoints,
    /// One managed `EndpointSlice` per source slice, upserted with server-side apply
    EndpointSlices,
}

/// Where the whole-object strategy takes its ports from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointsPortSource {
    /// A single fixed (port, protocol) pair from configuration
    Apiserver,
    /// The managed Service's declared ports, resolved through their target ports
    Service,
}

/// Fixed port published by the apiserver-fixed policy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiserverPort {
    /// Port number
    pub port: i32,
    /// Protocol (TCP, UDP or SCTP)
    pub protocol: String,
}

impl Default for ApiserverPort {
    fn default() -> Self {
        Self {
            port: 6443,
            protocol: crate::DEFAULT_PROTOCOL.to_string(),
        }
    }
}

/// The port-mapping policy chosen for this deployment
///
/// The three behaviors are mutually exclusive; exactly one is active per process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PortPolicyKind {
    /// Per-slice mode: numeric target port, else the declared port
    SliceTargetPort,
    /// Whole-object variant A: same rule as per-slice, applied to every subset
    ServiceTargetPort,
    /// Whole-object variant B: every subset gets the fixed apiserver port
    ApiserverFixed(ApiserverPort),
}

/// Operator configuration
#[derive(Clone, Debug)]
pub struct Config {
    /// Static (source, managed) identities
    pub identity: StaticIdentity,
    /// Endpoint representation being synced
    pub sync_mode: SyncMode,
    /// Port mapping policy
    pub port_policy: PortPolicyKind,
    /// Requeue interval after a successful reconcile
    pub resync_interval: Duration,
}

impl Config {
    /// Create a validated configuration
    pub fn new(
        identity: StaticIdentity,
        sync_mode: SyncMode,
        ports: EndpointsPortSource,
        apiserver: ApiserverPort,
        resync_interval: Duration,
    ) -> Result<Self, Error> {
        validate_apiserver_port(&apiserver)?;

        if identity.source.is_empty() || identity.managed.is_empty() {
            return Err(Error::validation(
                "static source and managed names and namespaces must be set",
            ));
        }

        let port_policy = match (sync_mode, ports) {
            (SyncMode::EndpointSlices, _) => PortPolicyKind::SliceTargetPort,
            (SyncMode::Endpoints, EndpointsPortSource::Service) => {
                PortPolicyKind::ServiceTargetPort
            }
            (SyncMode::Endpoints, EndpointsPortSource::Apiserver) => {
                PortPolicyKind::ApiserverFixed(apiserver)
            }
        };

        Ok(Self {
            identity,
            sync_mode,
            port_policy,
            resync_interval,
        })
    }
}

fn validate_apiserver_port(apiserver: &ApiserverPort) -> Result<(), Error> {
    if !(1..=65535).contains(&apiserver.port) {
        return Err(Error::validation(format!(
            "apiserver port {} is out of range 1-65535",
            apiserver.port
        )));
    }
    if !VALID_PROTOCOLS.contains(&apiserver.protocol.as_str()) {
        return Err(Error::validation(format!(
            "apiserver protocol {} must be one of {}",
            apiserver.protocol,
            VALID_PROTOCOLS.join(", ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ObjectKey;

    fn identity() -> StaticIdentity {
        StaticIdentity {
            source: ObjectKey::new("default", "kubernetes"),
            managed: ObjectKey::new("default", "kubernetes-vip"),
        }
    }

    #[test]
    fn slice_mode_always_uses_target_port_policy() {
        let config = Config::new(
            identity(),
            SyncMode::EndpointSlices,
            EndpointsPortSource::Apiserver,
            ApiserverPort::default(),
            DEFAULT_RESYNC_INTERVAL,
        )
        .expect("valid config");
        assert_eq!(config.port_policy, PortPolicyKind::SliceTargetPort);
    }

    #[test]
    fn endpoints_mode_selects_variant_by_port_source() {
        let fixed = Config::new(
            identity(),
            SyncMode::Endpoints,
            EndpointsPortSource::Apiserver,
            ApiserverPort {
                port: 443,
                protocol: "TCP".to_string(),
            },
            DEFAULT_RESYNC_INTERVAL,
        )
        .expect("valid config");
        assert_eq!(
            fixed.port_policy,
            PortPolicyKind::ApiserverFixed(ApiserverPort {
                port: 443,
                protocol: "TCP".to_string(),
            })
        );

        let service = Config::new(
            identity(),
            SyncMode::Endpoints,
            EndpointsPortSource::Service,
            ApiserverPort::default(),
            DEFAULT_RESYNC_INTERVAL,
        )
        .expect("valid config");
        assert_eq!(service.port_policy, PortPolicyKind::ServiceTargetPort);
    }

    #[test]
    fn invalid_apiserver_port_is_rejected() {
        for port in [0, -1, 65536] {
            let result = Config::new(
                identity(),
                SyncMode::Endpoints,
                EndpointsPortSource::Apiserver,
                ApiserverPort {
                    port,
                    protocol: "TCP".to_string(),
                },
                DEFAULT_RESYNC_INTERVAL,
            );
            assert!(result.is_err(), "port {port} should be rejected");
        }
    }

    #[test]
    fn invalid_protocol_is_rejected() {
        let result = Config::new(
            identity(),
            SyncMode::Endpoints,
            EndpointsPortSource::Apiserver,
            ApiserverPort {
                port: 6443,
                protocol: "HTTP".to_string(),
            },
            DEFAULT_RESYNC_INTERVAL,
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn empty_static_identity_is_rejected() {
        let mut id = identity();
        id.managed = ObjectKey::new("default", "");
        let result = Config::new(
            id,
            SyncMode::EndpointSlices,
            EndpointsPortSource::Apiserver,
            ApiserverPort::default(),
            DEFAULT_RESYNC_INTERVAL,
        );
        assert!(result.is_err());
    }
}

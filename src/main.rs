//! Endpoint copier operator - mirrors a Service's endpoints onto an alias Service

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use kube::Client;

use endpoint_copier_operator::config::{ApiserverPort, Config, EndpointsPortSource, SyncMode};
use endpoint_copier_operator::controller::Context;
use endpoint_copier_operator::health::{start_health_server, Readiness};
use endpoint_copier_operator::identity::{ObjectKey, StaticIdentity};
use endpoint_copier_operator::leader_election::{LeaderElector, LeaderGuard};
use endpoint_copier_operator::runner::build_controllers;
use endpoint_copier_operator::telemetry::{init_telemetry, TelemetryConfig};

/// Endpoint copier - keeps a managed Service's endpoints in sync with a source Service
#[derive(Parser, Debug)]
#[command(name = "endpoint-copier-operator", version, about, long_about = None)]
struct Cli {
    /// Name of the source Service
    #[arg(long, env = "DEFAULT_ENDPOINT_NAME", default_value = "kubernetes")]
    default_endpoint_name: String,

    /// Namespace of the source Service
    #[arg(long, env = "DEFAULT_ENDPOINT_NAMESPACE", default_value = "default")]
    default_endpoint_namespace: String,

    /// Name of the managed Service
    #[arg(long, env = "MANAGED_ENDPOINT_NAME", default_value = "kubernetes-vip")]
    managed_endpoint_name: String,

    /// Namespace of the managed Service
    #[arg(long, env = "MANAGED_ENDPOINT_NAMESPACE", default_value = "default")]
    managed_endpoint_namespace: String,

    /// Port published when copying whole Endpoints with the apiserver port policy
    #[arg(long, env = "APISERVER_PORT", default_value_t = 6443)]
    apiserver_port: i32,

    /// Protocol published with the apiserver port
    #[arg(long, env = "APISERVER_PROTOCOL", default_value = "TCP")]
    apiserver_protocol: String,

    /// Endpoint representation to sync
    #[arg(long, env = "SYNC_MODE", value_enum, default_value_t = SyncModeArg::EndpointSlices)]
    sync_mode: SyncModeArg,

    /// Port source for the whole-Endpoints mode
    #[arg(long, env = "ENDPOINTS_PORTS", value_enum, default_value_t = PortSourceArg::Apiserver)]
    endpoints_ports: PortSourceArg,

    /// Periodic requeue after a successful reconcile
    #[arg(long, env = "RESYNC_INTERVAL_SECS", default_value_t = 300)]
    resync_interval_secs: u64,

    /// Address of the liveness/readiness server
    #[arg(long, env = "HEALTH_PROBE_BIND_ADDRESS", default_value = "0.0.0.0:8081")]
    health_probe_bind_address: SocketAddr,

    /// Only reconcile while holding the leader lease
    #[arg(long, env = "LEADER_ELECT", default_value_t = false)]
    leader_elect: bool,

    /// Namespace holding the leader lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    leader_election_namespace: String,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SyncModeArg {
    Endpoints,
    EndpointSlices,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PortSourceArg {
    Apiserver,
    Service,
}

impl Cli {
    fn config(&self) -> anyhow::Result<Config> {
        let identity = StaticIdentity {
            source: ObjectKey::new(&self.default_endpoint_namespace, &self.default_endpoint_name),
            managed: ObjectKey::new(&self.managed_endpoint_namespace, &self.managed_endpoint_name),
        };
        let sync_mode = match self.sync_mode {
            SyncModeArg::Endpoints => SyncMode::Endpoints,
            SyncModeArg::EndpointSlices => SyncMode::EndpointSlices,
        };
        let ports = match self.endpoints_ports {
            PortSourceArg::Apiserver => EndpointsPortSource::Apiserver,
            PortSourceArg::Service => EndpointsPortSource::Service,
        };
        let apiserver = ApiserverPort {
            port: self.apiserver_port,
            protocol: self.apiserver_protocol.to_uppercase(),
        };
        Config::new(
            identity,
            sync_mode,
            ports,
            apiserver,
            Duration::from_secs(self.resync_interval_secs),
        )
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The kube client negotiates TLS through rustls; pin the aws-lc-rs provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    init_telemetry(TelemetryConfig::from_env())
        .map_err(|e| anyhow::anyhow!("failed to initialize telemetry: {}", e))?;

    let cli = Cli::parse();
    let config = cli.config()?;

    tracing::info!(
        source = %config.identity.source,
        managed = %config.identity.managed,
        sync_mode = ?config.sync_mode,
        port_policy = ?config.port_policy,
        resync_interval_secs = config.resync_interval.as_secs(),
        health_probe_bind_address = %cli.health_probe_bind_address,
        leader_elect = cli.leader_elect,
        "Starting endpoint copier operator"
    );

    let readiness = Readiness::new();
    tokio::spawn(start_health_server(
        cli.health_probe_bind_address,
        readiness.clone(),
    ));

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;

    let guard = if cli.leader_elect {
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| {
                format!("{}-{}", endpoint_copier_operator::OPERATOR_NAME, std::process::id())
            });
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            &cli.leader_election_namespace,
            &identity,
        ));
        Some(elector.acquire().await)
    } else {
        None
    };

    run(client, config, readiness, guard).await
}

async fn run(
    client: Client,
    config: Config,
    readiness: Readiness,
    mut guard: Option<LeaderGuard>,
) -> anyhow::Result<()> {
    let ctx = Arc::new(Context::builder(client.clone(), config).build());

    tracing::info!("Starting controllers:");
    let controllers = build_controllers(client, ctx);
    readiness.set(true);

    let lost = async {
        match guard.as_mut() {
            Some(g) => g.lost().await,
            None => futures::future::pending::<()>().await,
        }
    };

    let result = tokio::select! {
        _ = futures::future::join_all(controllers) => {
            tracing::info!("Controllers stopped");
            Ok(())
        }
        _ = lost => {
            tracing::error!("Leadership lost, exiting so a new leader can take over");
            Err(anyhow::anyhow!("leadership lost"))
        }
    };

    readiness.set(false);
    if let Some(g) = guard {
        if let Err(e) = g.release().await {
            tracing::warn!(error = %e, "Failed to release leader lease");
        }
    }
    result
}

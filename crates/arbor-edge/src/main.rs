//! Arbor Edge - attaches a child cluster to its parent

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, info};

use arbor_common::telemetry::{init_telemetry, TelemetryConfig};
use arbor_common::{
    DEFAULT_QUEUE_CAPACITY, DEFAULT_REPORT_INTERVAL_SECS, DEFAULT_SEND_TIMEOUT_SECS,
    DEFAULT_SHIM_CONNECT_TIMEOUT_SECS,
};
use arbor_edge::{
    local_bridge, ClusterRouter, EdgeConfig, EdgeHandler, InClusterClientProvider,
    KubeClientProvider,
};

/// Arbor edge router - keeps this cluster attached to the cluster tree
#[derive(Parser, Debug)]
#[command(name = "arbor-edge", version, about, long_about = None)]
struct Cli {
    /// Name of this cluster
    #[arg(long, env = "ARBOR_CLUSTER_NAME")]
    cluster_name: String,

    /// Display name announced to the parent (defaults to the cluster name)
    #[arg(long, env = "ARBOR_CLUSTER_USER_DEFINE_NAME", default_value = "")]
    cluster_user_define_name: String,

    /// Parent tunnel address (e.g., "10.0.0.1:8287" or ":8287")
    #[arg(long, env = "ARBOR_PARENT_CLUSTER")]
    parent_cluster: String,

    /// Remote shim address; selects the remote shim when set
    #[arg(long, env = "ARBOR_REMOTE_SHIM_ADDR", default_value = "")]
    remote_shim_addr: String,

    /// Execute commands in-process against the local cluster API
    #[arg(long, env = "ARBOR_LOCAL_SHIM")]
    local_shim: bool,

    /// Seconds between subtree reports
    #[arg(long, env = "ARBOR_REPORT_INTERVAL_SECS", default_value_t = DEFAULT_REPORT_INTERVAL_SECS)]
    report_interval_secs: u64,

    /// Seconds allowed for a single send toward the parent
    #[arg(long, env = "ARBOR_SEND_TIMEOUT_SECS", default_value_t = DEFAULT_SEND_TIMEOUT_SECS)]
    send_timeout_secs: u64,

    /// Seconds allowed to reach the remote shim at startup
    #[arg(long, env = "ARBOR_SHIM_CONNECT_TIMEOUT_SECS", default_value_t = DEFAULT_SHIM_CONNECT_TIMEOUT_SECS)]
    shim_connect_timeout_secs: u64,

    /// Capacity of the local bridge queues
    #[arg(long, env = "ARBOR_QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Emit logs as JSON lines
    #[arg(long, env = "ARBOR_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn edge_config(&self) -> EdgeConfig {
        EdgeConfig {
            cluster_name: self.cluster_name.clone(),
            cluster_user_define_name: self.cluster_user_define_name.clone(),
            parent_cluster: self.parent_cluster.clone(),
            kube_provider: self
                .local_shim
                .then(|| Arc::new(InClusterClientProvider) as Arc<dyn KubeClientProvider>),
            remote_shim_addr: self.remote_shim_addr.clone(),
            report_interval: Duration::from_secs(self.report_interval_secs),
            send_timeout: Duration::from_secs(self.send_timeout_secs),
            shim_connect_timeout: Duration::from_secs(self.shim_connect_timeout_secs),
            queue_capacity: self.queue_capacity,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        service_name: "arbor-edge".to_string(),
        json: cli.log_json,
    })?;

    let config = cli.edge_config();
    config.validate()?;
    let (queues, mut bridge) = local_bridge(config.queue_capacity);

    // Stand-in for downstream consumers: drain inbound envelopes so the
    // dispatcher never blocks on a full queue.
    let consumer = tokio::spawn(async move {
        while let Some(msg) = bridge.from_parent.recv().await {
            let command = msg.command_type();
            let head = msg.head.unwrap_or_default();
            debug!(
                message_id = %head.message_id,
                command = ?command,
                selector = %head.cluster_selector,
                "Inbound envelope"
            );
        }
    });

    let edge = EdgeHandler::new(config, queues, ClusterRouter::new());
    edge.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    edge.shutdown().await;
    consumer.abort();
    Ok(())
}

//! Edge router configuration and the local bridge queues
//!
//! [`EdgeConfig`] is loaded by the caller (the `arbor-edge` binary reads it
//! from flags and environment) and validated once before the router starts.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arbor_common::{
    DEFAULT_QUEUE_CAPACITY, DEFAULT_REPORT_INTERVAL_SECS, DEFAULT_SEND_TIMEOUT_SECS,
    DEFAULT_SHIM_CONNECT_TIMEOUT_SECS,
};
use arbor_proto::ClusterMessage;
use tokio::sync::mpsc;

use crate::error::EdgeError;
use crate::shim::KubeClientProvider;

/// Default time allowed to dial the parent
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime configuration of an edge router
#[derive(Clone)]
pub struct EdgeConfig {
    /// Name of this cluster in the tree
    pub cluster_name: String,
    /// Human-friendly name announced to the parent (defaults to `cluster_name`)
    pub cluster_user_define_name: String,
    /// Address of the parent cluster's tunnel endpoint (e.g., "10.0.0.1:8287")
    pub parent_cluster: String,
    /// Local execution handle; selects the in-process shim
    pub kube_provider: Option<Arc<dyn KubeClientProvider>>,
    /// Address of a remote shim service; selects the remote shim when set
    pub remote_shim_addr: String,
    /// Period between subtree reports
    pub report_interval: Duration,
    /// Upper bound on a single tunnel send
    pub send_timeout: Duration,
    /// Time allowed to reach the remote shim at startup
    pub shim_connect_timeout: Duration,
    /// Time allowed to dial the parent
    pub connect_timeout: Duration,
    /// Capacity of each local queue
    pub queue_capacity: usize,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            cluster_user_define_name: String::new(),
            parent_cluster: String::new(),
            kube_provider: None,
            remote_shim_addr: String::new(),
            report_interval: Duration::from_secs(DEFAULT_REPORT_INTERVAL_SECS),
            send_timeout: Duration::from_secs(DEFAULT_SEND_TIMEOUT_SECS),
            shim_connect_timeout: Duration::from_secs(DEFAULT_SHIM_CONNECT_TIMEOUT_SECS),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl fmt::Debug for EdgeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdgeConfig")
            .field("cluster_name", &self.cluster_name)
            .field("cluster_user_define_name", &self.cluster_user_define_name)
            .field("parent_cluster", &self.parent_cluster)
            .field("local_shim", &self.kube_provider.is_some())
            .field("remote_shim_addr", &self.remote_shim_addr)
            .field("report_interval", &self.report_interval)
            .field("send_timeout", &self.send_timeout)
            .finish_non_exhaustive()
    }
}

impl EdgeConfig {
    /// Check the preconditions for starting an edge router.
    ///
    /// Requires a cluster name, a parent address, at least one shim mode and
    /// non-zero queue capacity and report interval.
    pub fn validate(&self) -> Result<(), EdgeError> {
        if self.cluster_name.is_empty() {
            return Err(EdgeError::config("cluster_name", "cluster name is not set"));
        }
        if self.parent_cluster.is_empty() {
            return Err(EdgeError::config(
                "parent_cluster",
                "parent cluster address is not set",
            ));
        }
        if self.kube_provider.is_none() && self.remote_shim_addr.is_empty() {
            return Err(EdgeError::config(
                "remote_shim_addr",
                "neither a local execution handle nor a remote shim address is set",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(EdgeError::config(
                "queue_capacity",
                "queue capacity must be at least 1",
            ));
        }
        if self.report_interval.is_zero() {
            return Err(EdgeError::config(
                "report_interval",
                "report interval must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Whether commands run on a remote shim.
    ///
    /// A remote address wins over a local handle when both are present.
    pub fn is_remote_shim(&self) -> bool {
        !self.remote_shim_addr.is_empty()
    }

    /// Name announced to the parent
    pub fn user_define_name(&self) -> &str {
        if self.cluster_user_define_name.is_empty() {
            &self.cluster_name
        } else {
            &self.cluster_user_define_name
        }
    }
}

/// Turn a configured address into something dialable.
///
/// `":8287"` means the local host, as it does for the parent's listener.
pub fn dial_address(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("127.0.0.1{}", addr)
    } else {
        addr.to_string()
    }
}

/// Router side of the local bridge
pub struct EdgeQueues {
    pub(crate) to_parent_tx: mpsc::Sender<ClusterMessage>,
    pub(crate) to_parent_rx: mpsc::Receiver<ClusterMessage>,
    pub(crate) to_local_tx: mpsc::Sender<ClusterMessage>,
}

/// Consumer side of the local bridge, handed to local collaborators
pub struct LocalBridge {
    /// Envelopes to transmit toward the parent
    pub to_parent: mpsc::Sender<ClusterMessage>,
    /// Every envelope received from the parent, matched or not
    pub from_parent: mpsc::Receiver<ClusterMessage>,
}

/// Create the pair of queues linking the router with local collaborators.
///
/// A zero capacity is raised to one.
pub fn local_bridge(capacity: usize) -> (EdgeQueues, LocalBridge) {
    let capacity = capacity.max(1);
    let (to_parent_tx, to_parent_rx) = mpsc::channel(capacity);
    let (to_local_tx, from_parent) = mpsc::channel(capacity);

    let queues = EdgeQueues {
        to_parent_tx: to_parent_tx.clone(),
        to_parent_rx,
        to_local_tx,
    };
    let bridge = LocalBridge {
        to_parent: to_parent_tx,
        from_parent,
    };
    (queues, bridge)
}

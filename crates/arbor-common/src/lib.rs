//! Common utilities for Arbor: logging setup, retry, shared constants

#![deny(missing_docs)]

pub mod retry;
pub mod telemetry;

/// Name of the cluster at the top of the tree. It has no parent, so it never
/// runs an edge router.
pub const ROOT_CLUSTER_NAME: &str = "root";

/// Default period between subtree reports
pub const DEFAULT_REPORT_INTERVAL_SECS: u64 = 10;

/// Default bound on a single tunnel send
pub const DEFAULT_SEND_TIMEOUT_SECS: u64 = 5;

/// Default time allowed to reach a remote shim at startup
pub const DEFAULT_SHIM_CONNECT_TIMEOUT_SECS: u64 = 3;

/// Default capacity of the edge router's local queues
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Largest frame accepted on a tunnel (16 MiB)
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

//! Arbor Edge - child cluster message router
//!
//! This crate provides the runtime every non-root cluster runs to stay
//! attached to the cluster tree:
//!
//! - **Edge Router**: owns the upward tunnel, the local bridge queues and the
//!   background loops ([`EdgeHandler`])
//! - **Dispatch**: decodes envelopes from the parent, applies the cluster
//!   selector and routes each command by type
//! - **Shim**: pluggable execution of `ControlReq` tasks, in-process or on a
//!   remote shim service
//! - **Subtree Reporting**: periodic `NeighborRoute` reports built from the
//!   [`ClusterRouter`]
//!
//! # Architecture
//!
//! The edge maintains an **outbound** connection to its parent. Envelopes
//! produced locally are queued and forwarded up the tunnel in FIFO order;
//! envelopes from the parent are delivered to local consumers and, when the
//! selector addresses this cluster, executed here.

pub mod cluster_router;
pub mod config;
mod dispatch;
pub mod edge;
pub mod error;
pub mod shim;
pub mod subtree;
pub mod tunnel;

pub use cluster_router::ClusterRouter;
pub use config::{dial_address, local_bridge, EdgeConfig, EdgeQueues, LocalBridge};
pub use edge::{forward_to_tunnel, EdgeHandler};
pub use error::EdgeError;
pub use shim::{
    build_shim_client, InClusterClientProvider, KubeApiHandler, KubeClientProvider,
    LocalShimClient, RemoteShimClient, ShimClient, ShimError, ShimHandler,
};
pub use subtree::SubtreeReporter;
pub use tunnel::{
    ConnectHook, DisconnectHook, ReceiveHandler, TcpTunnel, Tunnel, TunnelConfig, TunnelError,
};

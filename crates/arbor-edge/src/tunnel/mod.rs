//! Tunnel - the upward byte pipe to the parent cluster
//!
//! The router only depends on the [`Tunnel`] trait: send bytes up, get bytes
//! back through a registered callback, and hear about connection changes.
//! [`TcpTunnel`] is the default implementation.

mod tcp;

pub use tcp::{TcpTunnel, TunnelConfig};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use thiserror::Error;

/// Callback for inbound frames: `(cluster_name, frame)`
pub type ReceiveHandler = Arc<dyn Fn(String, Bytes) -> BoxFuture<'static, ()> + Send + Sync>;

/// Called every time the tunnel (re)connects
pub type ConnectHook = Arc<dyn Fn() + Send + Sync>;

/// Called every time the tunnel loses its connection
pub type DisconnectHook = Arc<dyn Fn() + Send + Sync>;

/// Tunnel errors
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Could not reach the parent
    #[error("failed to connect to {addr}: {message}")]
    Connect {
        /// Parent address
        addr: String,
        /// Description of the failure
        message: String,
    },

    /// Send did not complete in time
    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),

    /// Tunnel is stopped or was never started
    #[error("tunnel closed")]
    Closed,

    /// `start` called twice
    #[error("tunnel already started")]
    AlreadyStarted,
}

/// Bidirectional connection toward the parent cluster
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Queue `frame` for the parent, waiting at most the configured send timeout
    async fn send(&self, frame: Bytes) -> Result<(), TunnelError>;

    /// Set the callback for frames arriving from the parent
    fn register_receive_handler(&self, handler: ReceiveHandler);

    /// Set the hook run after every successful connect
    fn register_after_connect_hook(&self, hook: ConnectHook);

    /// Set the hook run after every disconnect
    fn register_after_disconnect_hook(&self, hook: DisconnectHook);

    /// Connect and begin pumping frames. Fails if the first connect fails.
    async fn start(&self) -> Result<(), TunnelError>;

    /// Stop pumping frames and close the connection
    async fn stop(&self) -> Result<(), TunnelError>;
}

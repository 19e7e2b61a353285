//! Shim - pluggable execution of control tasks
//!
//! A [`ShimClient`] takes a `ControlReq` envelope and returns the `ControlResp`
//! envelope answering it. Two implementations exist:
//!
//! - [`LocalShimClient`]: runs registered [`ShimHandler`]s in-process, keyed by
//!   task destination
//! - [`RemoteShimClient`]: forwards envelopes to a shim service over gRPC
//!
//! Which one runs is decided once at startup by [`build_shim_client`].

mod kube_api;
mod local;
mod remote;

pub use kube_api::{InClusterClientProvider, KubeApiHandler, KubeClientProvider};
pub use local::LocalShimClient;
pub use remote::RemoteShimClient;

#[cfg(test)]
pub use kube_api::MockKubeClientProvider;

use std::sync::Arc;

use arbor_proto::{ClusterMessage, ControllerTask, DecodeError};
use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::config::EdgeConfig;
use crate::error::EdgeError;

/// Executes a control envelope and produces its response envelope
#[async_trait]
pub trait ShimClient: Send + Sync {
    /// Execute `request` and return the response envelope
    async fn execute(&self, request: ClusterMessage) -> Result<ClusterMessage, ShimError>;
}

/// Executes tasks for one destination inside a [`LocalShimClient`]
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ShimHandler: Send + Sync {
    /// Execute `task`, returning the encoded response body
    async fn handle(&self, task: ControllerTask) -> Result<Vec<u8>, ShimError>;
}

/// Shim execution errors
#[derive(Debug, Error)]
pub enum ShimError {
    /// Remote shim could not be reached
    #[error("shim at {addr} unavailable: {message}")]
    Unavailable {
        /// Address that was dialed
        addr: String,
        /// Description of the failure
        message: String,
    },

    /// No handler is registered for the task's destination
    #[error("no handler registered for destination {0}")]
    NoHandler(String),

    /// A handler is already registered for the destination
    #[error("handler already registered for destination {0}")]
    DuplicateHandler(String),

    /// Request body could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Remote shim answered with an error status
    #[error("remote shim returned {code:?}: {message}")]
    Remote {
        /// gRPC status code
        code: tonic::Code,
        /// Status message
        message: String,
    },

    /// Handler failed to execute the task
    #[error("handler failed: {0}")]
    Handler(String),
}

/// Build the shim client selected by `config`.
///
/// A remote address selects [`RemoteShimClient`] and must be reachable within
/// `shim_connect_timeout`. Otherwise the local execution handle backs a
/// [`LocalShimClient`] serving the default destination.
pub async fn build_shim_client(config: &EdgeConfig) -> Result<Arc<dyn ShimClient>, EdgeError> {
    if config.is_remote_shim() {
        let client =
            RemoteShimClient::connect(&config.remote_shim_addr, config.shim_connect_timeout)
                .await?;
        info!(addr = %config.remote_shim_addr, "Using remote shim");
        return Ok(Arc::new(client));
    }

    let provider = config.kube_provider.clone().ok_or_else(|| {
        EdgeError::config(
            "kube_provider",
            "local shim selected without a local execution handle",
        )
    })?;
    info!("Using local shim");
    Ok(Arc::new(LocalShimClient::with_kube(provider)))
}

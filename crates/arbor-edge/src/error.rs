//! Error type for the edge router
//!
//! Only configuration and startup errors ever leave [`EdgeHandler::start`];
//! per-message failures are logged where they happen.
//!
//! [`EdgeHandler::start`]: crate::EdgeHandler::start

use arbor_proto::DecodeError;
use thiserror::Error;

use crate::shim::ShimError;
use crate::tunnel::TunnelError;

/// Main error type for edge router operations
#[derive(Debug, Error)]
pub enum EdgeError {
    /// Missing or contradictory configuration
    #[error("invalid configuration [{field}]: {message}")]
    Config {
        /// Offending configuration field
        field: &'static str,
        /// Description of what's invalid
        message: String,
    },

    /// Tunnel could not be started
    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Shim client could not be constructed
    #[error("shim error: {0}")]
    Shim(#[from] ShimError),

    /// Envelope or body could not be decoded
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// `start` was called on a router that is already running
    #[error("edge router already started")]
    AlreadyStarted,
}

impl EdgeError {
    /// Create a configuration error for `field`
    pub fn config(field: &'static str, message: impl Into<String>) -> Self {
        Self::Config {
            field,
            message: message.into(),
        }
    }

    /// Whether this is a configuration error
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }
}

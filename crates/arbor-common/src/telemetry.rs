//! Logging initialization
//!
//! Installs a `tracing` subscriber with an `EnvFilter` (overridable through
//! `RUST_LOG`) and either JSON or human-readable output. The startup line
//! carries the service name and, when running inside a pod, the pod identity
//! taken from the downward-API environment variables.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,arbor=debug,tower=warn,hyper=warn,h2=warn";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A global subscriber was already installed, or the filter was invalid
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line (e.g., "arbor-edge")
    pub service_name: String,
    /// Emit JSON lines instead of the human-readable format
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "arbor".to_string(),
            json: true,
        }
    }
}

/// Pod identity from the downward API, as `(field, value)` pairs
pub fn pod_identity() -> Vec<(&'static str, String)> {
    [
        ("k8s.pod.name", "POD_NAME"),
        ("k8s.namespace.name", "POD_NAMESPACE"),
        ("k8s.node.name", "NODE_NAME"),
    ]
    .into_iter()
    .filter_map(|(field, var)| std::env::var(var).ok().map(|v| (field, v)))
    .collect()
}

/// Initialize the global tracing subscriber.
///
/// # Example
///
/// ```ignore
/// use arbor_common::telemetry::{init_telemetry, TelemetryConfig};
///
/// init_telemetry(TelemetryConfig {
///     service_name: "arbor-edge".to_string(),
///     json: false,
/// })?;
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = if config.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };
    result.map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    let identity = pod_identity();
    tracing::info!(
        service = %config.service_name,
        version = env!("CARGO_PKG_VERSION"),
        pod = ?identity,
        "Telemetry initialized"
    );

    Ok(())
}

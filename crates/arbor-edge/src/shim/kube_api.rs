//! Cluster API handler for the local shim
//!
//! Serves the default `api` destination by replaying a [`ControllerTask`] as a
//! raw HTTP request against the local Kubernetes API server. The client is
//! created lazily on the first task and reused afterwards.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arbor_proto::{ControllerTask, ControllerTaskResponse};
use async_trait::async_trait;
use http::Request;
use kube::client::Body;
use prost::Message;
use tokio::sync::OnceCell;
use tracing::{debug, error};

use super::{ShimError, ShimHandler};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates Kubernetes clients, so tests can run without a cluster
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KubeClientProvider: Send + Sync {
    /// Create a new Kubernetes client
    async fn create(&self) -> Result<kube::Client, kube::Error>;
}

/// Creates clients from in-cluster config (or the local kubeconfig)
#[derive(Clone, Debug, Default)]
pub struct InClusterClientProvider;

#[async_trait]
impl KubeClientProvider for InClusterClientProvider {
    async fn create(&self) -> Result<kube::Client, kube::Error> {
        let mut config = kube::Config::infer()
            .await
            .map_err(kube::Error::InferConfig)?;
        config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
        config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
        kube::Client::try_from(config)
    }
}

/// Executes control tasks against the local cluster API
pub struct KubeApiHandler {
    provider: Arc<dyn KubeClientProvider>,
    client: OnceCell<kube::Client>,
}

impl KubeApiHandler {
    /// Create a handler that builds its client from `provider` on first use
    pub fn new(provider: Arc<dyn KubeClientProvider>) -> Self {
        Self {
            provider,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&kube::Client, ShimError> {
        self.client
            .get_or_try_init(|| async {
                self.provider.create().await.map_err(|e| {
                    error!(error = %e, "Failed to create K8s client for local shim");
                    ShimError::Handler(format!("cluster client unavailable: {}", e))
                })
            })
            .await
    }
}

#[async_trait]
impl ShimHandler for KubeApiHandler {
    async fn handle(&self, task: ControllerTask) -> Result<Vec<u8>, ShimError> {
        let method = match parse_method(&task.method) {
            Some(m) => m,
            None => {
                return Ok(task_response(
                    400,
                    format!("unsupported method: {}", task.method).into_bytes(),
                ))
            }
        };
        let request = match build_request(method, &task) {
            Ok(r) => r,
            Err(message) => return Ok(task_response(400, message.into_bytes())),
        };

        let client = self.client().await?;

        debug!(method = %task.method, uri = %task.uri, "Executing cluster API request");
        let response = match client.send(request).await {
            Ok(r) => r,
            Err(e) => {
                error!(uri = %task.uri, error = %e, "Cluster API request failed");
                return Ok(task_response(
                    502,
                    format!("request failed: {}", e).into_bytes(),
                ));
            }
        };

        let status = response.status().as_u16();
        match response.into_body().collect_bytes().await {
            Ok(bytes) => Ok(task_response(status, bytes.to_vec())),
            Err(e) => {
                error!(uri = %task.uri, error = %e, "Failed to read cluster API response");
                Ok(task_response(
                    502,
                    format!("failed to read response: {}", e).into_bytes(),
                ))
            }
        }
    }
}

/// Map a task method onto an HTTP method; `LIST` reads as `GET`
pub(crate) fn parse_method(method: &str) -> Option<http::Method> {
    match method.to_uppercase().as_str() {
        "GET" | "LIST" => Some(http::Method::GET),
        "POST" => Some(http::Method::POST),
        "PUT" => Some(http::Method::PUT),
        "PATCH" => Some(http::Method::PATCH),
        "DELETE" => Some(http::Method::DELETE),
        _ => None,
    }
}

/// Build the HTTP request replaying `task`
pub(crate) fn build_request(
    method: http::Method,
    task: &ControllerTask,
) -> Result<Request<Body>, String> {
    if task.uri.is_empty() {
        return Err("task has no uri".to_string());
    }

    let mut builder = Request::builder()
        .method(method.clone())
        .uri(&task.uri)
        .header(http::header::ACCEPT, "application/json");

    if !task.body.is_empty() {
        let content_type = if method == http::Method::PATCH {
            "application/merge-patch+json"
        } else {
            "application/json"
        };
        builder = builder.header(http::header::CONTENT_TYPE, content_type);
    }

    builder
        .body(Body::from(task.body.clone()))
        .map_err(|e| format!("failed to build request: {}", e))
}

/// Encode a [`ControllerTaskResponse`] stamped with the current time
pub(crate) fn task_response(status_code: u16, body: Vec<u8>) -> Vec<u8> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();
    ControllerTaskResponse {
        timestamp,
        status_code: i32::from(status_code),
        body,
    }
    .encode_to_vec()
}

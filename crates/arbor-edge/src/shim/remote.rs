//! Shim client backed by a remote shim service

use std::time::Duration;

use arbor_proto::shim_service::ShimServiceClient;
use arbor_proto::ClusterMessage;
use async_trait::async_trait;
use tonic::transport::Endpoint;
use tracing::debug;

use super::{ShimClient, ShimError};
use crate::config::dial_address;

/// Forwards control envelopes to a shim service over gRPC
#[derive(Clone, Debug)]
pub struct RemoteShimClient {
    addr: String,
    client: ShimServiceClient,
}

impl RemoteShimClient {
    /// Connect to the shim service at `addr`, failing after `timeout`.
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self, ShimError> {
        let unavailable = |message: String| ShimError::Unavailable {
            addr: addr.to_string(),
            message,
        };

        let endpoint = Endpoint::from_shared(format!("http://{}", dial_address(addr)))
            .map_err(|e| unavailable(e.to_string()))?
            .connect_timeout(timeout);

        let channel = tokio::time::timeout(timeout, endpoint.connect())
            .await
            .map_err(|_| unavailable(format!("connect timed out after {:?}", timeout)))?
            .map_err(|e| unavailable(e.to_string()))?;

        debug!(addr = %addr, "Connected to remote shim");
        Ok(Self {
            addr: addr.to_string(),
            client: ShimServiceClient::new(channel),
        })
    }
}

#[async_trait]
impl ShimClient for RemoteShimClient {
    async fn execute(&self, request: ClusterMessage) -> Result<ClusterMessage, ShimError> {
        let mut client = self.client.clone();
        let response = client.execute(request).await.map_err(|status| {
            debug!(shim = %self.addr, code = ?status.code(), "Remote shim rejected request");
            ShimError::Remote {
                code: status.code(),
                message: status.message().to_string(),
            }
        })?;
        Ok(response.into_inner())
    }
}

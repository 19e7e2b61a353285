//! gRPC client for the remote shim service.
//!
//! The shim service exposes a single unary method, `Do`, that executes a
//! `ControlReq` envelope and answers with the `ControlResp` envelope. This is
//! the same call shape `tonic-build` would generate for
//!
//! ```text
//! service ShimService {
//!   rpc Do(ClusterMessage) returns (ClusterMessage);
//! }
//! ```

use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;

use crate::ClusterMessage;

/// Fully-qualified path of the `Do` method
pub const SHIM_DO_PATH: &str = "/clustershim.ShimService/Do";

/// Client for `clustershim.ShimService`
#[derive(Clone, Debug)]
pub struct ShimServiceClient {
    inner: tonic::client::Grpc<Channel>,
}

impl ShimServiceClient {
    /// Wrap an established channel
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    /// Execute a command envelope on the shim
    pub async fn execute(
        &mut self,
        request: impl tonic::IntoRequest<ClusterMessage>,
    ) -> Result<tonic::Response<ClusterMessage>, tonic::Status> {
        self.inner.ready().await.map_err(|e| {
            tonic::Status::new(
                tonic::Code::Unavailable,
                format!("shim service was not ready: {}", e),
            )
        })?;

        let codec: ProstCodec<ClusterMessage, ClusterMessage> = ProstCodec::default();
        let path = PathAndQuery::from_static(SHIM_DO_PATH);
        self.inner.unary(request.into_request(), path, codec).await
    }
}

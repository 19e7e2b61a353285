//! In-process shim keyed by task destination

use std::collections::HashMap;
use std::sync::Arc;

use arbor_proto::{control_response, ClusterMessage, DecodeError, DEST_API};
use async_trait::async_trait;
use tracing::debug;

use super::{KubeApiHandler, KubeClientProvider, ShimClient, ShimError, ShimHandler};

/// Runs control tasks on handlers registered per destination
#[derive(Default)]
pub struct LocalShimClient {
    handlers: HashMap<String, Arc<dyn ShimHandler>>,
}

impl LocalShimClient {
    /// Create a shim with no handlers
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shim serving the default destination through the cluster API
    pub fn with_kube(provider: Arc<dyn KubeClientProvider>) -> Self {
        let mut shim = Self::new();
        shim.handlers
            .insert(DEST_API.to_string(), Arc::new(KubeApiHandler::new(provider)));
        shim
    }

    /// Register `handler` for `destination`; a destination has at most one handler
    pub fn register(
        &mut self,
        destination: impl Into<String>,
        handler: Arc<dyn ShimHandler>,
    ) -> Result<(), ShimError> {
        let destination = destination.into();
        if self.handlers.contains_key(&destination) {
            return Err(ShimError::DuplicateHandler(destination));
        }
        self.handlers.insert(destination, handler);
        Ok(())
    }

    /// Destinations with a registered handler, sorted
    pub fn destinations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ShimClient for LocalShimClient {
    async fn execute(&self, request: ClusterMessage) -> Result<ClusterMessage, ShimError> {
        let head = request.head.clone().ok_or(DecodeError::MissingHead)?;
        let task = request.controller_task()?;
        let destination = task.effective_destination().to_string();

        let handler = self
            .handlers
            .get(&destination)
            .ok_or_else(|| ShimError::NoHandler(destination.clone()))?;

        debug!(
            message_id = %head.message_id,
            destination = %destination,
            method = %task.method,
            "Executing control task locally"
        );
        let body = handler.handle(task).await?;

        Ok(control_response(&head, "", body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shim::MockShimHandler;
    use arbor_proto::{CommandType, ControllerTask, MessageHead};
    use prost::Message;

    fn request(destination: &str) -> ClusterMessage {
        let task = ControllerTask {
            destination: destination.to_string(),
            method: "GET".to_string(),
            uri: "/api/v1/namespaces".to_string(),
            body: vec![],
        };
        ClusterMessage::new(
            MessageHead {
                message_id: "m-1".to_string(),
                command: CommandType::ControlReq as i32,
                parent_cluster_name: "root".to_string(),
                ..Default::default()
            },
            task.encode_to_vec(),
        )
    }

    fn echo_handler(reply: &'static [u8]) -> Arc<dyn ShimHandler> {
        let mut handler = MockShimHandler::new();
        handler
            .expect_handle()
            .returning(move |_| Ok(reply.to_vec()));
        Arc::new(handler)
    }

    #[tokio::test]
    async fn test_executes_registered_handler() {
        let mut shim = LocalShimClient::new();
        shim.register("echo", echo_handler(b"pong")).unwrap();

        let resp = shim.execute(request("echo")).await.unwrap();
        let head = resp.head.as_ref().unwrap();
        assert_eq!(resp.command_type(), CommandType::ControlResp);
        assert_eq!(head.message_id, "m-1");
        assert_eq!(head.parent_cluster_name, "root");
        assert_eq!(resp.body, b"pong");
    }

    #[tokio::test]
    async fn test_empty_destination_resolves_to_api() {
        let mut shim = LocalShimClient::new();
        shim.register(DEST_API, echo_handler(b"api")).unwrap();

        let resp = shim.execute(request("")).await.unwrap();
        assert_eq!(resp.body, b"api");
    }

    #[tokio::test]
    async fn test_unknown_destination() {
        let shim = LocalShimClient::new();
        match shim.execute(request("nowhere")).await {
            Err(ShimError::NoHandler(dest)) => assert_eq!(dest, "nowhere"),
            other => panic!("expected NoHandler, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let mut shim = LocalShimClient::new();
        shim.register("echo", echo_handler(b"1")).unwrap();
        let err = shim.register("echo", echo_handler(b"2")).unwrap_err();
        assert!(matches!(err, ShimError::DuplicateHandler(d) if d == "echo"));
        assert_eq!(shim.destinations(), vec!["echo"]);
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let mut handler = MockShimHandler::new();
        handler
            .expect_handle()
            .returning(|_| Err(ShimError::Handler("boom".to_string())));
        let mut shim = LocalShimClient::new();
        shim.register("echo", Arc::new(handler)).unwrap();

        let err = shim.execute(request("echo")).await.unwrap_err();
        assert!(matches!(err, ShimError::Handler(_)));
    }

    #[tokio::test]
    async fn test_malformed_task_is_decode_error() {
        let shim = LocalShimClient::new();
        let mut req = request("echo");
        req.body = vec![0xff, 0xff, 0xff];

        let err = shim.execute(req).await.unwrap_err();
        assert!(matches!(err, ShimError::Decode(_)));
    }

    #[test]
    fn test_with_kube_serves_api() {
        let provider = Arc::new(crate::shim::MockKubeClientProvider::new());
        let shim = LocalShimClient::with_kube(provider);
        assert_eq!(shim.destinations(), vec![DEST_API]);
    }
}

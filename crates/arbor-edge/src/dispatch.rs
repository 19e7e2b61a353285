//! Inbound dispatch shared by the edge router and its tunnel callback

use std::sync::{Arc, OnceLock};

use arbor_proto::{control_response, selector_matches, ClusterMessage, CommandType, DecodeError};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::cluster_router::ClusterRouter;
use crate::config::EdgeConfig;
use crate::error::EdgeError;
use crate::shim::ShimClient;
use crate::tunnel::Tunnel;

/// State reachable from the tunnel callback and background tasks
pub(crate) struct EdgeInner {
    pub(crate) config: EdgeConfig,
    pub(crate) router: ClusterRouter,
    pub(crate) to_parent_tx: mpsc::Sender<ClusterMessage>,
    pub(crate) to_local_tx: mpsc::Sender<ClusterMessage>,
    pub(crate) shim: OnceLock<Arc<dyn ShimClient>>,
    pub(crate) tunnel: OnceLock<Arc<dyn Tunnel>>,
}

impl EdgeInner {
    /// Handle one frame from the parent.
    ///
    /// Every decodable envelope is copied to local consumers; only envelopes
    /// whose selector addresses `cluster_name` are executed here.
    pub(crate) async fn receive_message_from_tunnel(&self, cluster_name: &str, data: &[u8]) {
        let msg = match ClusterMessage::from_bytes(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, len = data.len(), "Dropping undecodable frame from parent");
                return;
            }
        };

        if self.to_local_tx.send(msg.clone()).await.is_err() {
            debug!("Local consumer queue closed, inbound copy dropped");
        }

        let selector = msg
            .head
            .as_ref()
            .map(|h| h.cluster_selector.as_str())
            .unwrap_or_default();
        if !selector_matches(selector, cluster_name) {
            debug!(cluster = %cluster_name, selector = %selector, "Envelope not addressed to this cluster");
            return;
        }

        if let Err(e) = self.handle_message(msg).await {
            warn!(error = %e, "Failed to handle envelope from parent");
        }
    }

    /// Route an addressed envelope by command.
    ///
    /// Fails only on a missing head or when the body of a known command cannot
    /// be decoded; shim failures are logged and never returned.
    pub(crate) async fn handle_message(&self, msg: ClusterMessage) -> Result<(), EdgeError> {
        if msg.head.is_none() {
            return Err(DecodeError::MissingHead.into());
        }
        match msg.command_type() {
            CommandType::NeighborRoute => {
                let report = msg.subtree_report()?;
                let added = self.router.record_report(&report).await;
                debug!(reporter = %report.cluster_name, added, "Neighbor route received");
            }
            CommandType::ControlReq => {
                msg.controller_task()?;
                self.execute_control(msg);
            }
            CommandType::ControlMultiReq => {
                let task = msg.control_multi_task()?;
                debug!(
                    destination = %task.destination,
                    clusters = task.cluster_selectors.len(),
                    "Multi-cluster task left to local consumers"
                );
            }
            CommandType::ControlResp | CommandType::Reserved => {}
        }
        Ok(())
    }

    /// Run a ControlReq on the shim without blocking the caller
    fn execute_control(&self, msg: ClusterMessage) {
        let Some(shim) = self.shim.get().cloned() else {
            error!("Control request received before the shim was built, dropping");
            return;
        };
        let Some(head) = msg.head.clone() else {
            return;
        };
        let cluster_name = self.config.cluster_name.clone();
        let to_parent_tx = self.to_parent_tx.clone();

        tokio::spawn(async move {
            match shim.execute(msg).await {
                Ok(resp) => {
                    let reply = control_response(&head, &cluster_name, resp.body);
                    if to_parent_tx.send(reply).await.is_err() {
                        warn!(message_id = %head.message_id, "Outbound queue closed, response dropped");
                    }
                }
                Err(e) => {
                    error!(message_id = %head.message_id, error = %e, "Shim failed to execute control request");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use arbor_proto::{ControlMultiTask, ControllerTask, MessageHead, SubtreeReport};
    use async_trait::async_trait;
    use prost::Message;

    use crate::shim::ShimError;

    struct EchoShim;

    #[async_trait]
    impl ShimClient for EchoShim {
        async fn execute(&self, request: ClusterMessage) -> Result<ClusterMessage, ShimError> {
            let task = request.controller_task()?;
            Ok(ClusterMessage {
                head: request.head,
                body: task.body,
            })
        }
    }

    struct FailingShim;

    #[async_trait]
    impl ShimClient for FailingShim {
        async fn execute(&self, _request: ClusterMessage) -> Result<ClusterMessage, ShimError> {
            Err(ShimError::Handler("exploded".to_string()))
        }
    }

    struct Harness {
        inner: EdgeInner,
        to_parent_rx: mpsc::Receiver<ClusterMessage>,
        to_local_rx: mpsc::Receiver<ClusterMessage>,
    }

    fn harness(shim: Option<Arc<dyn ShimClient>>) -> Harness {
        let (to_parent_tx, to_parent_rx) = mpsc::channel(8);
        let (to_local_tx, to_local_rx) = mpsc::channel(8);
        let inner = EdgeInner {
            config: EdgeConfig {
                cluster_name: "child1".to_string(),
                ..Default::default()
            },
            router: ClusterRouter::new(),
            to_parent_tx,
            to_local_tx,
            shim: OnceLock::new(),
            tunnel: OnceLock::new(),
        };
        if let Some(shim) = shim {
            let _ = inner.shim.set(shim);
        }
        Harness {
            inner,
            to_parent_rx,
            to_local_rx,
        }
    }

    fn envelope(command: CommandType, selector: &str, body: Vec<u8>) -> ClusterMessage {
        ClusterMessage::new(
            MessageHead {
                message_id: "msg-1".to_string(),
                command: command as i32,
                cluster_selector: selector.to_string(),
                cluster_name: "root".to_string(),
                parent_cluster_name: "root".to_string(),
            },
            body,
        )
    }

    fn control_req(selector: &str) -> ClusterMessage {
        let task = ControllerTask {
            destination: "echo".to_string(),
            method: "GET".to_string(),
            uri: "/".to_string(),
            body: b"hi".to_vec(),
        };
        envelope(CommandType::ControlReq, selector, task.encode_to_vec())
    }

    #[tokio::test]
    async fn test_matched_selector_executes_and_delivers_copy() {
        let mut h = harness(Some(Arc::new(EchoShim)));
        let raw = control_req("child1,child2").to_bytes();

        h.inner.receive_message_from_tunnel("child1", &raw).await;

        assert!(h.to_local_rx.recv().await.is_some());
        let resp = tokio::time::timeout(Duration::from_secs(1), h.to_parent_rx.recv())
            .await
            .expect("response within a second")
            .unwrap();
        let head = resp.head.as_ref().unwrap();
        assert_eq!(resp.command_type(), CommandType::ControlResp);
        assert_eq!(head.message_id, "msg-1");
        assert_eq!(head.parent_cluster_name, "root");
        assert_eq!(head.cluster_name, "child1");
        assert_eq!(resp.body, b"hi");
    }

    #[tokio::test]
    async fn test_unmatched_selector_only_delivers_copy() {
        let mut h = harness(Some(Arc::new(EchoShim)));
        let raw = control_req("child2,child3").to_bytes();

        h.inner.receive_message_from_tunnel("child1", &raw).await;

        assert!(h.to_local_rx.recv().await.is_some());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.to_parent_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_selector_matches() {
        let mut h = harness(Some(Arc::new(EchoShim)));
        let raw = control_req("").to_bytes();

        h.inner.receive_message_from_tunnel("child1", &raw).await;

        let resp = tokio::time::timeout(Duration::from_secs(1), h.to_parent_rx.recv())
            .await
            .unwrap();
        assert!(resp.is_some());
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_dropped() {
        let mut h = harness(Some(Arc::new(EchoShim)));

        h.inner
            .receive_message_from_tunnel("child1", &[0xff, 0x01, 0x02])
            .await;

        assert!(h.to_local_rx.try_recv().is_err());
        assert!(h.to_parent_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_neighbor_route_updates_router_without_response() {
        let mut h = harness(Some(Arc::new(EchoShim)));
        let report = SubtreeReport {
            cluster_name: "child2".to_string(),
            subtree: vec!["child3".to_string()],
            routes: vec![],
        };
        let msg = envelope(CommandType::NeighborRoute, "", report.encode_to_vec());

        h.inner.handle_message(msg).await.unwrap();

        assert!(h.inner.router.subtree("child2").await.contains("child3"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.to_parent_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_control_multi_req_returns_ok_without_response() {
        let mut h = harness(Some(Arc::new(EchoShim)));
        let task = ControlMultiTask {
            destination: "api".to_string(),
            cluster_selectors: vec!["child1".to_string(), "child2".to_string()],
            ..Default::default()
        };
        let msg = envelope(CommandType::ControlMultiReq, "", task.encode_to_vec());

        h.inner.handle_message(msg).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.to_parent_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reserved_and_response_are_noops() {
        let h = harness(None);
        h.inner
            .handle_message(envelope(CommandType::Reserved, "", vec![]))
            .await
            .unwrap();
        h.inner
            .handle_message(envelope(CommandType::ControlResp, "", vec![0xff]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_malformed_body_is_error() {
        let h = harness(Some(Arc::new(EchoShim)));
        let msg = envelope(CommandType::ControlReq, "", vec![0xff, 0xff, 0xff]);

        let err = h.inner.handle_message(msg).await.unwrap_err();
        assert!(matches!(err, EdgeError::Decode(_)));
    }

    #[tokio::test]
    async fn test_missing_head_is_error() {
        let h = harness(Some(Arc::new(EchoShim)));
        let msg = ClusterMessage {
            head: None,
            body: vec![],
        };

        let err = h.inner.handle_message(msg).await.unwrap_err();
        assert!(matches!(err, EdgeError::Decode(DecodeError::MissingHead)));
    }

    #[tokio::test]
    async fn test_shim_failure_sends_no_response() {
        let mut h = harness(Some(Arc::new(FailingShim)));

        h.inner.handle_message(control_req("")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.to_parent_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_control_req_without_shim_is_dropped() {
        let mut h = harness(None);

        h.inner.handle_message(control_req("")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.to_parent_rx.try_recv().is_err());
    }
}

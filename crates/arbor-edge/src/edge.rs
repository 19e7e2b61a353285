//! Edge Router - lifecycle of the upward tunnel and the background loops
//!
//! [`EdgeHandler`] is created once per process. [`EdgeHandler::start`]
//! validates configuration, builds the shim, connects the tunnel and launches
//! the outbound forwarder and subtree reporter. Everything after a successful
//! start is best-effort: per-message failures are logged, never returned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use arbor_common::ROOT_CLUSTER_NAME;
use arbor_proto::{ClusterMessage, TunnelHello};
use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster_router::ClusterRouter;
use crate::config::{EdgeConfig, EdgeQueues};
use crate::dispatch::EdgeInner;
use crate::error::EdgeError;
use crate::shim::{build_shim_client, ShimClient};
use crate::subtree::SubtreeReporter;
use crate::tunnel::{ConnectHook, DisconnectHook, ReceiveHandler, TcpTunnel, Tunnel, TunnelConfig};

/// The edge message router of a non-root cluster
pub struct EdgeHandler {
    inner: Arc<EdgeInner>,
    to_parent_rx: Mutex<Option<mpsc::Receiver<ClusterMessage>>>,
    started: AtomicBool,
    shutdown: CancellationToken,
    report_stop: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shim_override: Option<Arc<dyn ShimClient>>,
    tunnel_override: Option<Arc<dyn Tunnel>>,
    connect_hook: Option<ConnectHook>,
    disconnect_hook: Option<DisconnectHook>,
}

impl EdgeHandler {
    /// Create a router over `queues` sharing `router` with the rest of the process
    pub fn new(config: EdgeConfig, queues: EdgeQueues, router: ClusterRouter) -> Self {
        let EdgeQueues {
            to_parent_tx,
            to_parent_rx,
            to_local_tx,
        } = queues;
        let shutdown = CancellationToken::new();
        let report_stop = shutdown.child_token();

        Self {
            inner: Arc::new(EdgeInner {
                config,
                router,
                to_parent_tx,
                to_local_tx,
                shim: OnceLock::new(),
                tunnel: OnceLock::new(),
            }),
            to_parent_rx: Mutex::new(Some(to_parent_rx)),
            started: AtomicBool::new(false),
            shutdown,
            report_stop,
            tasks: Mutex::new(Vec::new()),
            shim_override: None,
            tunnel_override: None,
            connect_hook: None,
            disconnect_hook: None,
        }
    }

    /// Use `shim` instead of building one from configuration.
    ///
    /// The last call wins. Has no effect once a shim is in place after `start`.
    pub fn with_shim(mut self, shim: Arc<dyn ShimClient>) -> Self {
        self.shim_override = Some(shim);
        self
    }

    /// Use `tunnel` instead of dialing the parent over TCP.
    ///
    /// The last call wins. Has no effect once a tunnel is in place after `start`.
    pub fn with_tunnel(mut self, tunnel: Arc<dyn Tunnel>) -> Self {
        self.tunnel_override = Some(tunnel);
        self
    }

    /// Run `hook` after every tunnel (re)connect
    pub fn with_connect_hook(mut self, hook: ConnectHook) -> Self {
        self.connect_hook = Some(hook);
        self
    }

    /// Run `hook` after every tunnel disconnect
    pub fn with_disconnect_hook(mut self, hook: DisconnectHook) -> Self {
        self.disconnect_hook = Some(hook);
        self
    }

    /// Configuration this router was built with
    pub fn config(&self) -> &EdgeConfig {
        &self.inner.config
    }

    /// Shared cluster topology
    pub fn router(&self) -> &ClusterRouter {
        &self.inner.router
    }

    /// Validate, connect and launch the background loops.
    ///
    /// Fails on the root cluster, on invalid configuration, when the remote
    /// shim is unreachable, or when the first tunnel connect fails. A failed
    /// start launches nothing and may be retried.
    pub async fn start(&self) -> Result<(), EdgeError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EdgeError::AlreadyStarted);
        }
        if let Err(e) = self.start_inner().await {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    async fn start_inner(&self) -> Result<(), EdgeError> {
        let config = &self.inner.config;
        if config.cluster_name == ROOT_CLUSTER_NAME {
            return Err(EdgeError::config(
                "cluster_name",
                "the root cluster has no parent and cannot run an edge router",
            ));
        }
        config.validate()?;

        if self.inner.shim.get().is_none() {
            let shim = match &self.shim_override {
                Some(shim) => shim.clone(),
                None => build_shim_client(config).await?,
            };
            let _ = self.inner.shim.set(shim);
        }

        let tunnel = self
            .inner
            .tunnel
            .get_or_init(|| {
                if let Some(tunnel) = &self.tunnel_override {
                    return tunnel.clone();
                }
                let hello = TunnelHello {
                    cluster_name: config.cluster_name.clone(),
                    user_define_name: config.user_define_name().to_string(),
                };
                let tunnel: Arc<dyn Tunnel> = Arc::new(TcpTunnel::new(
                    config.parent_cluster.clone(),
                    hello,
                    TunnelConfig::from(config),
                ));
                tunnel
            })
            .clone();

        tunnel.register_receive_handler(receive_handler(Arc::downgrade(&self.inner)));
        tunnel.register_after_connect_hook(logging_hook(
            "Connected to parent",
            &config.parent_cluster,
            self.connect_hook.clone(),
        ));
        tunnel.register_after_disconnect_hook(logging_hook(
            "Disconnected from parent",
            &config.parent_cluster,
            self.disconnect_hook.clone(),
        ));
        tunnel.start().await?;

        let rx = self
            .to_parent_rx
            .lock()
            .take()
            .ok_or(EdgeError::AlreadyStarted)?;
        let forwarder = tokio::spawn(forward_to_tunnel(
            tunnel.clone(),
            rx,
            self.shutdown.clone(),
        ));

        let reporter = SubtreeReporter::new(
            config.cluster_name.clone(),
            self.inner.router.clone(),
            self.inner.to_parent_tx.clone(),
            config.report_interval,
        )
        .spawn(self.report_stop.clone());

        self.tasks.lock().extend([forwarder, reporter]);

        info!(
            cluster = %config.cluster_name,
            parent = %config.parent_cluster,
            remote_shim = config.is_remote_shim(),
            "Edge router started"
        );
        Ok(())
    }

    /// Stop the subtree reporter. The stop is terminal; other loops keep running.
    pub fn stop_subtree_report(&self) {
        self.report_stop.cancel();
    }

    /// Cancel every loop, stop the tunnel and wait for the tasks to finish
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        if let Some(tunnel) = self.inner.tunnel.get() {
            if let Err(e) = tunnel.stop().await {
                warn!(error = %e, "Failed to stop tunnel");
            }
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Edge task ended abnormally");
            }
        }
        info!(cluster = %self.inner.config.cluster_name, "Edge router shut down");
    }

    /// Handle one raw frame from the parent as the tunnel callback would
    pub async fn receive_message_from_tunnel(&self, cluster_name: &str, data: &[u8]) {
        self.inner.receive_message_from_tunnel(cluster_name, data).await;
    }

    /// Route an addressed envelope by command
    pub async fn handle_message(&self, msg: ClusterMessage) -> Result<(), EdgeError> {
        self.inner.handle_message(msg).await
    }
}

impl std::fmt::Debug for EdgeHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeHandler")
            .field("config", &self.inner.config)
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Drain the outbound queue into the tunnel in FIFO order.
///
/// A failed send drops that envelope and the loop carries on. Runs until
/// `cancel` fires or every sender is gone.
pub async fn forward_to_tunnel(
    tunnel: Arc<dyn Tunnel>,
    mut rx: mpsc::Receiver<ClusterMessage>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        if let Err(e) = tunnel.send(msg.to_bytes()).await {
            let message_id = msg
                .head
                .as_ref()
                .map(|h| h.message_id.as_str())
                .unwrap_or_default();
            warn!(message_id = %message_id, error = %e, "Failed to forward envelope to parent, dropped");
        }
    }
    debug!("Outbound forwarder stopped");
}

/// Tunnel callback dispatching into the router while it is alive
fn receive_handler(inner: Weak<EdgeInner>) -> ReceiveHandler {
    Arc::new(move |cluster_name: String, frame: Bytes| {
        let inner = inner.clone();
        async move {
            if let Some(inner) = inner.upgrade() {
                inner.receive_message_from_tunnel(&cluster_name, &frame).await;
            }
        }
        .boxed()
    })
}

fn logging_hook(
    event: &'static str,
    parent: &str,
    user_hook: Option<Arc<dyn Fn() + Send + Sync>>,
) -> Arc<dyn Fn() + Send + Sync> {
    let parent = parent.to_string();
    Arc::new(move || {
        info!(parent = %parent, "{}", event);
        if let Some(hook) = &user_hook {
            hook();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use arbor_proto::{CommandType, MessageHead};
    use async_trait::async_trait;

    use crate::config::local_bridge;
    use crate::shim::{MockKubeClientProvider, ShimError};
    use crate::tunnel::TunnelError;

    /// In-memory tunnel recording every frame sent
    #[derive(Default)]
    struct FakeTunnel {
        sent: Mutex<Vec<Bytes>>,
        fail_next: AtomicUsize,
        started: AtomicBool,
        stopped: AtomicBool,
        handler: Mutex<Option<ReceiveHandler>>,
    }

    #[async_trait]
    impl Tunnel for FakeTunnel {
        async fn send(&self, frame: Bytes) -> Result<(), TunnelError> {
            if self.fail_next.load(Ordering::SeqCst) > 0 {
                self.fail_next.fetch_sub(1, Ordering::SeqCst);
                return Err(TunnelError::Closed);
            }
            self.sent.lock().push(frame);
            Ok(())
        }

        fn register_receive_handler(&self, handler: ReceiveHandler) {
            *self.handler.lock() = Some(handler);
        }

        fn register_after_connect_hook(&self, _hook: ConnectHook) {}

        fn register_after_disconnect_hook(&self, _hook: DisconnectHook) {}

        async fn start(&self) -> Result<(), TunnelError> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), TunnelError> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct NoopShim;

    #[async_trait]
    impl ShimClient for NoopShim {
        async fn execute(&self, request: ClusterMessage) -> Result<ClusterMessage, ShimError> {
            Ok(request)
        }
    }

    fn envelope(id: &str) -> ClusterMessage {
        ClusterMessage::new(
            MessageHead {
                message_id: id.to_string(),
                command: CommandType::ControlResp as i32,
                ..Default::default()
            },
            vec![],
        )
    }

    fn valid_config() -> EdgeConfig {
        EdgeConfig {
            cluster_name: "child1".to_string(),
            parent_cluster: "127.0.0.1:8287".to_string(),
            kube_provider: Some(Arc::new(MockKubeClientProvider::new())),
            report_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    async fn wait_for_sent(tunnel: &FakeTunnel, count: usize) {
        for _ in 0..100 {
            if tunnel.sent.lock().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("tunnel never saw {} frames", count);
    }

    #[tokio::test]
    async fn test_forwarder_preserves_order() {
        let tunnel = Arc::new(FakeTunnel::default());
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(forward_to_tunnel(tunnel.clone(), rx, cancel.clone()));

        for id in ["a", "b", "c"] {
            tx.send(envelope(id)).await.unwrap();
        }
        wait_for_sent(&tunnel, 3).await;

        let ids: Vec<String> = tunnel
            .sent
            .lock()
            .iter()
            .map(|frame| ClusterMessage::from_bytes(frame).unwrap().head.unwrap().message_id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_forwarder_survives_failed_send() {
        let tunnel = Arc::new(FakeTunnel::default());
        tunnel.fail_next.store(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(forward_to_tunnel(
            tunnel.clone(),
            rx,
            CancellationToken::new(),
        ));

        tx.send(envelope("lost")).await.unwrap();
        tx.send(envelope("kept")).await.unwrap();
        wait_for_sent(&tunnel, 1).await;

        let frame = tunnel.sent.lock()[0].clone();
        let head = ClusterMessage::from_bytes(&frame).unwrap().head.unwrap();
        assert_eq!(head.message_id, "kept");

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_start_rejects_root_cluster() {
        let (queues, _bridge) = local_bridge(8);
        let config = EdgeConfig {
            cluster_name: ROOT_CLUSTER_NAME.to_string(),
            ..valid_config()
        };
        let edge = EdgeHandler::new(config, queues, ClusterRouter::new());

        let err = edge.start().await.unwrap_err();
        assert!(matches!(err, EdgeError::Config { field: "cluster_name", .. }));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let (queues, _bridge) = local_bridge(8);
        let config = EdgeConfig {
            parent_cluster: String::new(),
            ..valid_config()
        };
        let tunnel = Arc::new(FakeTunnel::default());
        let edge = EdgeHandler::new(config, queues, ClusterRouter::new()).with_tunnel(tunnel.clone());

        let err = edge.start().await.unwrap_err();
        assert!(err.is_config());
        assert!(!tunnel.started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_start_fails_when_remote_shim_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (queues, _bridge) = local_bridge(8);
        let config = EdgeConfig {
            remote_shim_addr: format!(":{}", port),
            shim_connect_timeout: Duration::from_millis(500),
            ..valid_config()
        };
        let tunnel = Arc::new(FakeTunnel::default());
        let edge = EdgeHandler::new(config, queues, ClusterRouter::new()).with_tunnel(tunnel.clone());

        let err = edge.start().await.unwrap_err();
        assert!(matches!(err, EdgeError::Shim(ShimError::Unavailable { .. })));
        assert!(!tunnel.started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_start_fails_when_parent_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let (queues, _bridge) = local_bridge(8);
        let config = EdgeConfig {
            parent_cluster: addr,
            connect_timeout: Duration::from_millis(500),
            ..valid_config()
        };
        let edge = EdgeHandler::new(config, queues, ClusterRouter::new());

        let err = edge.start().await.unwrap_err();
        assert!(matches!(err, EdgeError::Tunnel(TunnelError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_start_runs_loops_until_shutdown() {
        let (queues, bridge) = local_bridge(8);
        let tunnel = Arc::new(FakeTunnel::default());
        let router = ClusterRouter::new();
        router.add_route("child1", "c2").await;

        let edge = EdgeHandler::new(valid_config(), queues, router)
            .with_shim(Arc::new(NoopShim))
            .with_tunnel(tunnel.clone());
        edge.start().await.unwrap();
        assert!(tunnel.started.load(Ordering::SeqCst));
        assert!(tunnel.handler.lock().is_some());

        // Forwarder
        bridge.to_parent.send(envelope("local-1")).await.unwrap();
        // Reporter
        wait_for_sent(&tunnel, 2).await;

        let commands: Vec<CommandType> = tunnel
            .sent
            .lock()
            .iter()
            .map(|frame| ClusterMessage::from_bytes(frame).unwrap().command_type())
            .collect();
        assert!(commands.contains(&CommandType::ControlResp));
        assert!(commands.contains(&CommandType::NeighborRoute));

        edge.shutdown().await;
        assert!(tunnel.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_second_start_rejected() {
        let (queues, _bridge) = local_bridge(8);
        let edge = EdgeHandler::new(valid_config(), queues, ClusterRouter::new())
            .with_shim(Arc::new(NoopShim))
            .with_tunnel(Arc::new(FakeTunnel::default()));

        edge.start().await.unwrap();
        assert!(matches!(edge.start().await, Err(EdgeError::AlreadyStarted)));
        edge.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_start_can_be_retried() {
        let (queues, _bridge) = local_bridge(8);
        let config = EdgeConfig {
            cluster_name: String::new(),
            ..valid_config()
        };
        let edge = EdgeHandler::new(config, queues, ClusterRouter::new());
        assert!(edge.start().await.unwrap_err().is_config());
        assert!(!matches!(edge.start().await, Err(EdgeError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_stop_subtree_report_leaves_forwarder_running() {
        let (queues, bridge) = local_bridge(8);
        let tunnel = Arc::new(FakeTunnel::default());
        let edge = EdgeHandler::new(valid_config(), queues, ClusterRouter::new())
            .with_shim(Arc::new(NoopShim))
            .with_tunnel(tunnel.clone());
        edge.start().await.unwrap();

        edge.stop_subtree_report();
        tokio::time::sleep(Duration::from_millis(60)).await;
        tunnel.sent.lock().clear();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(tunnel.sent.lock().is_empty());

        bridge.to_parent.send(envelope("still-flowing")).await.unwrap();
        wait_for_sent(&tunnel, 1).await;

        edge.shutdown().await;
    }

    #[tokio::test]
    async fn test_last_injected_tunnel_wins() {
        let (queues, _bridge) = local_bridge(8);
        let first = Arc::new(FakeTunnel::default());
        let second = Arc::new(FakeTunnel::default());
        let edge = EdgeHandler::new(valid_config(), queues, ClusterRouter::new())
            .with_shim(Arc::new(NoopShim))
            .with_tunnel(first.clone())
            .with_tunnel(second.clone());
        edge.start().await.unwrap();

        assert!(!first.started.load(Ordering::SeqCst));
        assert!(second.started.load(Ordering::SeqCst));
        assert!(second.handler.lock().is_some());

        edge.shutdown().await;
        assert!(second.stopped.load(Ordering::SeqCst));
        assert!(!first.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_tunnel_callback_reaches_dispatcher() {
        let (queues, mut bridge) = local_bridge(8);
        let tunnel = Arc::new(FakeTunnel::default());
        let edge = EdgeHandler::new(valid_config(), queues, ClusterRouter::new())
            .with_shim(Arc::new(NoopShim))
            .with_tunnel(tunnel.clone());
        edge.start().await.unwrap();

        let handler = tunnel.handler.lock().clone().unwrap();
        handler("child1".to_string(), envelope("from-parent").to_bytes()).await;

        let delivered = bridge.from_parent.recv().await.unwrap();
        assert_eq!(delivered.head.unwrap().message_id, "from-parent");

        edge.shutdown().await;
    }
}

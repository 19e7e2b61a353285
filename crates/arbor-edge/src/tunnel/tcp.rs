//! Length-delimited TCP tunnel with automatic reconnect
//!
//! Every frame on the wire is a 4-byte big-endian length followed by the
//! payload. The first frame after connecting is a [`TunnelHello`] naming this
//! cluster; everything after it is an encoded envelope in either direction.
//!
//! When the connection drops the tunnel redials with exponential backoff until
//! it is stopped. Frames queued while disconnected wait in the outbound queue;
//! a frame that fails mid-write is dropped. Inbound frames are delivered one
//! at a time, so a slow receive handler holds back the connection until it
//! returns or the tunnel is stopped.

use std::sync::Arc;
use std::time::Duration;

use arbor_common::retry::{retry_with_backoff, RetryConfig, RetryError};
use arbor_common::{DEFAULT_QUEUE_CAPACITY, DEFAULT_SEND_TIMEOUT_SECS, MAX_FRAME_LENGTH};
use arbor_proto::TunnelHello;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use prost::Message;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ConnectHook, DisconnectHook, ReceiveHandler, Tunnel, TunnelError};
use crate::config::{dial_address, EdgeConfig, DEFAULT_CONNECT_TIMEOUT};

type Connection = Framed<TcpStream, LengthDelimitedCodec>;

/// Tunnel timing and sizing
#[derive(Clone, Debug)]
pub struct TunnelConfig {
    /// Time allowed for each dial
    pub connect_timeout: Duration,
    /// Upper bound on queueing a single outbound frame
    pub send_timeout: Duration,
    /// Outbound queue capacity
    pub queue_capacity: usize,
    /// Largest frame accepted from the parent
    pub max_frame_length: usize,
    /// Backoff between reconnect attempts
    pub reconnect: RetryConfig,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            send_timeout: Duration::from_secs(DEFAULT_SEND_TIMEOUT_SECS),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_frame_length: MAX_FRAME_LENGTH,
            reconnect: RetryConfig::default(),
        }
    }
}

impl From<&EdgeConfig> for TunnelConfig {
    fn from(config: &EdgeConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            send_timeout: config.send_timeout,
            queue_capacity: config.queue_capacity,
            ..Default::default()
        }
    }
}

#[derive(Clone, Default)]
struct Hooks {
    receive: Option<ReceiveHandler>,
    connected: Option<ConnectHook>,
    disconnected: Option<DisconnectHook>,
}

/// [`Tunnel`] over a single TCP connection to the parent
pub struct TcpTunnel {
    addr: String,
    hello: TunnelHello,
    config: TunnelConfig,
    hooks: Arc<RwLock<Hooks>>,
    outbound_tx: mpsc::Sender<Bytes>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTunnel {
    /// Create a tunnel to `parent_addr` announcing `hello` on every connect
    pub fn new(parent_addr: impl Into<String>, hello: TunnelHello, config: TunnelConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            addr: parent_addr.into(),
            hello,
            config,
            hooks: Arc::new(RwLock::new(Hooks::default())),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Tunnel for TcpTunnel {
    async fn send(&self, frame: Bytes) -> Result<(), TunnelError> {
        if self.cancel.is_cancelled() {
            return Err(TunnelError::Closed);
        }
        match tokio::time::timeout(self.config.send_timeout, self.outbound_tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TunnelError::Closed),
            Err(_) => Err(TunnelError::SendTimeout(self.config.send_timeout)),
        }
    }

    fn register_receive_handler(&self, handler: ReceiveHandler) {
        self.hooks.write().receive = Some(handler);
    }

    fn register_after_connect_hook(&self, hook: ConnectHook) {
        self.hooks.write().connected = Some(hook);
    }

    fn register_after_disconnect_hook(&self, hook: DisconnectHook) {
        self.hooks.write().disconnected = Some(hook);
    }

    async fn start(&self) -> Result<(), TunnelError> {
        if self.cancel.is_cancelled() {
            return Err(TunnelError::Closed);
        }
        let rx = self
            .outbound_rx
            .lock()
            .take()
            .ok_or(TunnelError::AlreadyStarted)?;

        let conn = match dial(&self.addr, &self.hello, &self.config).await {
            Ok(conn) => conn,
            Err(e) => {
                *self.outbound_rx.lock() = Some(rx);
                return Err(e);
            }
        };
        info!(parent = %self.addr, "Tunnel connected");
        let hook = self.hooks.read().connected.clone();
        fire(hook);

        let session = Session {
            addr: self.addr.clone(),
            hello: self.hello.clone(),
            config: self.config.clone(),
            hooks: self.hooks.clone(),
            cancel: self.cancel.clone(),
        };
        *self.task.lock() = Some(tokio::spawn(session.run(conn, rx)));
        Ok(())
    }

    async fn stop(&self) -> Result<(), TunnelError> {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Tunnel task ended abnormally");
            }
            info!(parent = %self.addr, "Tunnel stopped");
        }
        Ok(())
    }
}

/// Open a connection and announce ourselves
async fn dial(addr: &str, hello: &TunnelHello, config: &TunnelConfig) -> Result<Connection, TunnelError> {
    let connect_err = |message: String| TunnelError::Connect {
        addr: addr.to_string(),
        message,
    };

    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(dial_address(addr)))
        .await
        .map_err(|_| connect_err(format!("timed out after {:?}", config.connect_timeout)))?
        .map_err(|e| connect_err(e.to_string()))?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }

    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(config.max_frame_length)
        .new_codec();
    let mut conn = Framed::new(stream, codec);
    conn.send(Bytes::from(hello.encode_to_vec()))
        .await
        .map_err(|e| connect_err(format!("hello failed: {}", e)))?;
    Ok(conn)
}

fn fire(hook: Option<Arc<dyn Fn() + Send + Sync>>) {
    if let Some(hook) = hook {
        hook();
    }
}

enum SessionEnd {
    Stopped,
    Disconnected,
}

/// Background pump owning the live connection
struct Session {
    addr: String,
    hello: TunnelHello,
    config: TunnelConfig,
    hooks: Arc<RwLock<Hooks>>,
    cancel: CancellationToken,
}

impl Session {
    async fn run(self, first: Connection, mut rx: mpsc::Receiver<Bytes>) {
        let mut conn = first;
        loop {
            if let SessionEnd::Stopped = self.pump(&mut conn, &mut rx).await {
                return;
            }

            warn!(parent = %self.addr, "Tunnel disconnected, reconnecting");
            let hook = self.hooks.read().disconnected.clone();
            fire(hook);

            let redial = retry_with_backoff(&self.config.reconnect, "tunnel_reconnect", &self.cancel, || {
                dial(&self.addr, &self.hello, &self.config)
            })
            .await;

            match redial {
                Ok(next) => {
                    conn = next;
                    info!(parent = %self.addr, "Tunnel reconnected");
                    let hook = self.hooks.read().connected.clone();
                    fire(hook);
                }
                Err(RetryError::Cancelled) => return,
                Err(RetryError::Exhausted(e)) => {
                    error!(parent = %self.addr, error = %e, "Giving up on tunnel reconnect");
                    return;
                }
            }
        }
    }

    async fn pump(&self, conn: &mut Connection, rx: &mut mpsc::Receiver<Bytes>) -> SessionEnd {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Stopped,
                inbound = conn.next() => match inbound {
                    Some(Ok(frame)) => {
                        let handler = self.hooks.read().receive.clone();
                        let Some(handler) = handler else {
                            debug!(len = frame.len(), "No receive handler, dropping frame");
                            continue;
                        };
                        // A stalled handler must not outlive stop()
                        tokio::select! {
                            _ = self.cancel.cancelled() => return SessionEnd::Stopped,
                            _ = handler(self.hello.cluster_name.clone(), frame.freeze()) => {}
                        }
                    }
                    Some(Err(e)) => {
                        warn!(parent = %self.addr, error = %e, "Tunnel read failed");
                        return SessionEnd::Disconnected;
                    }
                    None => return SessionEnd::Disconnected,
                },
                outbound = rx.recv() => match outbound {
                    Some(frame) => {
                        if let Err(e) = conn.send(frame).await {
                            warn!(parent = %self.addr, error = %e, "Tunnel write failed, frame dropped");
                            return SessionEnd::Disconnected;
                        }
                    }
                    None => return SessionEnd::Stopped,
                },
            }
        }
    }
}

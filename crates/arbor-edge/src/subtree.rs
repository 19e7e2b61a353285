//! Subtree reporting to the parent cluster
//!
//! Periodically snapshots the clusters beneath this one from the
//! [`ClusterRouter`] and queues a `NeighborRoute` envelope for the parent, so
//! the parent's own router learns the shape of this branch.

use std::time::Duration;

use arbor_proto::{ClusterMessage, CommandType, MessageHead};
use prost::Message;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster_router::ClusterRouter;

/// Builds and sends subtree reports to the parent
pub struct SubtreeReporter {
    /// This cluster's name
    cluster_name: String,
    router: ClusterRouter,
    message_tx: mpsc::Sender<ClusterMessage>,
    interval: Duration,
}

impl SubtreeReporter {
    /// Create a reporter for `cluster_name` that reports every `interval`
    pub fn new(
        cluster_name: String,
        router: ClusterRouter,
        message_tx: mpsc::Sender<ClusterMessage>,
        interval: Duration,
    ) -> Self {
        Self {
            cluster_name,
            router,
            message_tx,
            interval,
        }
    }

    /// Build the current `NeighborRoute` envelope
    pub async fn build_report(&self) -> ClusterMessage {
        let report = self.router.report_for(&self.cluster_name).await;
        debug!(
            cluster = %self.cluster_name,
            subtree_size = report.subtree.len(),
            "Built subtree report"
        );

        ClusterMessage::new(
            MessageHead {
                message_id: uuid::Uuid::new_v4().to_string(),
                command: CommandType::NeighborRoute as i32,
                cluster_selector: String::new(),
                cluster_name: self.cluster_name.clone(),
                parent_cluster_name: String::new(),
            },
            report.encode_to_vec(),
        )
    }

    /// Queue one report. Returns false once the outbound queue is closed.
    pub async fn send_report(&self) -> bool {
        let msg = self.build_report().await;
        if let Err(e) = self.message_tx.send(msg).await {
            warn!(error = %e, "Failed to queue subtree report for parent");
            return false;
        }
        true
    }

    /// Report on every tick until `stop` fires or the queue closes.
    ///
    /// The first report goes out one interval after the loop starts. A full
    /// outbound queue never holds the loop past `stop`.
    pub async fn run(self, stop: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(cluster = %self.cluster_name, interval = ?self.interval, "Starting subtree reporter");
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = stop.cancelled() => break,
                sent = self.send_report() => {
                    if !sent {
                        break;
                    }
                }
            }
        }
        info!(cluster = %self.cluster_name, "Subtree reporter stopped");
    }

    /// Run the reporter as a background task
    pub fn spawn(self, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(stop))
    }
}

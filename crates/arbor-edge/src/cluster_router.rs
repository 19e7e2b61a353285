//! Cluster Router - live parent/child adjacency of the cluster tree
//!
//! The tree only grows here: edges arrive with subtree reports from children
//! and are never removed. Queries answer "what is reachable under cluster X"
//! by walking the adjacency transitively.
//!
//! One router is shared by the subtree reporter (reader) and the inbound
//! dispatcher (writer). Clone it to share; clones see the same tree.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use arbor_proto::{Route, SubtreeReport};
use tokio::sync::RwLock;
use tracing::debug;

/// Concurrency-safe adjacency map from cluster name to direct children
#[derive(Clone, Default)]
pub struct ClusterRouter {
    children: Arc<RwLock<HashMap<String, BTreeSet<String>>>>,
}

impl ClusterRouter {
    /// Create an empty router
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `child` sits directly beneath `parent`.
    ///
    /// Returns whether the edge was new. Empty names and self-loops are ignored.
    pub async fn add_route(&self, parent: &str, child: &str) -> bool {
        if parent.is_empty() || child.is_empty() || parent == child {
            return false;
        }
        let mut children = self.children.write().await;
        children
            .entry(parent.to_string())
            .or_default()
            .insert(child.to_string())
    }

    /// Direct children of `cluster_name`
    pub async fn children_of(&self, cluster_name: &str) -> Vec<String> {
        let children = self.children.read().await;
        children
            .get(cluster_name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every descendant of `cluster_name`, excluding itself
    pub async fn subtree(&self, cluster_name: &str) -> BTreeSet<String> {
        let children = self.children.read().await;
        walk(&children, cluster_name)
            .into_iter()
            .filter_map(|route| (route.child != cluster_name).then_some(route.child))
            .collect()
    }

    /// Snapshot of the subtree rooted at `cluster_name`, ready to send upward
    pub async fn report_for(&self, cluster_name: &str) -> SubtreeReport {
        let children = self.children.read().await;
        let routes = walk(&children, cluster_name);
        let subtree: BTreeSet<String> = routes
            .iter()
            .filter(|route| route.child != cluster_name)
            .map(|route| route.child.clone())
            .collect();

        SubtreeReport {
            cluster_name: cluster_name.to_string(),
            subtree: subtree.into_iter().collect(),
            routes,
        }
    }

    /// Merge a child's subtree report into the tree.
    ///
    /// Reports carrying edges are merged edge by edge; reports without edges
    /// attach every listed cluster directly beneath the reporter. Returns how
    /// many edges were new.
    pub async fn record_report(&self, report: &SubtreeReport) -> usize {
        if report.cluster_name.is_empty() {
            return 0;
        }

        let edges: Vec<(&str, &str)> = if report.routes.is_empty() {
            report
                .subtree
                .iter()
                .map(|child| (report.cluster_name.as_str(), child.as_str()))
                .collect()
        } else {
            report
                .routes
                .iter()
                .map(|route| (route.parent.as_str(), route.child.as_str()))
                .collect()
        };

        let mut children = self.children.write().await;
        let mut added = 0;
        for (parent, child) in edges {
            if parent.is_empty() || child.is_empty() || parent == child {
                continue;
            }
            if children
                .entry(parent.to_string())
                .or_default()
                .insert(child.to_string())
            {
                added += 1;
            }
        }

        if added > 0 {
            debug!(reporter = %report.cluster_name, added, "Recorded subtree report");
        }
        added
    }

    /// Total number of edges known
    pub async fn route_count(&self) -> usize {
        self.children.read().await.values().map(BTreeSet::len).sum()
    }
}

/// Breadth-first walk from `root`, returning each reachable edge once.
///
/// Tolerates cycles introduced by inconsistent reports.
fn walk(children: &HashMap<String, BTreeSet<String>>, root: &str) -> Vec<Route> {
    let mut routes = Vec::new();
    let mut visited: BTreeSet<&str> = BTreeSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();

    visited.insert(root);
    queue.push_back(root);

    while let Some(parent) = queue.pop_front() {
        let Some(direct) = children.get(parent) else {
            continue;
        };
        for child in direct {
            routes.push(Route {
                parent: parent.to_string(),
                child: child.clone(),
            });
            if visited.insert(child.as_str()) {
                queue.push_back(child.as_str());
            }
        }
    }

    routes
}

impl std::fmt::Debug for ClusterRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRouter").finish_non_exhaustive()
    }
}

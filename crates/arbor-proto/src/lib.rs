//! Protocol definitions for Arbor cluster-to-cluster communication.
//!
//! Every message exchanged on a tunnel between a child cluster and its parent,
//! and on the in-process queues of the edge router, is a [`ClusterMessage`]
//! envelope: a [`MessageHead`] plus an opaque body interpreted according to
//! the head's [`CommandType`].
//!
//! # Communication Flow
//!
//! ```text
//! ┌─────────────────────────┐
//! │     Parent Cluster      │
//! │                         │
//! │  ┌─────────────────┐    │
//! │  │  Tunnel Server  │◄───┼──── Edge dials outbound
//! │  └─────────────────┘    │
//! └─────────────────────────┘
//!            ▲
//!            │ Length-prefixed ClusterMessage frames
//!            │ (ControlReq / ControlMultiReq / NeighborRoute down,
//!            │  ControlResp / NeighborRoute up)
//!            │
//! ┌──────────┴──────────────┐
//! │      Child Cluster      │
//! │                         │
//! │  ┌─────────────────┐    │
//! │  │   Edge Router   │────┼──── Shim executes ControlReq locally
//! │  └─────────────────┘    │
//! └─────────────────────────┘
//! ```
//!
//! # Payloads
//!
//! - [`ControllerTask`]: body of `ControlReq`
//! - [`ControllerTaskResponse`]: body of `ControlResp` from the API handler
//! - [`ControlMultiTask`]: body of `ControlMultiReq`
//! - [`SubtreeReport`]: body of `NeighborRoute`
//! - [`TunnelHello`]: first frame after a tunnel connects
//!
//! Messages are hand-annotated `prost` types so the crate needs no protoc at
//! build time. The tag numbers are the wire contract.

pub mod shim_service;

use bytes::Bytes;
use prost::Message;
use thiserror::Error;

/// Destination served by the local Kubernetes API handler.
pub const DEST_API: &str = "api";

/// Kind of command carried by an envelope
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum CommandType {
    /// Placeholder, never acted upon
    Reserved = 0,
    /// Single-destination command to execute
    ControlReq = 1,
    /// Result of a ControlReq, travelling toward the parent
    ControlResp = 2,
    /// Command addressed to several destinations
    ControlMultiReq = 3,
    /// Subtree/topology report
    NeighborRoute = 4,
}

/// Envelope header
#[derive(Clone, PartialEq, Message)]
pub struct MessageHead {
    #[prost(string, tag = "1")]
    pub message_id: String,
    #[prost(enumeration = "CommandType", tag = "2")]
    pub command: i32,
    /// Comma-separated cluster names this message targets; empty targets all
    #[prost(string, tag = "3")]
    pub cluster_selector: String,
    #[prost(string, tag = "4")]
    pub cluster_name: String,
    #[prost(string, tag = "5")]
    pub parent_cluster_name: String,
}

/// The protocol unit exchanged between clusters
#[derive(Clone, PartialEq, Message)]
pub struct ClusterMessage {
    #[prost(message, optional, tag = "1")]
    pub head: Option<MessageHead>,
    #[prost(bytes = "vec", tag = "2")]
    pub body: Vec<u8>,
}

/// A command for a single shim destination
#[derive(Clone, PartialEq, Message)]
pub struct ControllerTask {
    #[prost(string, tag = "1")]
    pub destination: String,
    #[prost(string, tag = "2")]
    pub method: String,
    #[prost(string, tag = "3")]
    pub uri: String,
    #[prost(bytes = "vec", tag = "4")]
    pub body: Vec<u8>,
}

/// Result of executing a [`ControllerTask`]
#[derive(Clone, PartialEq, Message)]
pub struct ControllerTaskResponse {
    /// Unix seconds at which the task completed
    #[prost(int64, tag = "1")]
    pub timestamp: i64,
    #[prost(int32, tag = "2")]
    pub status_code: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub body: Vec<u8>,
}

/// A command fanned out to several clusters by downstream consumers
#[derive(Clone, PartialEq, Message)]
pub struct ControlMultiTask {
    #[prost(string, tag = "1")]
    pub destination: String,
    #[prost(string, tag = "2")]
    pub method: String,
    #[prost(string, tag = "3")]
    pub uri: String,
    #[prost(bytes = "vec", tag = "4")]
    pub body: Vec<u8>,
    #[prost(string, repeated, tag = "5")]
    pub cluster_selectors: Vec<String>,
}

/// Directed edge of the cluster tree
#[derive(Clone, PartialEq, Eq, Hash, Message)]
pub struct Route {
    #[prost(string, tag = "1")]
    pub parent: String,
    #[prost(string, tag = "2")]
    pub child: String,
}

/// Periodic report of the clusters reachable beneath a cluster
#[derive(Clone, PartialEq, Message)]
pub struct SubtreeReport {
    #[prost(string, tag = "1")]
    pub cluster_name: String,
    /// Every descendant of `cluster_name`
    #[prost(string, repeated, tag = "2")]
    pub subtree: Vec<String>,
    /// Edges inside the subtree, so the receiver can rebuild its shape
    #[prost(message, repeated, tag = "3")]
    pub routes: Vec<Route>,
}

/// First frame written on a freshly connected tunnel
#[derive(Clone, PartialEq, Message)]
pub struct TunnelHello {
    #[prost(string, tag = "1")]
    pub cluster_name: String,
    #[prost(string, tag = "2")]
    pub user_define_name: String,
}

/// Error decoding an envelope or one of its payloads
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Bytes are not a valid protobuf message of the expected type
    #[error("malformed {kind}: {source}")]
    Malformed {
        /// Message type being decoded
        kind: &'static str,
        /// Underlying prost error
        #[source]
        source: prost::DecodeError,
    },

    /// Envelope decoded but carries no head
    #[error("envelope has no head")]
    MissingHead,
}

fn decode_as<M: Message + Default>(kind: &'static str, data: &[u8]) -> Result<M, DecodeError> {
    M::decode(data).map_err(|source| DecodeError::Malformed { kind, source })
}

impl ClusterMessage {
    /// Build an envelope from a head and body
    pub fn new(head: MessageHead, body: Vec<u8>) -> Self {
        Self {
            head: Some(head),
            body,
        }
    }

    /// Serialize for transport
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.encode_to_vec())
    }

    /// Deserialize a transported envelope, rejecting envelopes without a head
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        let msg: ClusterMessage = decode_as("ClusterMessage", data)?;
        if msg.head.is_none() {
            return Err(DecodeError::MissingHead);
        }
        Ok(msg)
    }

    /// Command of this envelope; unknown values and a missing head read as `Reserved`
    pub fn command_type(&self) -> CommandType {
        self.head
            .as_ref()
            .map(|h| h.command())
            .unwrap_or(CommandType::Reserved)
    }

    /// Decode the body as a [`ControllerTask`]
    pub fn controller_task(&self) -> Result<ControllerTask, DecodeError> {
        decode_as("ControllerTask", &self.body)
    }

    /// Decode the body as a [`ControlMultiTask`]
    pub fn control_multi_task(&self) -> Result<ControlMultiTask, DecodeError> {
        decode_as("ControlMultiTask", &self.body)
    }

    /// Decode the body as a [`SubtreeReport`]
    pub fn subtree_report(&self) -> Result<SubtreeReport, DecodeError> {
        decode_as("SubtreeReport", &self.body)
    }
}

impl ControllerTaskResponse {
    /// Decode a response body
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        decode_as("ControllerTaskResponse", data)
    }
}

impl TunnelHello {
    /// Decode a hello frame
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        decode_as("TunnelHello", data)
    }
}

impl ControllerTask {
    /// Destination this task resolves to; empty means [`DEST_API`]
    pub fn effective_destination(&self) -> &str {
        if self.destination.is_empty() {
            DEST_API
        } else {
            &self.destination
        }
    }
}

/// Split a cluster selector into its cluster names.
///
/// Entries are trimmed and empty entries are dropped, so `""` and `" , "`
/// both yield an empty list.
pub fn parse_selector(selector: &str) -> Vec<&str> {
    selector
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .collect()
}

/// Whether a selector addresses `cluster_name`.
///
/// An empty selector is unrestricted and matches every cluster.
pub fn selector_matches(selector: &str, cluster_name: &str) -> bool {
    let names = parse_selector(selector);
    names.is_empty() || names.contains(&cluster_name)
}

/// Build the ControlResp answering `request`.
///
/// Carries the request's message id and parent cluster name so the parent can
/// correlate it.
pub fn control_response(request: &MessageHead, cluster_name: &str, body: Vec<u8>) -> ClusterMessage {
    ClusterMessage::new(
        MessageHead {
            message_id: request.message_id.clone(),
            command: CommandType::ControlResp as i32,
            cluster_selector: String::new(),
            cluster_name: cluster_name.to_string(),
            parent_cluster_name: request.parent_cluster_name.clone(),
        },
        body,
    )
}

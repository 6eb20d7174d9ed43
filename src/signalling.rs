//! Signalling message shapes and external service seams
//!
//! The WebSocket connection to the signalling server and the HTTPS API are
//! external collaborators: drivers implement [`SignallingClient`] and
//! [`EventServer`], the engine consumes parsed inbound messages and produces
//! outbound ones. Only the message shapes are fixed here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::error::Result;

/// One remote file event as delivered in a `file_events` batch
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteFileEvent {
    /// Client uuid assigned by the originating node
    pub uuid: String,
    /// Server-assigned event id, monotonic per file
    pub server_event_id: i64,
    /// Authoritative file identity
    pub events_file_id: i64,
    /// Event type
    pub event_type: crate::types::EventType,
    /// File name after the event
    pub file_name: String,
    /// uuid of the containing folder's registration
    #[serde(default)]
    pub folder_uuid: Option<String>,
    /// Content hash after the event
    #[serde(default)]
    pub file_hash: Option<String>,
    /// Content hash before the event
    #[serde(default)]
    pub file_hash_before_event: Option<String>,
    /// Size after the event
    #[serde(default)]
    pub file_size: u64,
    /// uuid of the direct patch producing this content
    #[serde(default)]
    pub diff_file_uuid: Option<String>,
    /// uuid of the reverse patch restoring the previous content
    #[serde(default)]
    pub rev_diff_file_uuid: Option<String>,
    /// Causal predecessor's server event id
    #[serde(default)]
    pub last_event_id: Option<i64>,
    /// Unix timestamp of the event
    #[serde(default)]
    pub timestamp: i64,
}

/// A peer announced by the signalling server
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    /// Peer node id
    pub node_id: String,
    /// Whether the peer is currently online
    #[serde(default)]
    pub is_online: bool,
    /// Peer node type (e.g. "node", "webshare")
    #[serde(default)]
    pub node_type: Option<String>,
}

/// A patch announced in a `patches_info` message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchAnnouncement {
    /// Patch uuid
    pub diff_uuid: String,
    /// Archive size in bytes
    pub size: u64,
}

/// Messages arriving from the signalling server
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Full list of known peers
    PeerList {
        /// The peers
        peers: Vec<PeerAnnouncement>,
    },
    /// A peer came online
    PeerConnect {
        /// The peer
        peer: PeerAnnouncement,
    },
    /// A peer went offline
    PeerDisconnect {
        /// The peer's node id
        node_id: String,
    },
    /// WebRTC session negotiation payload for a peer
    Sdp {
        /// The peer the payload belongs to
        node_id: String,
        /// Opaque negotiation payload
        message: serde_json::Value,
    },
    /// Current set of shared objects
    SharingList {
        /// Opaque share descriptions
        shares: serde_json::Value,
    },
    /// A share was enabled
    SharingEnable {
        /// Share description
        info: serde_json::Value,
    },
    /// A share was disabled
    SharingDisable {
        /// Share description
        info: serde_json::Value,
    },
    /// A batch of remote file events, chronologically ordered per file
    FileEvents {
        /// The events
        events: Vec<RemoteFileEvent>,
        /// Peer that supplied the batch, when peer-relayed
        #[serde(default)]
        node_id: Option<String>,
    },
    /// Another node's status changed
    NodeStatus {
        /// The node
        node_id: String,
        /// Status code
        status: i32,
    },
    /// Patches registered remotely that this node should track
    PatchesInfo {
        /// The patches
        patches_info: Vec<PatchAnnouncement>,
    },
    /// The earliest event uuid the server still retains
    MinStoredEvent {
        /// The event uuid
        event_uuid: String,
    },
    /// Root folders under collaboration
    CollaboratedFolders {
        /// Folder names
        folders: Vec<String>,
    },
    /// Unread notification count changed
    NewNotificationsCount {
        /// The count
        count: u64,
    },
}

/// Messages sent to the signalling server
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// WebRTC session negotiation payload for a peer
    Sdp {
        /// The peer the payload belongs to
        node_id: String,
        /// Opaque negotiation payload
        message: serde_json::Value,
    },
    /// Disable a share
    SharingDisable {
        /// Share uuid
        uuid: String,
    },
    /// An upload to a peer finished
    UploadComplete {
        /// Upload id
        upload_id: String,
    },
    /// An upload to a peer failed
    UploadFailed {
        /// Upload id
        upload_id: String,
    },
    /// This node's status changed
    NodeStatus {
        /// Status code
        status: i32,
        /// Free disk space in bytes
        #[serde(default)]
        disk_free: u64,
    },
    /// Locally created patches ready for peers
    PatchesInfo {
        /// The patches
        patches_info: Vec<PatchAnnouncement>,
    },
    /// A shared object finished downloading
    ShareDownloaded {
        /// Share hash
        share_hash: String,
    },
    /// Ask the server for events this node may have missed
    LastFileEvents {
        /// Greatest server event id known locally
        last_event_id: i64,
        /// Event id up to which the chain is verified
        checked_event_id: i64,
        /// How many events to verify per check
        events_count_check: i64,
        /// True when this node keeps no reverse patches
        node_without_backup: bool,
    },
    /// Transfer accounting for the server's statistics
    TrafficInfo {
        /// Bytes received peer-to-peer
        p2p_rx: u64,
        /// Bytes received via relay
        relay_rx: u64,
        /// Bytes sent peer-to-peer
        p2p_tx: u64,
        /// Bytes sent via relay
        relay_tx: u64,
    },
}

/// Connection to the signalling server, provided by the driver
#[async_trait]
pub trait SignallingClient: Send + Sync {
    /// Send one message to the server
    async fn send(&self, message: OutboundMessage) -> Result<()>;
}

/// Outcome of proposing a local event to the server
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// The server accepted the event as the new chain head
    Registered {
        /// Assigned server event id
        server_event_id: i64,
        /// Authoritative file identity (assigned on first registration)
        events_file_id: i64,
        /// Server timestamp of the registration
        timestamp: i64,
    },
    /// The proposed predecessor is no longer the head; reload and retry
    NodeMismatch,
    /// The event uuid is already registered
    AlreadyExists,
}

/// A local event proposed for registration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventProposal {
    /// Client uuid
    pub uuid: String,
    /// Event type
    pub event_type: crate::types::EventType,
    /// File name after the event
    pub file_name: String,
    /// uuid of the containing folder's registration
    pub folder_uuid: Option<String>,
    /// Authoritative file identity, when already assigned
    pub events_file_id: Option<i64>,
    /// Content hash after the event
    pub file_hash: Option<String>,
    /// Size after the event
    pub file_size: u64,
    /// Proposed causal predecessor
    pub last_event_id: Option<i64>,
    /// uuid of the direct patch producing this content
    pub diff_file_uuid: Option<String>,
    /// uuid of the reverse patch restoring the previous content
    pub rev_diff_file_uuid: Option<String>,
}

/// The authoritative event log API, provided by the driver
#[async_trait]
pub trait EventServer: Send + Sync {
    /// Propose a local event; the server accepts it only if the proposed
    /// predecessor is still the head of the file's chain
    async fn register_event(&self, proposal: EventProposal) -> Result<RegisterOutcome>;

    /// Announce a locally-created patch archive
    async fn register_patch(&self, uuid: &str, size: u64) -> Result<()>;
}

/// Timer deciding when to re-ask for possibly missed events
///
/// Peer-supplied batches are less trustworthy than server-confirmed ones, so
/// the next check comes sooner after them.
pub struct EventsCheckTimer {
    after_peer_batch: Duration,
    after_server_batch: Duration,
    deadline: Instant,
}

impl EventsCheckTimer {
    /// Create a timer with the given intervals; the first check is due after
    /// the peer-batch interval
    pub fn new(after_peer_batch: Duration, after_server_batch: Duration) -> Self {
        Self {
            after_peer_batch,
            after_server_batch,
            deadline: Instant::now() + after_peer_batch,
        }
    }

    /// A batch arrived relayed by a peer
    pub fn on_peer_batch(&mut self) {
        self.deadline = Instant::now() + self.after_peer_batch;
    }

    /// A batch arrived confirmed by the server
    pub fn on_server_batch(&mut self) {
        self.deadline = Instant::now() + self.after_server_batch;
    }

    /// Whether a check is due; firing re-arms with the peer interval
    pub fn fire_if_due(&mut self) -> bool {
        if Instant::now() < self.deadline {
            return false;
        }
        self.deadline = Instant::now() + self.after_peer_batch;
        true
    }
}

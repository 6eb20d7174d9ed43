//! Availability and data consuming
//!
//! The consumer is the bridge between the download manager and the peers: it
//! fans scheduler commands out as wire messages (subscriptions go to every
//! connected peer, chunk requests to one), re-requests availability when a
//! peer connects, and routes inbound responses back into the scheduler.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

use crate::downloader::{DownloadCommand, DownloadManager, PeerCommand};
use crate::types::ObjectType;

use super::PeerRegistry;
use super::protocol::PeerMessage;

/// Routes scheduler commands to peers and peer responses to the scheduler
pub struct Consumer {
    outbound: mpsc::UnboundedSender<(String, PeerMessage)>,
    downloads: DownloadManager,
    registry: Arc<PeerRegistry>,
    subscriptions: Mutex<HashSet<(ObjectType, String)>>,
}

impl Consumer {
    /// Create a consumer bridging the given scheduler and peer registry
    pub fn new(
        outbound: mpsc::UnboundedSender<(String, PeerMessage)>,
        downloads: DownloadManager,
        registry: Arc<PeerRegistry>,
    ) -> Self {
        Self {
            outbound,
            downloads,
            registry,
            subscriptions: Mutex::new(HashSet::new()),
        }
    }

    /// Apply one scheduler command to the wire
    pub fn handle_peer_command(&self, command: PeerCommand) {
        match command {
            PeerCommand::Subscribe { obj_type, obj_id } => {
                self.subscriptions
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert((obj_type, obj_id.clone()));
                for node_id in self.registry.list() {
                    self.send(
                        &node_id,
                        PeerMessage::AvailabilityInfoRequest {
                            obj_type,
                            obj_id: obj_id.clone(),
                        },
                    );
                }
            }
            PeerCommand::Unsubscribe { obj_type, obj_id } => {
                self.subscriptions
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&(obj_type, obj_id.clone()));
                for node_id in self.registry.list() {
                    self.send(
                        &node_id,
                        PeerMessage::AvailabilityInfoAbort {
                            obj_type,
                            obj_id: obj_id.clone(),
                        },
                    );
                }
            }
            PeerCommand::RequestData {
                node_id,
                obj_type,
                obj_id,
                offset,
                length,
            } => {
                self.send(
                    &node_id,
                    PeerMessage::DataRequest {
                        obj_type,
                        obj_id,
                        offset,
                        length,
                    },
                );
            }
            PeerCommand::AbortData {
                node_id,
                obj_type,
                obj_id,
            } => {
                self.send(&node_id, PeerMessage::DataAbort { obj_type, obj_id });
            }
        }
    }

    /// A peer connected: ask it about every active subscription
    pub fn on_peer_connected(&self, node_id: &str) {
        let subscriptions: Vec<(ObjectType, String)> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();
        debug!(node_id, subscriptions = subscriptions.len(), "peer connected, re-requesting");
        for (obj_type, obj_id) in subscriptions {
            self.send(
                node_id,
                PeerMessage::AvailabilityInfoRequest { obj_type, obj_id },
            );
        }
    }

    /// Route an inbound supplier-side message into the scheduler
    pub fn on_message(&self, node_id: &str, message: PeerMessage) {
        match message {
            PeerMessage::AvailabilityInfoResponse { obj_id, ranges, .. } => {
                self.downloads.send(DownloadCommand::AvailabilityInfo {
                    node_id: node_id.to_string(),
                    obj_id,
                    ranges: ranges.iter().map(|r| (r.offset, r.length)).collect(),
                });
            }
            PeerMessage::AvailabilityInfoFailure { obj_id, error, .. } => {
                self.downloads.send(DownloadCommand::AvailabilityFailure {
                    node_id: node_id.to_string(),
                    obj_id,
                    error,
                });
            }
            PeerMessage::DataResponse {
                obj_id,
                offset,
                data,
                ..
            } => {
                let relayed = self.registry.is_relayed(node_id);
                self.downloads.send(DownloadCommand::DataReceived {
                    node_id: node_id.to_string(),
                    obj_id,
                    offset,
                    data,
                    relayed,
                });
            }
            PeerMessage::DataFailure { obj_id, .. } => {
                self.downloads.send(DownloadCommand::DataFailed {
                    node_id: node_id.to_string(),
                    obj_id,
                });
            }
            other => {
                debug!(node_id, ?other, "consumer ignoring supplier-bound message");
            }
        }
    }

    fn send(&self, node_id: &str, message: PeerMessage) {
        self.outbound.send((node_id.to_string(), message)).ok();
    }
}

//! Peer connectivity and message routing
//!
//! [`ConnectivityService`] owns the peer session registry (with relayed vs
//! direct classification), pumps outbound messages through the pluggable
//! [`PeerTransport`], and dispatches inbound frames by message kind: requests
//! go to the [`supplier::Supplier`], responses to the
//! [`consumer::Consumer`]. The transport itself (WebRTC, TCP, whatever the
//! driver provides) is external to this crate.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::downloader::{DownloadCommand, DownloadManager, PeerCommand};
use crate::error::Result;

pub mod consumer;
pub mod protocol;
pub mod supplier;

pub use consumer::Consumer;
pub use protocol::{PeerMessage, Range};
pub use supplier::{Supplier, UploadInfo};

/// Delivers encoded frames to remote peers
///
/// The engine treats peer links as an external collaborator; drivers provide
/// the actual transport (typically the data channels negotiated through the
/// signalling server).
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Send one encoded frame to a peer
    async fn send(&self, node_id: &str, frame: Vec<u8>) -> Result<()>;
}

#[derive(Clone, Copy, Debug)]
struct PeerInfo {
    relayed: bool,
}

/// Connected peer sessions with relayed/direct classification
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, PeerInfo>>,
}

impl PeerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connected peer
    pub fn add(&self, node_id: &str, relayed: bool) {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node_id.to_string(), PeerInfo { relayed });
    }

    /// Remove a peer
    pub fn remove(&self, node_id: &str) -> bool {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(node_id)
            .is_some()
    }

    /// Whether a peer's connection goes through a relay
    pub fn is_relayed(&self, node_id: &str) -> bool {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(node_id)
            .map(|p| p.relayed)
            .unwrap_or(false)
    }

    /// All connected peer ids
    pub fn list(&self) -> Vec<String> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Number of connected peers
    pub fn count(&self) -> usize {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Binds the registry, supplier, consumer, transport, and scheduler together
pub struct ConnectivityService {
    registry: Arc<PeerRegistry>,
    supplier: Arc<Supplier>,
    consumer: Arc<Consumer>,
    downloads: DownloadManager,
    nodes_changed_tx: broadcast::Sender<usize>,
}

impl ConnectivityService {
    /// Create the service and spawn its pumps
    ///
    /// `peer_rx` carries the download scheduler's peer commands;
    /// `outbound_rx` carries messages produced by the supplier and consumer.
    pub fn new(
        registry: Arc<PeerRegistry>,
        supplier: Arc<Supplier>,
        consumer: Arc<Consumer>,
        downloads: DownloadManager,
        transport: Arc<dyn PeerTransport>,
        peer_rx: mpsc::UnboundedReceiver<PeerCommand>,
        outbound_rx: mpsc::UnboundedReceiver<(String, PeerMessage)>,
        cancel: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (nodes_changed_tx, _) = broadcast::channel(16);

        let mut handles = Vec::new();

        // pump: scheduler commands onto the wire
        {
            let consumer = Arc::clone(&consumer);
            let cancel = cancel.clone();
            let mut peer_rx = peer_rx;
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        command = peer_rx.recv() => {
                            let Some(command) = command else { break };
                            consumer.handle_peer_command(command);
                        }
                    }
                }
                debug!("peer command pump stopped");
            }));
        }

        // pump: outbound messages through the transport
        {
            let mut outbound_rx = outbound_rx;
            handles.push(tokio::spawn(async move {
                loop {
                    let (node_id, message) = tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = outbound_rx.recv() => {
                            let Some(next) = next else { break };
                            next
                        }
                    };
                    match message.encode() {
                        Ok(frame) => {
                            if let Err(e) = transport.send(&node_id, frame).await {
                                warn!(node_id, error = %e, "transport send failed");
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to encode peer message"),
                    }
                }
                debug!("outbound pump stopped");
            }));
        }

        (
            Self {
                registry,
                supplier,
                consumer,
                downloads,
                nodes_changed_tx,
            },
            handles,
        )
    }

    /// Subscribe to connected-peer-count changes
    pub fn subscribe_nodes_changed(&self) -> broadcast::Receiver<usize> {
        self.nodes_changed_tx.subscribe()
    }

    /// Number of connected peers
    pub fn peers_count(&self) -> usize {
        self.registry.count()
    }

    /// A peer session opened
    pub fn on_peer_connected(&self, node_id: &str, relayed: bool) {
        info!(node_id, relayed, "peer connected");
        self.registry.add(node_id, relayed);
        self.consumer.on_peer_connected(node_id);
        self.nodes_changed_tx.send(self.registry.count()).ok();
    }

    /// A peer session closed
    pub fn on_peer_disconnected(&self, node_id: &str) {
        if !self.registry.remove(node_id) {
            return;
        }
        info!(node_id, "peer disconnected");
        self.supplier.on_peer_disconnected(node_id);
        self.downloads.send(DownloadCommand::NodeDisconnected {
            node_id: node_id.to_string(),
        });
        self.nodes_changed_tx.send(self.registry.count()).ok();
    }

    /// An encoded frame arrived from a peer
    pub async fn on_frame(&self, node_id: &str, frame: &[u8]) {
        let message = match PeerMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(node_id, error = %e, "dropping undecodable peer frame");
                return;
            }
        };
        self.on_message(node_id, message).await;
    }

    /// Dispatch one decoded peer message
    pub async fn on_message(&self, node_id: &str, message: PeerMessage) {
        match &message {
            PeerMessage::AvailabilityInfoRequest { obj_type, obj_id } => {
                self.supplier
                    .on_availability_request(node_id, *obj_type, obj_id)
                    .await;
            }
            PeerMessage::AvailabilityInfoAbort { obj_type, obj_id } => {
                self.supplier
                    .on_availability_abort(node_id, *obj_type, obj_id);
            }
            PeerMessage::DataRequest {
                obj_type,
                obj_id,
                offset,
                length,
            } => {
                self.supplier
                    .on_data_request(node_id, *obj_type, obj_id, *offset, *length)
                    .await;
            }
            PeerMessage::DataAbort { .. } => {
                // requests are served one-shot; nothing in flight to abort
            }
            PeerMessage::AvailabilityInfoResponse { .. }
            | PeerMessage::AvailabilityInfoFailure { .. }
            | PeerMessage::DataResponse { .. }
            | PeerMessage::DataFailure { .. } => {
                self.consumer.on_message(node_id, message);
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;
    use crate::copies::CopiesStore;
    use crate::db::Database;
    use crate::patches::PatchesStore;
    use crate::speed_limiter::SpeedLimiter;
    use crate::types::ObjectType;
    use std::time::Duration;
    use tempfile::TempDir;

    struct RecordingTransport {
        frames: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl PeerTransport for RecordingTransport {
        async fn send(&self, node_id: &str, frame: Vec<u8>) -> Result<()> {
            self.frames
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((node_id.to_string(), frame));
            Ok(())
        }
    }

    async fn service() -> (
        TempDir,
        ConnectivityService,
        Arc<RecordingTransport>,
        Vec<JoinHandle<()>>,
    ) {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("state");
        let db = Arc::new(Database::in_memory().await.unwrap());
        let copies = Arc::new(
            CopiesStore::open(&state.join("copies"), &state.join("signatures"))
                .await
                .unwrap(),
        );
        let (patches, _patch_rx) = PatchesStore::open(
            &state.join("patches"),
            &state.join("signatures"),
            Arc::clone(&copies),
            Arc::clone(&db),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (dl_events_tx, _dl_events_rx) = mpsc::unbounded_channel();
        let (downloads, _dl_handle) =
            DownloadManager::spawn(&TransferConfig::default(), peer_tx, dl_events_tx);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(PeerRegistry::new());
        let supplier = Arc::new(Supplier::new(
            db,
            copies,
            Arc::new(patches),
            downloads.clone(),
            SpeedLimiter::new(None),
            4,
            outbound_tx.clone(),
        ));
        let consumer = Arc::new(Consumer::new(
            outbound_tx,
            downloads.clone(),
            Arc::clone(&registry),
        ));

        let transport = Arc::new(RecordingTransport {
            frames: Mutex::new(Vec::new()),
        });
        let (service, handles) = ConnectivityService::new(
            registry,
            supplier,
            consumer,
            downloads,
            transport.clone(),
            peer_rx,
            outbound_rx,
            CancellationToken::new(),
        );
        (dir, service, transport, handles)
    }

    #[tokio::test]
    async fn peer_lifecycle_tracks_registry_and_broadcast() {
        let (_dir, service, _transport, _handles) = service().await;
        let mut nodes_rx = service.subscribe_nodes_changed();

        service.on_peer_connected("peer-a", false);
        service.on_peer_connected("peer-b", true);
        assert_eq!(service.peers_count(), 2);
        assert_eq!(nodes_rx.recv().await.unwrap(), 1);
        assert_eq!(nodes_rx.recv().await.unwrap(), 2);

        service.on_peer_disconnected("peer-a");
        assert_eq!(service.peers_count(), 1);
        assert_eq!(nodes_rx.recv().await.unwrap(), 1);

        // unknown peer disconnect is a no-op
        service.on_peer_disconnected("ghost");
        assert_eq!(service.peers_count(), 1);
    }

    #[tokio::test]
    async fn inbound_availability_request_is_answered_via_transport() {
        let (_dir, service, transport, _handles) = service().await;
        service.on_peer_connected("peer-a", false);

        let request = PeerMessage::AvailabilityInfoRequest {
            obj_type: ObjectType::File,
            obj_id: "nobody-knows-this".to_string(),
        };
        service.on_frame("peer-a", &request.encode().unwrap()).await;

        // the failure response flows through the outbound pump
        let frame = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let frames = transport.frames.lock().unwrap();
                    if let Some((node, frame)) = frames.first() {
                        assert_eq!(node, "peer-a");
                        return frame.clone();
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let response = PeerMessage::decode(&frame).unwrap();
        assert!(matches!(
            response,
            PeerMessage::AvailabilityInfoFailure { .. }
        ));
    }

    #[tokio::test]
    async fn undecodable_frames_are_dropped() {
        let (_dir, service, _transport, _handles) = service().await;
        service.on_frame("peer-a", b"garbage").await;
        service.on_frame("peer-a", &[]).await;
    }
}

//! Availability and data supplying
//!
//! The supplier answers availability subscriptions and chunk requests from
//! peers, serving bytes out of the copies store, the patches store, or the
//! staging file of an in-progress download. When local state for an object
//! changes (a part lands, or the event identity moves on), subscribers are
//! notified. Per-object upload info is recorded for the UI with a TTL.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::copies::CopiesStore;
use crate::db::Database;
use crate::downloader::DownloadManager;
use crate::error::{ProtocolError, Result};
use crate::patches::PatchesStore;
use crate::speed_limiter::SpeedLimiter;
use crate::types::ObjectType;

use super::protocol::{PeerMessage, Range};

/// Stale upload-info entries are reaped after this long
const UPLOADS_INFO_TTL: Duration = Duration::from_secs(60);

/// Per-object upload statistics for the UI
#[derive(Clone, Debug)]
pub struct UploadInfo {
    /// Object id being served
    pub obj_id: String,
    /// Peer the bytes go to
    pub node_id: String,
    /// Bytes served so far
    pub uploaded: u64,
    /// Last time a chunk was served
    pub last_activity: Instant,
}

/// Serves availability info and data chunks to peers
pub struct Supplier {
    db: Arc<Database>,
    copies: Arc<CopiesStore>,
    patches: Arc<PatchesStore>,
    downloads: DownloadManager,
    upload_limiter: SpeedLimiter,
    outbound: mpsc::UnboundedSender<(String, PeerMessage)>,
    subscriptions: Mutex<HashMap<(ObjectType, String), HashSet<String>>>,
    uploads_info: Mutex<HashMap<String, UploadInfo>>,
    requests_limit: Arc<tokio::sync::Semaphore>,
}

impl Supplier {
    /// Create a supplier over the local stores
    pub fn new(
        db: Arc<Database>,
        copies: Arc<CopiesStore>,
        patches: Arc<PatchesStore>,
        downloads: DownloadManager,
        upload_limiter: SpeedLimiter,
        processing_requests_limit: usize,
        outbound: mpsc::UnboundedSender<(String, PeerMessage)>,
    ) -> Self {
        Self {
            db,
            copies,
            patches,
            downloads,
            upload_limiter,
            outbound,
            subscriptions: Mutex::new(HashMap::new()),
            uploads_info: Mutex::new(HashMap::new()),
            requests_limit: Arc::new(tokio::sync::Semaphore::new(processing_requests_limit)),
        }
    }

    /// A peer subscribed to an object's availability
    pub async fn on_availability_request(
        &self,
        node_id: &str,
        obj_type: ObjectType,
        obj_id: &str,
    ) {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry((obj_type, obj_id.to_string()))
            .or_default()
            .insert(node_id.to_string());

        match self.local_ranges(obj_type, obj_id).await {
            Ok(ranges) => {
                debug!(node_id, obj_id, ranges = ranges.len(), "availability info served");
                self.send(
                    node_id,
                    PeerMessage::AvailabilityInfoResponse {
                        obj_type,
                        obj_id: obj_id.to_string(),
                        ranges,
                    },
                );
            }
            Err(error) => {
                debug!(node_id, obj_id, ?error, "availability request failed");
                self.send(
                    node_id,
                    PeerMessage::AvailabilityInfoFailure {
                        obj_type,
                        obj_id: obj_id.to_string(),
                        error,
                    },
                );
            }
        }
    }

    /// A peer cancelled its subscription
    pub fn on_availability_abort(&self, node_id: &str, obj_type: ObjectType, obj_id: &str) {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(nodes) = subscriptions.get_mut(&(obj_type, obj_id.to_string())) {
            nodes.remove(node_id);
            if nodes.is_empty() {
                subscriptions.remove(&(obj_type, obj_id.to_string()));
            }
        }
    }

    /// A peer disconnected; drop all its subscriptions
    pub fn on_peer_disconnected(&self, node_id: &str) {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        subscriptions.retain(|_, nodes| {
            nodes.remove(node_id);
            !nodes.is_empty()
        });
    }

    /// A peer requested a byte range
    pub async fn on_data_request(
        self: &Arc<Self>,
        node_id: &str,
        obj_type: ObjectType,
        obj_id: &str,
        offset: u64,
        length: u64,
    ) {
        let Ok(permit) = Arc::clone(&self.requests_limit).try_acquire_owned() else {
            self.send(
                node_id,
                PeerMessage::DataFailure {
                    obj_type,
                    obj_id: obj_id.to_string(),
                    offset,
                    error: ProtocolError::Busy,
                },
            );
            return;
        };

        let source = match self.resolve_source(obj_type, obj_id).await {
            Ok(source) => source,
            Err(error) => {
                self.send(
                    node_id,
                    PeerMessage::DataFailure {
                        obj_type,
                        obj_id: obj_id.to_string(),
                        offset,
                        error,
                    },
                );
                return;
            }
        };

        let supplier = Arc::clone(self);
        let node_id = node_id.to_string();
        let obj_id = obj_id.to_string();
        tokio::spawn(async move {
            let _permit = permit;
            supplier
                .serve_chunk(&node_id, obj_type, &obj_id, &source, offset, length)
                .await;
        });
    }

    async fn serve_chunk(
        &self,
        node_id: &str,
        obj_type: ObjectType,
        obj_id: &str,
        source: &PathBuf,
        offset: u64,
        length: u64,
    ) {
        let path = source.clone();
        let read = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut file = std::fs::File::open(&path)?;
            file.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0u8; length as usize];
            let mut filled = 0;
            while filled < buf.len() {
                match file.read(&mut buf[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            buf.truncate(filled);
            Ok(buf)
        })
        .await;

        let data = match read {
            Ok(Ok(data)) if !data.is_empty() => data,
            Ok(Ok(_)) => {
                self.send(
                    node_id,
                    PeerMessage::DataFailure {
                        obj_type,
                        obj_id: obj_id.to_string(),
                        offset,
                        error: ProtocolError::RangeUnavailable,
                    },
                );
                return;
            }
            Ok(Err(e)) => {
                warn!(obj_id, error = %e, "chunk read failed");
                self.send(
                    node_id,
                    PeerMessage::DataFailure {
                        obj_type,
                        obj_id: obj_id.to_string(),
                        offset,
                        error: ProtocolError::RangeUnavailable,
                    },
                );
                return;
            }
            Err(e) => {
                warn!(obj_id, error = %e, "chunk read task failed");
                return;
            }
        };

        self.upload_limiter.acquire(data.len() as u64).await;
        self.record_upload(obj_id, node_id, data.len() as u64);

        let length = data.len() as u64;
        self.send(
            node_id,
            PeerMessage::DataResponse {
                obj_type,
                obj_id: obj_id.to_string(),
                offset,
                length,
                data,
            },
        );
    }

    /// A new part landed locally; announce it to subscribers
    pub fn announce_part(&self, obj_type: ObjectType, obj_id: &str, offset: u64, length: u64) {
        let nodes: Vec<String> = {
            let subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            subscriptions
                .get(&(obj_type, obj_id.to_string()))
                .map(|nodes| nodes.iter().cloned().collect())
                .unwrap_or_default()
        };
        for node_id in nodes {
            self.send(
                &node_id,
                PeerMessage::AvailabilityInfoResponse {
                    obj_type,
                    obj_id: obj_id.to_string(),
                    ranges: vec![Range { offset, length }],
                },
            );
        }
    }

    /// The identity behind an object changed; fail old subscribers and
    /// re-serve the new id
    pub async fn on_file_changed(&self, old_obj_id: &str, new_obj_id: &str) {
        let old_nodes: Vec<String> = {
            let subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            subscriptions
                .get(&(ObjectType::File, old_obj_id.to_string()))
                .map(|nodes| nodes.iter().cloned().collect())
                .unwrap_or_default()
        };
        for node_id in &old_nodes {
            self.send(
                node_id,
                PeerMessage::AvailabilityInfoFailure {
                    obj_type: ObjectType::File,
                    obj_id: old_obj_id.to_string(),
                    error: ProtocolError::FileChanged,
                },
            );
        }
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(ObjectType::File, old_obj_id.to_string()));

        let new_nodes: Vec<String> = {
            let subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            subscriptions
                .get(&(ObjectType::File, new_obj_id.to_string()))
                .map(|nodes| nodes.iter().cloned().collect())
                .unwrap_or_default()
        };
        for node_id in new_nodes {
            self.on_availability_request(&node_id, ObjectType::File, new_obj_id)
                .await;
        }
    }

    /// Current upload info entries, reaping stale ones
    pub fn uploads_info(&self) -> Vec<UploadInfo> {
        let now = Instant::now();
        let mut info = self.uploads_info.lock().unwrap_or_else(|e| e.into_inner());
        info.retain(|_, entry| now.duration_since(entry.last_activity) < UPLOADS_INFO_TTL);
        info.values().cloned().collect()
    }

    fn record_upload(&self, obj_id: &str, node_id: &str, bytes: u64) {
        let mut info = self.uploads_info.lock().unwrap_or_else(|e| e.into_inner());
        let entry = info
            .entry(format!("{obj_id}:{node_id}"))
            .or_insert_with(|| UploadInfo {
                obj_id: obj_id.to_string(),
                node_id: node_id.to_string(),
                uploaded: 0,
                last_activity: Instant::now(),
            });
        entry.uploaded += bytes;
        entry.last_activity = Instant::now();
    }

    // What we can serve for an object right now.
    async fn local_ranges(
        &self,
        obj_type: ObjectType,
        obj_id: &str,
    ) -> std::result::Result<Vec<Range>, ProtocolError> {
        match obj_type {
            ObjectType::File => {
                let event = self
                    .db
                    .get_event_by_uuid(obj_id)
                    .await
                    .map_err(|_| ProtocolError::UnknownEventUuid)?
                    .ok_or(ProtocolError::UnknownEventUuid)?;
                if event.server_event_id.is_none() {
                    return Err(ProtocolError::FileNotRegistered);
                }
                if let Some(hash) = &event.file_hash
                    && self.copies.copy_exists(hash)
                {
                    let size = self.copies.get_copy_size(hash);
                    return Ok(vec![Range {
                        offset: 0,
                        length: size,
                    }]);
                }
                Ok(self.partial_ranges(obj_id).await)
            }
            ObjectType::Patch => {
                if self.patches.patch_exists(obj_id) {
                    return Ok(vec![Range {
                        offset: 0,
                        length: self.patches.get_patch_size(obj_id),
                    }]);
                }
                Ok(self.partial_ranges(obj_id).await)
            }
        }
    }

    async fn partial_ranges(&self, obj_id: &str) -> Vec<Range> {
        match self.downloads.downloaded_ranges(obj_id).await {
            Some((map, _)) => map
                .iter()
                .map(|(offset, length)| Range { offset, length })
                .collect(),
            None => Vec::new(),
        }
    }

    // Where the object's bytes live right now.
    async fn resolve_source(
        &self,
        obj_type: ObjectType,
        obj_id: &str,
    ) -> std::result::Result<PathBuf, ProtocolError> {
        match obj_type {
            ObjectType::File => {
                let event = self
                    .db
                    .get_event_by_uuid(obj_id)
                    .await
                    .map_err(|_| ProtocolError::UnknownEventUuid)?
                    .ok_or(ProtocolError::UnknownEventUuid)?;
                if let Some(hash) = &event.file_hash
                    && self.copies.copy_exists(hash)
                {
                    return Ok(self.copies.copy_path(hash));
                }
            }
            ObjectType::Patch => {
                if self.patches.patch_exists(obj_id) {
                    return Ok(self.patches.patch_path(obj_id));
                }
            }
        }
        match self.downloads.downloaded_ranges(obj_id).await {
            Some((_, path)) => Ok(path),
            None => Err(ProtocolError::RangeUnavailable),
        }
    }

    fn send(&self, node_id: &str, message: PeerMessage) {
        self.outbound.send((node_id.to_string(), message)).ok();
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;
    use crate::db::{NewEvent, NewFile};
    use crate::types::{EventState, EventType, FileId};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        db: Arc<Database>,
        copies: Arc<CopiesStore>,
        supplier: Arc<Supplier>,
        outbound_rx: mpsc::UnboundedReceiver<(String, PeerMessage)>,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("state");
        let db = Arc::new(Database::in_memory().await.unwrap());
        let copies = Arc::new(
            CopiesStore::open(&state.join("copies"), &state.join("signatures"))
                .await
                .unwrap(),
        );
        let (patches, _transfers_rx) = PatchesStore::open(
            &state.join("patches"),
            &state.join("signatures"),
            Arc::clone(&copies),
            Arc::clone(&db),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        let (peer_tx, _peer_rx) = mpsc::unbounded_channel();
        let (dl_events_tx, _dl_events_rx) = mpsc::unbounded_channel();
        let (downloads, _handle) =
            DownloadManager::spawn(&TransferConfig::default(), peer_tx, dl_events_tx);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let supplier = Arc::new(Supplier::new(
            Arc::clone(&db),
            Arc::clone(&copies),
            Arc::new(patches),
            downloads,
            SpeedLimiter::new(None),
            4,
            outbound_tx,
        ));

        Fixture {
            _dir: dir,
            db,
            copies,
            supplier,
            outbound_rx,
        }
    }

    async fn registered_event(f: &Fixture, uuid: &str, hash: &str) {
        let file_id = f
            .db
            .insert_file(&NewFile {
                relative_path: format!("f-{uuid}.bin"),
                is_folder: false,
                file_hash: Some(hash.to_string()),
                mtime: 1,
                size: 10,
                events_file_id: Some(1),
            })
            .await
            .unwrap();
        f.db
            .insert_event(&NewEvent {
                uuid: uuid.to_string(),
                server_event_id: None,
                file_id,
                event_type: EventType::Create.to_i32(),
                file_name: format!("f-{uuid}.bin"),
                folder_uuid: None,
                file_hash: Some(hash.to_string()),
                file_hash_before_event: None,
                file_size: 10,
                file_size_before_event: 0,
                diff_file_uuid: None,
                rev_diff_file_uuid: None,
                state: EventState::Sent.to_i32(),
                last_event_id: None,
                timestamp: 1,
            })
            .await
            .unwrap();
        f.db.set_server_event_id(uuid, 5, EventState::Applied)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_event_uuid_fails_subscription() {
        let mut f = fixture().await;
        f.supplier
            .on_availability_request("peer-1", ObjectType::File, "no-such-event")
            .await;

        let (node, message) = f.outbound_rx.recv().await.unwrap();
        assert_eq!(node, "peer-1");
        assert_eq!(
            message,
            PeerMessage::AvailabilityInfoFailure {
                obj_type: ObjectType::File,
                obj_id: "no-such-event".to_string(),
                error: ProtocolError::UnknownEventUuid,
            }
        );
    }

    #[tokio::test]
    async fn unregistered_event_reports_not_registered() {
        let mut f = fixture().await;
        let file_id = f
            .db
            .insert_file(&NewFile {
                relative_path: "pending.bin".to_string(),
                is_folder: false,
                file_hash: None,
                mtime: 1,
                size: 1,
                events_file_id: None,
            })
            .await
            .unwrap();
        f.db
            .insert_event(&NewEvent {
                uuid: "pending-ev".to_string(),
                server_event_id: None,
                file_id,
                event_type: EventType::Create.to_i32(),
                file_name: "pending.bin".to_string(),
                folder_uuid: None,
                file_hash: None,
                file_hash_before_event: None,
                file_size: 1,
                file_size_before_event: 0,
                diff_file_uuid: None,
                rev_diff_file_uuid: None,
                state: EventState::Sent.to_i32(),
                last_event_id: None,
                timestamp: 1,
            })
            .await
            .unwrap();

        f.supplier
            .on_availability_request("peer-1", ObjectType::File, "pending-ev")
            .await;

        let (_, message) = f.outbound_rx.recv().await.unwrap();
        assert!(matches!(
            message,
            PeerMessage::AvailabilityInfoFailure {
                error: ProtocolError::FileNotRegistered,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn full_copy_advertises_whole_range_and_serves_data() {
        let mut f = fixture().await;
        let hash = "11112222333344445555666677778888";
        std::fs::write(f.copies.copy_path(hash), b"full file!").unwrap();
        registered_event(&f, "ev-full", hash).await;

        f.supplier
            .on_availability_request("peer-1", ObjectType::File, "ev-full")
            .await;
        let (_, message) = f.outbound_rx.recv().await.unwrap();
        assert_eq!(
            message,
            PeerMessage::AvailabilityInfoResponse {
                obj_type: ObjectType::File,
                obj_id: "ev-full".to_string(),
                ranges: vec![Range {
                    offset: 0,
                    length: 10
                }],
            }
        );

        f.supplier
            .on_data_request("peer-1", ObjectType::File, "ev-full", 5, 5)
            .await;
        let (_, message) = tokio::time::timeout(Duration::from_secs(5), f.outbound_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let PeerMessage::DataResponse { offset, data, .. } = message else {
            panic!("expected data response, got {message:?}");
        };
        assert_eq!(offset, 5);
        assert_eq!(data, b"file!");

        let uploads = f.supplier.uploads_info();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].uploaded, 5);
    }

    #[tokio::test]
    async fn part_announcements_reach_subscribers_only() {
        let mut f = fixture().await;
        let hash = "aaaabbbbccccddddeeeeffff00001111";
        std::fs::write(f.copies.copy_path(hash), b"ten bytes!").unwrap();
        registered_event(&f, "ev-sub", hash).await;

        f.supplier
            .on_availability_request("peer-1", ObjectType::File, "ev-sub")
            .await;
        f.outbound_rx.recv().await.unwrap(); // initial response

        f.supplier
            .announce_part(ObjectType::File, "ev-sub", 1024, 4096);
        let (node, message) = f.outbound_rx.recv().await.unwrap();
        assert_eq!(node, "peer-1");
        assert!(matches!(
            message,
            PeerMessage::AvailabilityInfoResponse { ranges, .. }
                if ranges == vec![Range { offset: 1024, length: 4096 }]
        ));

        // after abort, no further announcements arrive
        f.supplier
            .on_availability_abort("peer-1", ObjectType::File, "ev-sub");
        f.supplier
            .announce_part(ObjectType::File, "ev-sub", 0, 10);
        assert!(f.outbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn file_changed_fails_old_subscribers() {
        let mut f = fixture().await;
        let hash = "99998888777766665555444433332222";
        std::fs::write(f.copies.copy_path(hash), b"ten bytes!").unwrap();
        registered_event(&f, "ev-old", hash).await;

        f.supplier
            .on_availability_request("peer-1", ObjectType::File, "ev-old")
            .await;
        f.outbound_rx.recv().await.unwrap();

        f.supplier.on_file_changed("ev-old", "ev-new").await;
        let (_, message) = f.outbound_rx.recv().await.unwrap();
        assert!(matches!(
            message,
            PeerMessage::AvailabilityInfoFailure {
                error: ProtocolError::FileChanged,
                ..
            }
        ));
    }
}

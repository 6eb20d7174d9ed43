//! Engine-level tests: local registration, remote application, conflicts,
//! exclusion, and the status machine, driven through stub external services.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::*;
use crate::error::Result as CrateResult;
use crate::signalling::{EventProposal, RegisterOutcome, RemoteFileEvent};
use crate::types::EventState;
use crate::types::EventType;

struct StubServer {
    next_event_id: AtomicI64,
    next_file_id: AtomicI64,
    mismatch_once: AtomicBool,
    registered: Mutex<Vec<EventProposal>>,
}

impl StubServer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_event_id: AtomicI64::new(1),
            next_file_id: AtomicI64::new(100),
            mismatch_once: AtomicBool::new(false),
            registered: Mutex::new(Vec::new()),
        })
    }

    fn registered_count(&self) -> usize {
        self.registered.lock().unwrap().len()
    }
}

#[async_trait]
impl EventServer for StubServer {
    async fn register_event(&self, proposal: EventProposal) -> CrateResult<RegisterOutcome> {
        if self.mismatch_once.swap(false, Ordering::SeqCst) {
            return Ok(RegisterOutcome::NodeMismatch);
        }
        let events_file_id = proposal
            .events_file_id
            .unwrap_or_else(|| self.next_file_id.fetch_add(1, Ordering::SeqCst));
        self.registered.lock().unwrap().push(proposal);
        Ok(RegisterOutcome::Registered {
            server_event_id: self.next_event_id.fetch_add(1, Ordering::SeqCst),
            events_file_id,
            timestamp: 0,
        })
    }

    async fn register_patch(&self, _uuid: &str, _size: u64) -> CrateResult<()> {
        Ok(())
    }
}

struct StubSignalling {
    sent: Mutex<Vec<OutboundMessage>>,
}

#[async_trait]
impl SignallingClient for StubSignalling {
    async fn send(&self, message: OutboundMessage) -> CrateResult<()> {
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

struct NullTransport;

#[async_trait]
impl PeerTransport for NullTransport {
    async fn send(&self, _node_id: &str, _frame: Vec<u8>) -> CrateResult<()> {
        Ok(())
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    engine: Arc<SyncEngine>,
    server: Arc<StubServer>,
    root: PathBuf,
}

async fn engine_fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("root");
    let mut config = Config::new(&root, "test-node");
    config.monitor.debounce = Duration::from_millis(50);

    let server = StubServer::new();
    let signalling = Arc::new(StubSignalling {
        sent: Mutex::new(Vec::new()),
    });

    let engine = SyncEngine::new(config, server.clone(), signalling, Arc::new(NullTransport))
        .await
        .unwrap();
    engine.start().await.unwrap();

    Fixture {
        _dir: dir,
        engine,
        server,
        root,
    }
}

async fn wait_for<F>(what: &str, mut check: F)
where
    F: AsyncFnMut() -> bool,
{
    let deadline = std::time::Instant::now() + Duration::from_secs(15);
    loop {
        if check().await {
            return;
        }
        if std::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_registered(f: &Fixture, path: &str) -> (crate::db::FileRecord, i64) {
    let mut found = None;
    wait_for(&format!("{path} registered"), async || {
        let Ok(Some(record)) = f.engine.db.get_file_by_path(path).await else {
            return false;
        };
        let Ok(Some(head)) = f.engine.db.head_event(record.id).await else {
            return false;
        };
        if let Some(sid) = head.server_event_id {
            found = Some((record, sid));
            true
        } else {
            false
        }
    })
    .await;
    found.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_create_registers_and_stores_copy() {
    let f = engine_fixture().await;
    std::fs::write(f.root.join("a.txt"), b"hello\n").unwrap();

    let (record, _sid) = wait_registered(&f, "a.txt").await;
    let hash = record.file_hash.clone().unwrap();

    // content-addressed blob exists and is referenced by record + event
    assert!(f.engine.copies.copy_path(&hash).exists());
    assert!(f.engine.copies.refcount(&hash).await.unwrap() >= 1);
    assert_eq!(f.server.registered_count(), 1);

    let head = f.engine.db.head_event(record.id).await.unwrap().unwrap();
    assert_eq!(head.state(), EventState::Applied);
    assert_eq!(head.event_type(), EventType::Create);

    f.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_create_materializes_without_reregistration() {
    let f = engine_fixture().await;

    // the content is already present as a blob (e.g. fetched from the swarm)
    let content = b"remote bytes arriving";
    let probe = f.root.join(".pvtbox/probe");
    std::fs::write(&probe, content).unwrap();
    let hash = crate::rsync::file_hash(&probe).unwrap();
    std::fs::write(f.engine.copies.copy_path(&hash), content).unwrap();

    f.engine
        .handle_signalling(InboundMessage::FileEvents {
            events: vec![RemoteFileEvent {
                uuid: "remote-ev-1".to_string(),
                server_event_id: 50,
                events_file_id: 9000,
                event_type: EventType::Create,
                file_name: "incoming.txt".to_string(),
                folder_uuid: None,
                file_hash: Some(hash.clone()),
                file_hash_before_event: None,
                file_size: content.len() as u64,
                diff_file_uuid: None,
                rev_diff_file_uuid: None,
                last_event_id: None,
                timestamp: 1,
            }],
            node_id: None,
        })
        .await
        .unwrap();

    wait_for("remote file materialized", async || {
        f.root.join("incoming.txt").exists()
    })
    .await;
    assert_eq!(std::fs::read(f.root.join("incoming.txt")).unwrap(), content);

    // the applied event heads the chain; the quiet echo never re-registers
    let record = f
        .engine
        .db
        .get_file_by_path("incoming.txt")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.events_file_id, Some(9000));
    let head = f.engine.db.head_event(record.id).await.unwrap().unwrap();
    assert_eq!(head.uuid, "remote-ev-1");
    assert_eq!(head.state(), EventState::Applied);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        f.server.registered_count(),
        0,
        "remote-caused changes never round-trip"
    );

    f.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_move_renames_without_redownload(){
    let f = engine_fixture().await;
    std::fs::write(f.root.join("d1_f.txt"), b"movable payload here").unwrap();
    let (record, sid) = wait_registered(&f, "d1_f.txt").await;
    let hash = record.file_hash.clone().unwrap();
    let refcount_before = f.engine.copies.refcount(&hash).await.unwrap();
    let events_file_id = record.events_file_id.unwrap();

    f.engine
        .handle_signalling(InboundMessage::FileEvents {
            events: vec![RemoteFileEvent {
                uuid: "remote-move".to_string(),
                server_event_id: sid + 1,
                events_file_id,
                event_type: EventType::Move,
                file_name: "d2_f.txt".to_string(),
                folder_uuid: None,
                file_hash: Some(hash.clone()),
                file_hash_before_event: Some(hash.clone()),
                file_size: record.size as u64,
                diff_file_uuid: None,
                rev_diff_file_uuid: None,
                last_event_id: Some(sid),
                timestamp: 2,
            }],
            node_id: None,
        })
        .await
        .unwrap();

    wait_for("file renamed", async || {
        f.root.join("d2_f.txt").exists() && !f.root.join("d1_f.txt").exists()
    })
    .await;

    let moved = f
        .engine
        .db
        .get_file_by_path("d2_f.txt")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(moved.id, record.id, "same record, new path");
    assert_eq!(moved.file_hash.as_deref(), Some(hash.as_str()));
    assert_eq!(
        f.engine.copies.refcount(&hash).await.unwrap(),
        refcount_before,
        "no content transferred for a move"
    );
    assert_eq!(f.engine.downloads.downloads_count(), 0);

    f.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn conflicting_modify_yields_conflict_copy() {
    let f = engine_fixture().await;
    std::fs::write(f.root.join("x.txt"), b"base content v0!").unwrap();
    let (record, sid) = wait_registered(&f, "x.txt").await;
    let events_file_id = record.events_file_id.unwrap();

    // the next local registration loses the race
    f.server.mismatch_once.store(true, Ordering::SeqCst);
    std::fs::write(f.root.join("x.txt"), b"local edit wins?").unwrap();

    wait_for("local event conflicted", async || {
        let chain = f.engine.db.events_for_file(record.id).await.unwrap();
        chain.iter().any(|e| e.state() == EventState::Conflicted)
    })
    .await;

    // the remote winner arrives with different content
    let remote_content = b"remote edit won!";
    let probe = f.root.join(".pvtbox/probe");
    std::fs::write(&probe, remote_content).unwrap();
    let remote_hash = crate::rsync::file_hash(&probe).unwrap();
    std::fs::write(f.engine.copies.copy_path(&remote_hash), remote_content).unwrap();

    f.engine
        .handle_signalling(InboundMessage::FileEvents {
            events: vec![RemoteFileEvent {
                uuid: "winner".to_string(),
                server_event_id: sid + 1,
                events_file_id,
                event_type: EventType::Update,
                file_name: "x.txt".to_string(),
                folder_uuid: None,
                file_hash: Some(remote_hash.clone()),
                file_hash_before_event: record.file_hash.clone(),
                file_size: remote_content.len() as u64,
                diff_file_uuid: None,
                rev_diff_file_uuid: None,
                last_event_id: Some(sid),
                timestamp: 3,
            }],
            node_id: None,
        })
        .await
        .unwrap();

    wait_for("remote content applied", async || {
        std::fs::read(f.root.join("x.txt"))
            .map(|c| c == remote_content)
            .unwrap_or(false)
    })
    .await;

    // the local content survives under a conflict name
    let conflict: Vec<PathBuf> = std::fs::read_dir(&f.root)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains("Conflicted copy"))
        })
        .collect();
    assert_eq!(conflict.len(), 1, "exactly one conflict copy");
    assert_eq!(
        std::fs::read(&conflict[0]).unwrap(),
        b"local edit wins?",
        "conflict copy holds the losing local content"
    );

    // the discarded local chain entry is occupied
    let chain = f.engine.db.events_for_file(record.id).await.unwrap();
    assert!(chain.iter().any(|e| e.state() == EventState::Occupied));

    f.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replayed_remote_delete_is_idempotent() {
    let f = engine_fixture().await;
    std::fs::write(f.root.join("victim.txt"), b"to be deleted").unwrap();
    let (record, sid) = wait_registered(&f, "victim.txt").await;
    let events_file_id = record.events_file_id.unwrap();

    let delete_batch = InboundMessage::FileEvents {
        events: vec![RemoteFileEvent {
            uuid: "remote-delete".to_string(),
            server_event_id: sid + 1,
            events_file_id,
            event_type: EventType::Delete,
            file_name: "victim.txt".to_string(),
            folder_uuid: None,
            file_hash: None,
            file_hash_before_event: record.file_hash.clone(),
            file_size: 0,
            diff_file_uuid: None,
            rev_diff_file_uuid: None,
            last_event_id: Some(sid),
            timestamp: 4,
        }],
        node_id: None,
    };

    f.engine.handle_signalling(delete_batch.clone()).await.unwrap();
    wait_for("file deleted", async || !f.root.join("victim.txt").exists()).await;

    // replaying the same batch neither errors nor resurrects anything
    f.engine.handle_signalling(delete_batch).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!f.root.join("victim.txt").exists());

    f.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn excluded_subtree_keeps_history_but_not_content() {
    let f = engine_fixture().await;
    std::fs::create_dir(f.root.join("private")).unwrap();
    std::fs::write(f.root.join("private/secret.txt"), b"hidden bytes").unwrap();
    wait_registered(&f, "private/secret.txt").await;

    f.engine
        .event_queue()
        .exclude_dir(Path::new("private"))
        .await
        .unwrap();

    assert!(!f.root.join("private").exists(), "content removed from disk");
    let record = f
        .engine
        .db
        .get_file_by_path("private/secret.txt")
        .await
        .unwrap()
        .unwrap();
    assert!(record.excluded, "record survives, flagged excluded");

    // remote events under the exclusion advance history without touching disk
    let events_file_id = record.events_file_id.unwrap();
    let head = f.engine.db.head_event(record.id).await.unwrap().unwrap();
    f.engine
        .handle_signalling(InboundMessage::FileEvents {
            events: vec![RemoteFileEvent {
                uuid: "excluded-update".to_string(),
                server_event_id: head.server_event_id.unwrap() + 1,
                events_file_id,
                event_type: EventType::Update,
                file_name: "secret.txt".to_string(),
                folder_uuid: None,
                file_hash: Some("00ff00ff00ff00ff00ff00ff00ff00ff".to_string()),
                file_hash_before_event: record.file_hash.clone(),
                file_size: 12,
                diff_file_uuid: None,
                rev_diff_file_uuid: None,
                last_event_id: head.server_event_id,
                timestamp: 5,
            }],
            node_id: None,
        })
        .await
        .unwrap();

    wait_for("excluded event applied", async || {
        f.engine
            .db
            .get_event_by_uuid("excluded-update")
            .await
            .ok()
            .flatten()
            .is_some_and(|e| e.state() == EventState::Applied)
    })
    .await;
    assert!(!f.root.join("private/secret.txt").exists());
    assert_eq!(f.engine.downloads.downloads_count(), 0);

    f.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_engine_reaches_wait_status() {
    let f = engine_fixture().await;

    wait_for("status WAIT", async || {
        let (status, _, _) = f.engine.status();
        status == SyncStatus::Wait
    })
    .await;

    f.engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pause_is_sticky_until_resumed() {
    let f = engine_fixture().await;

    f.engine.pause();
    let (status, _, _) = f.engine.status();
    assert_eq!(status, SyncStatus::Pause);

    // work arriving does not lift the pause
    std::fs::write(f.root.join("while-paused.txt"), b"x").unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    let (status, _, _) = f.engine.status();
    assert_eq!(status, SyncStatus::Pause);

    f.engine.resume();
    wait_for("leaves pause", async || {
        let (status, _, _) = f.engine.status();
        status != SyncStatus::Pause
    })
    .await;

    f.engine.shutdown().await;
}

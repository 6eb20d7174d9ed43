//! Filesystem monitoring for the sync root
//!
//! The monitor owns the recursive watcher, the startup offline scan, the
//! debounce batcher, and the worker pool that walks events through the
//! [`pipeline`]. Raw watcher events are filtered (hidden names, excluded
//! directories, the state directory), tagged quiet when they match a path the
//! [`crate::quiet::QuietProcessor`] announced, coalesced per path within the
//! debounce window, and dispatched with per-path serialization: an event is
//! never dispatched while an overlapping path is still being processed.

use notify::{Config as NotifyConfig, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;
use crate::copies::CopiesStore;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::{Event, FileListEntry};
use crate::utils;

pub mod fs_event;
pub(crate) mod pipeline;

pub use fs_event::{FsEvent, FsEventType};
pub use pipeline::LocalEvent;

use pipeline::{Pipeline, ProcessResult};

/// Quiet markers age out after this long even if the watcher never echoes them
const QUIET_MARKER_TTL: Duration = Duration::from_secs(30);

/// Dispatcher tick driving debounce deadlines and stale-marker sweeps
const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Paths about to be mutated by a remote apply
///
/// The quiet processor marks a path before touching it; the monitor consumes
/// the marker when the corresponding raw event arrives and tags the event
/// quiet. Markers left unconsumed expire after a TTL to avoid livelock.
#[derive(Clone, Default)]
pub struct QuietPaths {
    inner: Arc<Mutex<HashMap<PathBuf, Instant>>>,
}

impl QuietPaths {
    /// Create an empty marker set
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a root-relative path as about to change
    pub fn mark(&self, path: &Path) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_path_buf(), Instant::now());
    }

    /// Consume a marker for the path (or any ancestor marker covering it)
    pub fn take(&self, path: &Path) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.remove(path).is_some() {
            return true;
        }
        // a folder marker covers the raw events of its children
        let covering: Option<PathBuf> = inner
            .keys()
            .find(|marked| path.starts_with(marked))
            .cloned();
        match covering {
            Some(_) => true,
            None => false,
        }
    }

    /// Drop markers older than the TTL
    fn sweep(&self) {
        let now = Instant::now();
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, t| now.duration_since(*t) < QUIET_MARKER_TTL);
    }
}

struct PendingEvent {
    event: FsEvent,
    deadline: Instant,
    // size/mtime snapshot taken when the event was queued; a change at
    // dispatch time means the file is still being written
    observed_size: Option<u64>,
    observed_mtime: Option<i64>,
}

struct WorkerDone {
    path: PathBuf,
    requeue: Vec<FsEvent>,
}

/// Watches the sync root and drives the staged action pipeline
pub struct FilesystemMonitor {
    root: PathBuf,
    config: MonitorConfig,
    db: Arc<Database>,
    pipeline: Arc<Pipeline>,
    quiet_paths: QuietPaths,
    events_tx: broadcast::Sender<Event>,
    fs_events_count: Arc<AtomicUsize>,
    excluded_dirs: Arc<Mutex<Vec<PathBuf>>>,
    injected: Arc<Mutex<Vec<FsEvent>>>,
    cancel: CancellationToken,
}

impl FilesystemMonitor {
    /// Create a monitor for the given root
    ///
    /// `local_tx` receives the processed [`LocalEvent`]s; `events_tx` carries
    /// UI-facing notifications.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        root: PathBuf,
        config: MonitorConfig,
        db: Arc<Database>,
        copies: Arc<CopiesStore>,
        signatures_dir: PathBuf,
        quiet_paths: QuietPaths,
        events_tx: broadcast::Sender<Event>,
        local_tx: mpsc::UnboundedSender<LocalEvent>,
    ) -> Self {
        let pipeline = Arc::new(Pipeline::new(
            root.clone(),
            Arc::clone(&db),
            copies,
            signatures_dir,
            config.max_relative_path_len,
            events_tx.clone(),
            local_tx,
        ));
        let excluded_dirs = Arc::new(Mutex::new(config.excluded_dirs.clone()));

        Self {
            root,
            config,
            db,
            pipeline,
            quiet_paths,
            events_tx,
            fs_events_count: Arc::new(AtomicUsize::new(0)),
            excluded_dirs,
            injected: Arc::new(Mutex::new(Vec::new())),
            cancel: CancellationToken::new(),
        }
    }

    /// Number of events currently pending or in flight
    pub fn fs_events_count(&self) -> usize {
        self.fs_events_count.load(Ordering::Relaxed)
    }

    /// Shared counter handle for the orchestrator's status derivation
    pub(crate) fn fs_events_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.fs_events_count)
    }

    /// Paths quarantined by the long-path filter
    pub fn long_paths(&self) -> Vec<PathBuf> {
        self.pipeline.long_paths()
    }

    /// Whether the disk-full condition is currently sticky
    pub fn is_disk_full(&self) -> bool {
        self.pipeline.is_disk_full()
    }

    /// The current most-recently-changed file list
    pub fn file_list(&self) -> Vec<FileListEntry> {
        self.pipeline.file_list()
    }

    /// Replace the excluded directory set
    pub fn set_excluded_dirs(&self, dirs: Vec<PathBuf>) {
        *self.excluded_dirs.lock().unwrap_or_else(|e| e.into_inner()) = dirs;
    }

    /// Stop the monitor
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Start watching: spawns the watcher and the dispatcher task
    ///
    /// The returned handle completes when the monitor stops.
    pub fn start(&self) -> Result<JoinHandle<()>> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<notify::Result<notify::Event>>();

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                if raw_tx.send(res).is_err() {
                    // dispatcher gone; nothing to do
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|e| Error::Monitor(e.to_string()))?;

        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| Error::Monitor(format!("failed to watch sync root: {e}")))?;

        info!(root = %self.root.display(), "filesystem monitor started");

        let dispatcher = Dispatcher {
            root: self.root.clone(),
            config: self.config.clone(),
            pipeline: Arc::clone(&self.pipeline),
            quiet_paths: self.quiet_paths.clone(),
            events_tx: self.events_tx.clone(),
            fs_events_count: Arc::clone(&self.fs_events_count),
            excluded_dirs: Arc::clone(&self.excluded_dirs),
            injected: Arc::clone(&self.injected),
            cancel: self.cancel.clone(),
        };

        let handle = tokio::spawn(async move {
            // the watcher must stay alive for the duration of the loop
            let _watcher = watcher;
            dispatcher.run(raw_rx).await;
        });
        Ok(handle)
    }

    /// Diff the disk against storage and synthesize offline events
    ///
    /// DELETE for known-but-missing, CREATE for present-but-unknown, and,
    /// when enabled, MODIFY for present-and-known (unchanged files are
    /// filtered later by the mtime/size stage).
    pub async fn offline_scan(&self) -> Result<Vec<FsEvent>> {
        let mut on_disk: HashMap<PathBuf, bool> = HashMap::new();
        let excluded = self.excluded_dirs.lock().unwrap_or_else(|e| e.into_inner()).clone();
        scan_dir(&self.root, &self.root, &excluded, &mut on_disk)?;

        let known = self.db.list_files().await?;
        let mut events = Vec::new();

        for record in &known {
            let rel = PathBuf::from(&record.relative_path);
            if record.excluded {
                continue;
            }
            match on_disk.get(&rel) {
                None => {
                    events.push(FsEvent::new_offline(
                        FsEventType::Delete,
                        rel,
                        record.is_folder,
                    ));
                }
                Some(_) if self.config.check_offline_modifies && !record.is_folder => {
                    events.push(FsEvent::new_offline(FsEventType::Modify, rel, false));
                }
                Some(_) => {}
            }
        }

        let known_paths: HashSet<&str> = known.iter().map(|r| r.relative_path.as_str()).collect();
        for (rel, is_dir) in &on_disk {
            if !known_paths.contains(rel.to_string_lossy().as_ref()) {
                events.push(FsEvent::new_offline(FsEventType::Create, rel.clone(), *is_dir));
            }
        }

        info!(count = events.len(), "offline scan produced events");
        Ok(events)
    }

    /// Feed offline-scan events into the pipeline via the dispatcher
    pub fn inject(&self, events: Vec<FsEvent>) {
        debug!(count = events.len(), "injecting offline events");
        self.injected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(events);
    }
}

struct Dispatcher {
    root: PathBuf,
    config: MonitorConfig,
    pipeline: Arc<Pipeline>,
    quiet_paths: QuietPaths,
    events_tx: broadcast::Sender<Event>,
    fs_events_count: Arc<AtomicUsize>,
    excluded_dirs: Arc<Mutex<Vec<PathBuf>>>,
    injected: Arc<Mutex<Vec<FsEvent>>>,
    cancel: CancellationToken,
}

impl Dispatcher {
    async fn run(self, mut raw_rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>) {
        let mut pending: HashMap<PathBuf, PendingEvent> = HashMap::new();
        let mut processing: HashSet<PathBuf> = HashSet::new();
        let mut in_flight = 0usize;
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<WorkerDone>();
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        let mut root_missing_reported = false;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                Some(result) = raw_rx.recv() => {
                    match result {
                        Ok(raw) => {
                            for event in self.normalize(raw) {
                                self.enqueue(&mut pending, event);
                            }
                        }
                        Err(e) => error!(error = %e, "filesystem watcher error"),
                    }
                }

                Some(done) = done_rx.recv() => {
                    processing.remove(&done.path);
                    in_flight -= 1;
                    for event in done.requeue {
                        self.enqueue(&mut pending, event);
                    }
                }

                _ = tick.tick() => {
                    if !self.root.exists() {
                        if !root_missing_reported {
                            root_missing_reported = true;
                            warn!(root = %self.root.display(), "sync root is missing");
                            self.events_tx.send(Event::SyncFolderRemoved).ok();
                        }
                        continue;
                    }
                    root_missing_reported = false;

                    self.quiet_paths.sweep();
                    let injected: Vec<FsEvent> = {
                        let mut injected = self.injected.lock().unwrap_or_else(|e| e.into_inner());
                        injected.drain(..).collect()
                    };
                    for event in injected {
                        self.enqueue(&mut pending, event);
                    }
                    self.dispatch_due(&mut pending, &mut processing, &mut in_flight, &done_tx);
                }
            }

            self.fs_events_count
                .store(pending.len() + in_flight, Ordering::Relaxed);
        }

        info!("filesystem monitor stopped");
    }

    // Turn one raw notify event into zero or more pipeline events, applying
    // hidden-name, excluded-dir, and quiet filters.
    fn normalize(&self, raw: notify::Event) -> Vec<FsEvent> {
        let mut events = Vec::new();

        let kinds: Vec<(FsEventType, PathBuf, Option<PathBuf>)> = match raw.kind {
            EventKind::Create(_) => raw
                .paths
                .iter()
                .map(|p| (FsEventType::Create, p.clone(), None))
                .collect(),
            EventKind::Remove(_) => raw
                .paths
                .iter()
                .map(|p| (FsEventType::Delete, p.clone(), None))
                .collect(),
            EventKind::Modify(notify::event::ModifyKind::Name(rename)) => {
                use notify::event::RenameMode;
                match rename {
                    RenameMode::Both if raw.paths.len() >= 2 => {
                        vec![(
                            FsEventType::Move,
                            raw.paths[0].clone(),
                            Some(raw.paths[1].clone()),
                        )]
                    }
                    RenameMode::From => raw
                        .paths
                        .iter()
                        .map(|p| (FsEventType::Delete, p.clone(), None))
                        .collect(),
                    RenameMode::To => raw
                        .paths
                        .iter()
                        .map(|p| (FsEventType::Create, p.clone(), None))
                        .collect(),
                    _ => raw
                        .paths
                        .iter()
                        .map(|p| (FsEventType::Modify, p.clone(), None))
                        .collect(),
                }
            }
            EventKind::Modify(_) => raw
                .paths
                .iter()
                .map(|p| (FsEventType::Modify, p.clone(), None))
                .collect(),
            _ => Vec::new(),
        };

        let excluded = self.excluded_dirs.lock().unwrap_or_else(|e| e.into_inner()).clone();

        for (event_type, abs_src, abs_dst) in kinds {
            let Some(src) = utils::relative_to_root(&abs_src, &self.root) else {
                continue;
            };
            if src.as_os_str().is_empty()
                || utils::is_hidden_path(&src)
                || utils::is_in_dirs(&src, &excluded)
            {
                continue;
            }

            let is_dir = abs_dst
                .as_deref()
                .unwrap_or(&abs_src)
                .is_dir();

            let mut event = match (event_type, abs_dst) {
                (FsEventType::Move, Some(abs_dst)) => {
                    let Some(dst) = utils::relative_to_root(&abs_dst, &self.root) else {
                        continue;
                    };
                    if utils::is_hidden_path(&dst) || utils::is_in_dirs(&dst, &excluded) {
                        continue;
                    }
                    FsEvent::new_move(src, dst, is_dir)
                }
                (event_type, _) => FsEvent::new(event_type, src, is_dir),
            };

            if self.quiet_paths.take(&event.src)
                || event.dst.as_deref().is_some_and(|d| self.quiet_paths.take(d))
            {
                event.quiet = true;
                event.is_offline = true;
            }

            events.push(event);
        }
        events
    }

    fn enqueue(&self, pending: &mut HashMap<PathBuf, PendingEvent>, event: FsEvent) {
        let key = event.src.clone();
        let deadline = Instant::now() + self.config.debounce;
        let (observed_size, observed_mtime) = self.snapshot(&event);

        match pending.get_mut(&key) {
            Some(existing) => {
                // coalesce: refresh the deadline; keep move/delete shape of the
                // newest event (final type is re-derived by the pipeline)
                existing.event.quiet |= event.quiet;
                existing.event.is_offline |= event.is_offline;
                existing.event.event_type = event.event_type;
                existing.event.dst = event.dst;
                existing.deadline = deadline;
                existing.observed_size = observed_size;
                existing.observed_mtime = observed_mtime;
            }
            None => {
                pending.insert(
                    key,
                    PendingEvent {
                        event,
                        deadline,
                        observed_size,
                        observed_mtime,
                    },
                );
            }
        }
    }

    fn snapshot(&self, event: &FsEvent) -> (Option<u64>, Option<i64>) {
        match std::fs::metadata(self.root.join(event.current_path())) {
            Ok(m) => {
                let mtime = m
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64);
                (Some(m.len()), mtime)
            }
            Err(_) => (None, None),
        }
    }

    fn dispatch_due(
        &self,
        pending: &mut HashMap<PathBuf, PendingEvent>,
        processing: &mut HashSet<PathBuf>,
        in_flight: &mut usize,
        done_tx: &mpsc::UnboundedSender<WorkerDone>,
    ) {
        let limit = self.config.processing_events_limit();
        let now = Instant::now();

        let due: Vec<PathBuf> = pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();

        for key in due {
            if *in_flight >= limit {
                break;
            }
            // one event per path at a time: refuse overlap with anything
            // currently processing
            if processing.iter().any(|p| utils::paths_overlap(p, &key)) {
                continue;
            }

            let Some(mut entry) = pending.remove(&key) else { continue };

            // a file still being written re-delays
            let (size_now, mtime_now) = self.snapshot(&entry.event);
            if size_now != entry.observed_size || mtime_now != entry.observed_mtime {
                entry.observed_size = size_now;
                entry.observed_mtime = mtime_now;
                entry.deadline = now + self.config.debounce;
                pending.insert(key, entry);
                continue;
            }

            processing.insert(key.clone());
            *in_flight += 1;

            let pipeline = Arc::clone(&self.pipeline);
            let done_tx = done_tx.clone();
            tokio::spawn(async move {
                let requeue = match pipeline.process(entry.event).await {
                    Ok(ProcessResult::Done) => Vec::new(),
                    Ok(ProcessResult::Requeue(event)) => vec![event],
                    Ok(ProcessResult::Spawn(events)) => events,
                    Err(e) => {
                        warn!(path = %key.display(), error = %e, "pipeline stage failed");
                        Vec::new()
                    }
                };
                done_tx.send(WorkerDone { path: key, requeue }).ok();
            });
        }
    }
}

fn scan_dir(
    root: &Path,
    dir: &Path,
    excluded: &[PathBuf],
    out: &mut HashMap<PathBuf, bool>,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(rel) = utils::relative_to_root(&path, root) else {
            continue;
        };
        if utils::is_hidden_path(&rel) || utils::is_in_dirs(&rel, excluded) {
            continue;
        }
        let is_dir = entry.file_type()?.is_dir();
        out.insert(rel, is_dir);
        if is_dir {
            scan_dir(root, &path, excluded, out)?;
        }
    }
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn monitor_fixture() -> (TempDir, FilesystemMonitor, mpsc::UnboundedReceiver<LocalEvent>)
    {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        let state = root.join(".pvtbox");

        let db = Arc::new(Database::in_memory().await.unwrap());
        let copies = Arc::new(
            CopiesStore::open(&state.join("copies"), &state.join("signatures"))
                .await
                .unwrap(),
        );
        let (events_tx, _) = broadcast::channel(64);
        let (local_tx, local_rx) = mpsc::unbounded_channel();

        let monitor = FilesystemMonitor::new(
            root,
            MonitorConfig::default(),
            db,
            copies,
            state.join("signatures"),
            QuietPaths::new(),
            events_tx,
            local_tx,
        );
        (dir, monitor, local_rx)
    }

    #[tokio::test]
    async fn offline_scan_detects_unknown_and_missing() {
        let (_dir, monitor, _rx) = monitor_fixture().await;
        std::fs::write(monitor.root.join("present.txt"), b"x").unwrap();
        std::fs::create_dir(monitor.root.join("newdir")).unwrap();

        monitor
            .db
            .insert_file(&crate::db::NewFile {
                relative_path: "gone.txt".to_string(),
                is_folder: false,
                file_hash: Some("h".to_string()),
                mtime: 1,
                size: 1,
                events_file_id: None,
            })
            .await
            .unwrap();

        let events = monitor.offline_scan().await.unwrap();

        let mut by_type: HashMap<FsEventType, Vec<&FsEvent>> = HashMap::new();
        for e in &events {
            by_type.entry(e.event_type).or_default().push(e);
        }
        assert_eq!(by_type[&FsEventType::Create].len(), 2, "file + dir discovered");
        assert_eq!(by_type[&FsEventType::Delete].len(), 1);
        assert_eq!(by_type[&FsEventType::Delete][0].src, PathBuf::from("gone.txt"));
        assert!(events.iter().all(|e| e.is_offline));
    }

    #[tokio::test]
    async fn offline_scan_skips_hidden_and_excluded() {
        let (_dir, monitor, _rx) = monitor_fixture().await;
        std::fs::write(monitor.root.join(".DS_Store"), b"junk").unwrap();
        std::fs::create_dir_all(monitor.root.join("skipme")).unwrap();
        std::fs::write(monitor.root.join("skipme/f.txt"), b"x").unwrap();
        monitor.set_excluded_dirs(vec![PathBuf::from("skipme")]);

        let events = monitor.offline_scan().await.unwrap();
        assert!(events.is_empty(), "hidden and excluded paths are invisible: {events:?}");
    }

    #[tokio::test]
    async fn quiet_markers_cover_children_and_expire() {
        let quiet = QuietPaths::new();
        quiet.mark(Path::new("d"));

        assert!(quiet.take(Path::new("d/inner.txt")), "folder marker covers children");
        assert!(quiet.take(Path::new("d")), "direct marker consumed");
        assert!(!quiet.take(Path::new("other")));
    }

    #[tokio::test]
    async fn watcher_events_flow_to_local_notifications() {
        let (_dir, monitor, mut local_rx) = monitor_fixture().await;
        let handle = monitor.start().unwrap();

        // give the watcher a moment to arm, then create a file
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(monitor.root.join("watched.txt"), b"watched content").unwrap();

        let local = tokio::time::timeout(Duration::from_secs(10), local_rx.recv())
            .await
            .expect("watcher should deliver the create")
            .unwrap();
        assert_eq!(local.path, PathBuf::from("watched.txt"));
        assert_eq!(local.event_type, FsEventType::Create);

        monitor.stop();
        handle.await.unwrap();
    }
}

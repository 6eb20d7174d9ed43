//! Chunked swarm download manager
//!
//! The manager keeps every known [`task::DownloadTask`] plus a ready heap of
//! tasks with at least one peer offering a wanted range. At most one task is
//! *current* (issuing chunk writes into its file) so disk bandwidth is not
//! fragmented; the rest of the ready set waits. A newly-ready task preempts
//! the current one only when its priority is higher.
//!
//! The manager runs as a single tokio task; everything reaches it through a
//! command channel, and it reaches the world through peer commands (to the
//! connectivity layer) and download events (to the orchestrator).

use std::collections::{BinaryHeap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::TransferConfig;
use crate::error::ProtocolError;
use crate::speed_limiter::SpeedLimiter;
use crate::types::{ObjectType, download_priority};

pub mod ranges;
pub(crate) mod task;

pub use ranges::RangeMap;
pub use task::PeerCommand;

use task::{DownloadTask, Lifecycle, TaskTuning};

/// Events the manager publishes toward the orchestrator
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    /// An object finished and was renamed into its final path
    Completed {
        /// Object class
        obj_type: ObjectType,
        /// Object id
        obj_id: String,
        /// Final path of the object
        file_path: PathBuf,
        /// Hash the object was verified against, when one was set
        file_hash: Option<String>,
    },
    /// A task failed terminally
    Failed {
        /// Object class
        obj_type: ObjectType,
        /// Object id
        obj_id: String,
    },
    /// Hash verification failed after all retries; the caller re-enqueues
    WrongHash {
        /// Object class
        obj_type: ObjectType,
        /// Object id
        obj_id: String,
    },
    /// Disk too full to stage a download
    NoDiskSpace {
        /// Object id
        obj_id: String,
        /// Display name for the UI
        display_name: String,
        /// True when an in-flight write hit the condition
        is_error: bool,
    },
    /// Progress of the current user-visible transfer
    Progress {
        /// Display name
        name: String,
        /// Bytes received
        received: u64,
        /// Object size
        size: u64,
    },
    /// A full part landed; suppliers may announce it
    PartDownloaded {
        /// Object class
        obj_type: ObjectType,
        /// Object id
        obj_id: String,
        /// Part offset
        offset: u64,
        /// Part length
        length: u64,
    },
    /// All user-visible transfers drained
    Idle,
    /// A user-visible transfer started
    Working,
    /// Request issuance parked on the rate limiter
    NetworkLimited,
    /// The limiter condition cleared
    NetworkOk,
    /// Received-byte attribution for traffic accounting
    TrafficRx {
        /// Bytes received peer-to-peer
        p2p: u64,
        /// Bytes received via relay
        relay: u64,
    },
}

/// Commands accepted by the manager
#[derive(Debug)]
pub enum DownloadCommand {
    /// Schedule a full-file download
    AddFile {
        /// Event uuid addressing the object
        obj_id: String,
        /// Scheduling priority
        priority: u32,
        /// Object size
        size: u64,
        /// Final path for the object
        file_path: PathBuf,
        /// Display name for the UI
        display_name: String,
        /// Expected content hash
        file_hash: Option<String>,
    },
    /// Schedule a patch download
    AddPatch {
        /// Patch uuid addressing the object
        obj_id: String,
        /// Scheduling priority
        priority: u32,
        /// Archive size
        size: u64,
        /// Final path for the archive
        file_path: PathBuf,
        /// Display name for the UI
        display_name: String,
    },
    /// Cancel one task
    Cancel {
        /// Object id
        obj_id: String,
    },
    /// Cancel everything
    CancelAll,
    /// Pause everything
    PauseAll,
    /// Resume everything
    ResumeAll,
    /// Change a task's priority
    SetPriority {
        /// Object id
        obj_id: String,
        /// New priority
        priority: u32,
    },
    /// Availability info arrived from a peer
    AvailabilityInfo {
        /// Reporting peer
        node_id: String,
        /// Object id
        obj_id: String,
        /// Advertised ranges
        ranges: Vec<(u64, u64)>,
    },
    /// Availability failure arrived from a peer
    AvailabilityFailure {
        /// Reporting peer
        node_id: String,
        /// Object id
        obj_id: String,
        /// Failure code
        error: ProtocolError,
    },
    /// A data chunk arrived
    DataReceived {
        /// Sending peer
        node_id: String,
        /// Object id
        obj_id: String,
        /// Chunk offset
        offset: u64,
        /// Chunk payload
        data: Vec<u8>,
        /// True when the peer connection is relayed
        relayed: bool,
    },
    /// A data request failed at a peer
    DataFailed {
        /// Reporting peer
        node_id: String,
        /// Object id
        obj_id: String,
    },
    /// A peer disconnected entirely
    NodeDisconnected {
        /// The peer
        node_id: String,
    },
    /// Change the download rate limit
    SetLimit {
        /// New limit (None = unlimited)
        bps: Option<u64>,
    },
    /// Report the downloaded ranges and staging path of an in-progress object
    GetDownloadedRanges {
        /// Object id
        obj_id: String,
        /// Reply channel: the held ranges plus the staging file they live in
        reply: oneshot::Sender<Option<(RangeMap, PathBuf)>>,
    },
    /// Stop the manager
    Shutdown,
}

/// Handle to the download manager loop
#[derive(Clone)]
pub struct DownloadManager {
    cmd_tx: mpsc::UnboundedSender<DownloadCommand>,
    downloads_count: Arc<AtomicUsize>,
}

impl DownloadManager {
    /// Spawn the manager loop
    pub fn spawn(
        config: &TransferConfig,
        peer_tx: mpsc::UnboundedSender<PeerCommand>,
        events_tx: mpsc::UnboundedSender<DownloadEvent>,
    ) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let downloads_count = Arc::new(AtomicUsize::new(0));

        let state = ManagerState {
            tasks: HashMap::new(),
            ready: BinaryHeap::new(),
            current: None,
            limiter: SpeedLimiter::new(config.download_limit_bps),
            tuning: TaskTuning {
                receive_timeout: config.receive_timeout,
                retry_limit: config.retry_limit,
                timeouts_limit: config.timeouts_limit,
                max_node_chunk_requests: config.max_node_chunk_requests,
                end_race_timeout: config.end_race_timeout,
                leaky_park: Duration::from_secs(1),
            },
            peer_tx,
            events_tx,
            downloads_count: Arc::clone(&downloads_count),
            working: false,
            last_timeout_sweep: Instant::now(),
        };

        let handle = tokio::spawn(state.run(cmd_rx));
        (
            Self {
                cmd_tx,
                downloads_count,
            },
            handle,
        )
    }

    /// Number of tasks currently known to the scheduler
    pub fn downloads_count(&self) -> usize {
        self.downloads_count.load(Ordering::Relaxed)
    }

    /// Send a command to the manager loop
    pub fn send(&self, command: DownloadCommand) {
        self.cmd_tx.send(command).ok();
    }

    /// Schedule a full-file download
    pub fn add_file_download(
        &self,
        obj_id: &str,
        priority: u32,
        size: u64,
        file_path: PathBuf,
        display_name: &str,
        file_hash: Option<String>,
    ) {
        self.send(DownloadCommand::AddFile {
            obj_id: obj_id.to_string(),
            priority,
            size,
            file_path,
            display_name: display_name.to_string(),
            file_hash,
        });
    }

    /// Schedule a patch download
    pub fn add_patch_download(
        &self,
        obj_id: &str,
        priority: u32,
        size: u64,
        file_path: PathBuf,
        display_name: &str,
    ) {
        self.send(DownloadCommand::AddPatch {
            obj_id: obj_id.to_string(),
            priority,
            size,
            file_path,
            display_name: display_name.to_string(),
        });
    }

    /// Cancel one task
    pub fn cancel_download(&self, obj_id: &str) {
        self.send(DownloadCommand::Cancel {
            obj_id: obj_id.to_string(),
        });
    }

    /// Downloaded ranges and staging path of an in-progress object, for the
    /// supplier side
    pub async fn downloaded_ranges(&self, obj_id: &str) -> Option<(RangeMap, PathBuf)> {
        let (reply, rx) = oneshot::channel();
        self.send(DownloadCommand::GetDownloadedRanges {
            obj_id: obj_id.to_string(),
            reply,
        });
        rx.await.ok().flatten()
    }

    /// Stop the manager loop
    pub fn shutdown(&self) {
        self.send(DownloadCommand::Shutdown);
    }
}

// Ready-heap key: highest priority first, then fewest remaining bytes, then
// lowest object id. Entries go stale when tasks progress; they are validated
// against the task map on pop.
#[derive(Debug, PartialEq, Eq)]
struct ReadyKey {
    priority: u32,
    remaining: u64,
    obj_id: String,
}

impl Ord for ReadyKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.remaining.cmp(&self.remaining))
            .then_with(|| other.obj_id.cmp(&self.obj_id))
    }
}

impl PartialOrd for ReadyKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct ManagerState {
    tasks: HashMap<String, DownloadTask>,
    ready: BinaryHeap<ReadyKey>,
    current: Option<String>,
    limiter: SpeedLimiter,
    tuning: TaskTuning,
    peer_tx: mpsc::UnboundedSender<PeerCommand>,
    events_tx: mpsc::UnboundedSender<DownloadEvent>,
    downloads_count: Arc<AtomicUsize>,
    working: bool,
    last_timeout_sweep: Instant,
}

impl ManagerState {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<DownloadCommand>) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        info!("download manager started");

        loop {
            tokio::select! {
                Some(command) = cmd_rx.recv() => {
                    if matches!(command, DownloadCommand::Shutdown) {
                        break;
                    }
                    self.handle_command(command);
                }
                _ = tick.tick() => self.on_tick(),
                else => break,
            }
            self.downloads_count
                .store(self.tasks.len(), Ordering::Relaxed);
            self.update_working_state();
        }

        for (_, task) in self.tasks.iter_mut() {
            task.cancel();
        }
        info!("download manager stopped");
    }

    fn handle_command(&mut self, command: DownloadCommand) {
        match command {
            DownloadCommand::AddFile {
                obj_id,
                priority,
                size,
                file_path,
                display_name,
                file_hash,
            } => self.add_task(
                ObjectType::File,
                obj_id,
                priority,
                size,
                file_path,
                display_name,
                file_hash,
            ),
            DownloadCommand::AddPatch {
                obj_id,
                priority,
                size,
                file_path,
                display_name,
            } => self.add_task(
                ObjectType::Patch,
                obj_id,
                priority,
                size,
                file_path,
                display_name,
                None,
            ),
            DownloadCommand::Cancel { obj_id } => self.cancel_task(&obj_id),
            DownloadCommand::CancelAll => {
                let ids: Vec<String> = self.tasks.keys().cloned().collect();
                for obj_id in ids {
                    self.cancel_task(&obj_id);
                }
            }
            DownloadCommand::PauseAll => {
                for task in self.tasks.values_mut() {
                    task.pause();
                }
                self.drain_all_effects();
                self.current = None;
            }
            DownloadCommand::ResumeAll => {
                self.ready.clear();
                let ready_ids: Vec<(String, u32, u64)> = self
                    .tasks
                    .values()
                    .filter(|t| t.is_ready() && !t.is_finished())
                    .map(|t| (t.id.clone(), t.priority, t.remaining()))
                    .collect();
                for (obj_id, priority, remaining) in ready_ids {
                    self.ready.push(ReadyKey {
                        priority,
                        remaining,
                        obj_id,
                    });
                }
                self.start_next();
            }
            DownloadCommand::SetPriority { obj_id, priority } => {
                let mut became_preemptor = false;
                if let Some(task) = self.tasks.get_mut(&obj_id) {
                    task.priority = priority;
                    if task.is_ready() && !task.is_finished() {
                        self.ready.push(ReadyKey {
                            priority,
                            remaining: task.remaining(),
                            obj_id: obj_id.clone(),
                        });
                        became_preemptor = true;
                    }
                }
                if became_preemptor {
                    self.maybe_preempt();
                }
            }
            DownloadCommand::AvailabilityInfo {
                node_id,
                obj_id,
                ranges,
            } => {
                let map: RangeMap = ranges.into_iter().collect();
                if let Some(task) = self.tasks.get_mut(&obj_id) {
                    task.on_availability_info(&self.limiter, &node_id, &map);
                    self.drain_effects(&obj_id);
                }
            }
            DownloadCommand::AvailabilityFailure {
                node_id,
                obj_id,
                error,
            } => {
                debug!(node_id, obj_id, ?error, "availability failure");
                if let Some(task) = self.tasks.get_mut(&obj_id) {
                    task.on_availability_failure(error);
                    self.drain_effects(&obj_id);
                }
            }
            DownloadCommand::DataReceived {
                node_id,
                obj_id,
                offset,
                data,
                relayed,
            } => {
                if let Some(task) = self.tasks.get_mut(&obj_id) {
                    let length = data.len() as u64;
                    task.on_data_received(&self.limiter, &node_id, offset, length, &data, relayed);
                    self.drain_effects(&obj_id);
                }
            }
            DownloadCommand::DataFailed { node_id, obj_id } => {
                if let Some(task) = self.tasks.get_mut(&obj_id) {
                    task.on_data_failed(&self.limiter, &node_id);
                    self.drain_effects(&obj_id);
                }
            }
            DownloadCommand::NodeDisconnected { node_id } => {
                let ids: Vec<String> = self.tasks.keys().cloned().collect();
                for obj_id in ids {
                    if let Some(task) = self.tasks.get_mut(&obj_id) {
                        task.on_node_disconnected(&self.limiter, &node_id, false, true);
                        self.drain_effects(&obj_id);
                    }
                }
            }
            DownloadCommand::SetLimit { bps } => self.limiter.set_limit(bps),
            DownloadCommand::GetDownloadedRanges { obj_id, reply } => {
                let ranges = self
                    .tasks
                    .get(&obj_id)
                    .map(|t| (t.downloaded_ranges().clone(), t.download_path.clone()));
                reply.send(ranges).ok();
            }
            DownloadCommand::Shutdown => {}
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn add_task(
        &mut self,
        obj_type: ObjectType,
        obj_id: String,
        priority: u32,
        size: u64,
        file_path: PathBuf,
        display_name: String,
        file_hash: Option<String>,
    ) {
        if file_path.exists() {
            debug!(obj_id, "object already present, completing immediately");
            self.events_tx
                .send(DownloadEvent::Completed {
                    obj_type,
                    obj_id,
                    file_path,
                    file_hash,
                })
                .ok();
            return;
        }

        if let Some(existing) = self.tasks.get_mut(&obj_id) {
            if existing.priority != priority {
                existing.priority = priority;
                if existing.is_ready() {
                    self.ready.push(ReadyKey {
                        priority,
                        remaining: existing.remaining(),
                        obj_id: obj_id.clone(),
                    });
                    self.maybe_preempt();
                }
            }
            return;
        }

        debug!(obj_id, priority, size, "download task added");
        let task = DownloadTask::new(
            obj_type,
            obj_id.clone(),
            priority,
            size,
            file_path,
            display_name,
            file_hash,
            self.tuning.clone(),
        );
        self.tasks.insert(obj_id.clone(), task);
        self.peer_tx
            .send(PeerCommand::Subscribe { obj_type, obj_id })
            .ok();
    }

    fn cancel_task(&mut self, obj_id: &str) {
        if let Some(mut task) = self.tasks.remove(obj_id) {
            debug!(obj_id, "download task cancelled");
            task.cancel();
            for command in task.take_commands() {
                self.peer_tx.send(command).ok();
            }
            self.peer_tx
                .send(PeerCommand::Unsubscribe {
                    obj_type: task.obj_type,
                    obj_id: obj_id.to_string(),
                })
                .ok();
            if self.current.as_deref() == Some(obj_id) {
                self.current = None;
                self.start_next();
            }
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();

        // unpark rate-limited tasks whose delay elapsed
        let parked: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.should_unpark(now))
            .map(|t| t.id.clone())
            .collect();
        for obj_id in parked {
            if let Some(task) = self.tasks.get_mut(&obj_id) {
                task.unpark(&self.limiter);
                self.drain_effects(&obj_id);
            }
        }

        // 15-second timeout sweep over started tasks
        if now.duration_since(self.last_timeout_sweep) >= Duration::from_secs(15) {
            self.last_timeout_sweep = now;
            let started: Vec<String> = self
                .tasks
                .values()
                .filter(|t| t.is_started() && !t.is_paused())
                .map(|t| t.id.clone())
                .collect();
            for obj_id in started {
                if let Some(task) = self.tasks.get_mut(&obj_id) {
                    task.check_timeouts(&self.limiter);
                    self.drain_effects(&obj_id);
                }
            }
        }

        // progress of the current user-visible transfer
        if let Some(current) = self.current.clone()
            && let Some(task) = self.tasks.get(&current)
            && task.priority > download_priority::IMPORTANT
        {
            self.events_tx
                .send(DownloadEvent::Progress {
                    name: task.display_name.clone(),
                    received: task.received,
                    size: task.size,
                })
                .ok();
        }

        if self.current.is_none() {
            self.start_next();
        }
    }

    fn drain_all_effects(&mut self) {
        let ids: Vec<String> = self.tasks.keys().cloned().collect();
        for obj_id in ids {
            self.drain_effects(&obj_id);
        }
    }

    // Forward a task's accumulated peer commands and apply its lifecycle
    // transitions to the scheduler state.
    fn drain_effects(&mut self, obj_id: &str) {
        let Some(task) = self.tasks.get_mut(obj_id) else {
            return;
        };
        let obj_type = task.obj_type;
        let file_path = task.file_path.clone();
        let file_hash = task.file_hash.clone();
        let display_name = task.display_name.clone();
        let priority = task.priority;
        let remaining = task.remaining();
        let commands = task.take_commands();
        let lifecycle = task.take_lifecycle();

        for command in commands {
            self.peer_tx.send(command).ok();
        }

        for transition in lifecycle {
            match transition {
                Lifecycle::BecameReady => {
                    self.ready.push(ReadyKey {
                        priority,
                        remaining,
                        obj_id: obj_id.to_string(),
                    });
                    self.maybe_preempt();
                    if self.current.is_none() {
                        self.start_next();
                    }
                }
                Lifecycle::NotReady => {
                    if self.current.as_deref() == Some(obj_id) {
                        self.current = None;
                        self.start_next();
                    }
                }
                Lifecycle::Completed => {
                    self.events_tx
                        .send(DownloadEvent::Completed {
                            obj_type,
                            obj_id: obj_id.to_string(),
                            file_path: file_path.clone(),
                            file_hash: file_hash.clone(),
                        })
                        .ok();
                    self.remove_finished(obj_id, obj_type);
                }
                Lifecycle::Failed => {
                    self.events_tx
                        .send(DownloadEvent::Failed {
                            obj_type,
                            obj_id: obj_id.to_string(),
                        })
                        .ok();
                    self.remove_finished(obj_id, obj_type);
                }
                Lifecycle::WrongHash => {
                    self.events_tx
                        .send(DownloadEvent::WrongHash {
                            obj_type,
                            obj_id: obj_id.to_string(),
                        })
                        .ok();
                    self.remove_finished(obj_id, obj_type);
                }
                Lifecycle::NoDiskSpace { is_error } => {
                    self.events_tx
                        .send(DownloadEvent::NoDiskSpace {
                            obj_id: obj_id.to_string(),
                            display_name: display_name.clone(),
                            is_error,
                        })
                        .ok();
                    if self.current.as_deref() == Some(obj_id) {
                        self.current = None;
                        self.start_next();
                    }
                }
                Lifecycle::PartDownloaded { offset, length } => {
                    self.events_tx
                        .send(DownloadEvent::PartDownloaded {
                            obj_type,
                            obj_id: obj_id.to_string(),
                            offset,
                            length,
                        })
                        .ok();
                }
                Lifecycle::NetworkLimited => {
                    self.events_tx.send(DownloadEvent::NetworkLimited).ok();
                }
                Lifecycle::NetworkOk => {
                    self.events_tx.send(DownloadEvent::NetworkOk).ok();
                }
                Lifecycle::TrafficRx { p2p, relay } => {
                    self.events_tx
                        .send(DownloadEvent::TrafficRx { p2p, relay })
                        .ok();
                }
            }
        }
    }

    fn remove_finished(&mut self, obj_id: &str, obj_type: ObjectType) {
        self.tasks.remove(obj_id);
        self.peer_tx
            .send(PeerCommand::Unsubscribe {
                obj_type,
                obj_id: obj_id.to_string(),
            })
            .ok();
        if self.current.as_deref() == Some(obj_id) {
            self.current = None;
        }
        self.start_next();
    }

    // A ready task with strictly higher priority preempts the current one.
    fn maybe_preempt(&mut self) {
        let Some(current_id) = self.current.clone() else {
            return;
        };
        let current_priority = match self.tasks.get(&current_id) {
            Some(task) => task.priority,
            None => {
                self.current = None;
                self.start_next();
                return;
            }
        };
        let top_beats_current = self
            .ready
            .peek()
            .is_some_and(|key| key.priority > current_priority && key.obj_id != current_id);
        if !top_beats_current {
            return;
        }

        debug!(current = %current_id, "preempting current download");
        if let Some(task) = self.tasks.get_mut(&current_id) {
            task.pause();
            let remaining = task.remaining();
            let priority = task.priority;
            self.ready.push(ReadyKey {
                priority,
                remaining,
                obj_id: current_id.clone(),
            });
        }
        self.drain_effects(&current_id);
        self.current = None;
        self.start_next();
    }

    fn start_next(&mut self) {
        if self.current.is_some() {
            return;
        }
        while let Some(key) = self.ready.pop() {
            let Some(task) = self.tasks.get_mut(&key.obj_id) else {
                continue;
            };
            // stale heap entries: validate against live task state
            if !task.is_ready() || task.is_finished() || task.priority != key.priority {
                continue;
            }

            debug!(obj_id = %key.obj_id, priority = key.priority, "starting download task");
            self.current = Some(key.obj_id.clone());
            task.start(&self.limiter);
            self.drain_effects(&key.obj_id);

            match &self.current {
                Some(id) if id == &key.obj_id => {
                    // still current: confirm the task actually runs
                    if self.tasks.get(id).is_some_and(|t| t.is_started()) {
                        return;
                    }
                    self.current = None;
                }
                Some(_) => return,
                None => {}
            }
        }
    }

    fn update_working_state(&mut self) {
        let visible = self
            .tasks
            .values()
            .any(|t| t.priority > download_priority::IMPORTANT && !t.is_finished());
        if visible && !self.working {
            self.working = true;
            self.events_tx.send(DownloadEvent::Working).ok();
        } else if !visible && self.working {
            self.working = false;
            self.events_tx.send(DownloadEvent::Idle).ok();
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        manager: DownloadManager,
        handle: JoinHandle<()>,
        peer_rx: mpsc::UnboundedReceiver<PeerCommand>,
        events_rx: mpsc::UnboundedReceiver<DownloadEvent>,
        target_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let target_dir = dir.path().to_path_buf();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (manager, handle) =
            DownloadManager::spawn(&TransferConfig::default(), peer_tx, events_tx);
        Fixture {
            _dir: dir,
            manager,
            handle,
            peer_rx,
            events_rx,
            target_dir,
        }
    }

    async fn expect_peer<F: Fn(&PeerCommand) -> bool>(
        rx: &mut mpsc::UnboundedReceiver<PeerCommand>,
        pred: F,
        what: &str,
    ) -> PeerCommand {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let cmd = rx.recv().await.expect("peer channel open");
                if pred(&cmd) {
                    return cmd;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
    }

    #[tokio::test]
    async fn add_subscribes_and_ready_task_starts() {
        let mut f = fixture();
        f.manager.add_file_download(
            "ev-1",
            download_priority::FILE,
            1000,
            f.target_dir.join("a.bin"),
            "a.bin",
            None,
        );

        let sub = expect_peer(
            &mut f.peer_rx,
            |c| matches!(c, PeerCommand::Subscribe { .. }),
            "subscribe",
        )
        .await;
        assert_eq!(
            sub,
            PeerCommand::Subscribe {
                obj_type: ObjectType::File,
                obj_id: "ev-1".to_string()
            }
        );

        f.manager.send(DownloadCommand::AvailabilityInfo {
            node_id: "peer-a".to_string(),
            obj_id: "ev-1".to_string(),
            ranges: vec![(0, 1000)],
        });

        let req = expect_peer(
            &mut f.peer_rx,
            |c| matches!(c, PeerCommand::RequestData { .. }),
            "data request",
        )
        .await;
        let PeerCommand::RequestData {
            node_id,
            offset,
            length,
            ..
        } = req
        else {
            unreachable!()
        };
        assert_eq!(node_id, "peer-a");
        assert_eq!((offset, length), (0, 1000));

        f.manager.shutdown();
        f.handle.await.unwrap();
    }

    #[tokio::test]
    async fn completed_download_emits_event_and_file() {
        let mut f = fixture();
        let content = vec![5u8; 800];
        f.manager.add_file_download(
            "ev-2",
            download_priority::FILE,
            800,
            f.target_dir.join("b.bin"),
            "b.bin",
            None,
        );
        f.manager.send(DownloadCommand::AvailabilityInfo {
            node_id: "peer-a".to_string(),
            obj_id: "ev-2".to_string(),
            ranges: vec![(0, 800)],
        });
        expect_peer(
            &mut f.peer_rx,
            |c| matches!(c, PeerCommand::RequestData { .. }),
            "data request",
        )
        .await;

        f.manager.send(DownloadCommand::DataReceived {
            node_id: "peer-a".to_string(),
            obj_id: "ev-2".to_string(),
            offset: 0,
            data: content.clone(),
            relayed: false,
        });

        let completed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match f.events_rx.recv().await.unwrap() {
                    DownloadEvent::Completed {
                        obj_id, file_path, ..
                    } => {
                        return (obj_id, file_path);
                    }
                    _ => continue,
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(completed.0, "ev-2");
        assert_eq!(std::fs::read(&completed.1).unwrap(), content);

        f.manager.shutdown();
        f.handle.await.unwrap();
    }

    #[tokio::test]
    async fn existing_file_completes_without_task() {
        let mut f = fixture();
        std::fs::write(f.target_dir.join("have.bin"), b"present").unwrap();

        f.manager.add_file_download(
            "ev-3",
            download_priority::FILE,
            7,
            f.target_dir.join("have.bin"),
            "have.bin",
            None,
        );

        let event = tokio::time::timeout(Duration::from_secs(5), f.events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, DownloadEvent::Completed { obj_id, .. } if obj_id == "ev-3"));

        f.manager.shutdown();
        f.handle.await.unwrap();
    }

    #[tokio::test]
    async fn higher_priority_task_preempts_current() {
        let mut f = fixture();

        f.manager.add_patch_download(
            "patch-low",
            download_priority::DIRECT_PATCH,
            1_000_000,
            f.target_dir.join("low.patch"),
            "low.patch",
        );
        f.manager.send(DownloadCommand::AvailabilityInfo {
            node_id: "peer-a".to_string(),
            obj_id: "patch-low".to_string(),
            ranges: vec![(0, 1_000_000)],
        });
        expect_peer(
            &mut f.peer_rx,
            |c| matches!(c, PeerCommand::RequestData { obj_id, .. } if obj_id == "patch-low"),
            "low-priority request",
        )
        .await;

        // a file download arrives and preempts
        f.manager.add_file_download(
            "ev-high",
            download_priority::FILE,
            500,
            f.target_dir.join("high.bin"),
            "high.bin",
            None,
        );
        f.manager.send(DownloadCommand::AvailabilityInfo {
            node_id: "peer-a".to_string(),
            obj_id: "ev-high".to_string(),
            ranges: vec![(0, 500)],
        });

        expect_peer(
            &mut f.peer_rx,
            |c| matches!(c, PeerCommand::RequestData { obj_id, .. } if obj_id == "ev-high"),
            "preempting request",
        )
        .await;

        f.manager.shutdown();
        f.handle.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_unsubscribes() {
        let mut f = fixture();
        f.manager.add_file_download(
            "ev-c",
            download_priority::FILE,
            100,
            f.target_dir.join("c.bin"),
            "c.bin",
            None,
        );
        expect_peer(
            &mut f.peer_rx,
            |c| matches!(c, PeerCommand::Subscribe { .. }),
            "subscribe",
        )
        .await;

        f.manager.cancel_download("ev-c");
        let unsub = expect_peer(
            &mut f.peer_rx,
            |c| matches!(c, PeerCommand::Unsubscribe { .. }),
            "unsubscribe",
        )
        .await;
        assert_eq!(
            unsub,
            PeerCommand::Unsubscribe {
                obj_type: ObjectType::File,
                obj_id: "ev-c".to_string()
            }
        );

        f.manager.shutdown();
        f.handle.await.unwrap();
    }

    #[tokio::test]
    async fn downloaded_ranges_visible_to_suppliers() {
        let mut f = fixture();
        f.manager.add_file_download(
            "ev-r",
            download_priority::FILE,
            10_000,
            f.target_dir.join("r.bin"),
            "r.bin",
            None,
        );
        f.manager.send(DownloadCommand::AvailabilityInfo {
            node_id: "peer-a".to_string(),
            obj_id: "ev-r".to_string(),
            ranges: vec![(0, 10_000)],
        });
        expect_peer(
            &mut f.peer_rx,
            |c| matches!(c, PeerCommand::RequestData { .. }),
            "request",
        )
        .await;

        f.manager.send(DownloadCommand::DataReceived {
            node_id: "peer-a".to_string(),
            obj_id: "ev-r".to_string(),
            offset: 0,
            data: vec![1u8; 4_000],
            relayed: false,
        });

        // poll until the write is visible
        let (ranges, staging) = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some((r, path)) = f.manager.downloaded_ranges("ev-r").await
                    && !r.is_empty()
                {
                    return (r, path);
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(ranges.iter().collect::<Vec<_>>(), vec![(0, 4_000)]);
        assert!(staging.to_string_lossy().ends_with(".download"));

        f.manager.shutdown();
        f.handle.await.unwrap();
    }
}

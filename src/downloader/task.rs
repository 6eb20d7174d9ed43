//! One chunked swarm download
//!
//! A task tracks wanted and downloaded byte ranges plus per-peer advertised
//! and in-flight ranges. Chunks are requested in parts of
//! [`DOWNLOAD_PART_SIZE`] at random offsets within peer-advertised ranges;
//! when everything outstanding has been requested the task enters *end-race*
//! mode and lets an idle peer duplicate ranges requested from slower peers.
//! Progress is checkpointed to a `.info` sidecar at part boundaries so a
//! crashed download resumes at the last committed boundary.

use rand::Rng;
use rand::seq::SliceRandom;
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::speed_limiter::SpeedLimiter;
use crate::types::{DOWNLOAD_CHUNK_SIZE, DOWNLOAD_PART_SIZE, ObjectType};
use crate::utils;

use super::ranges::RangeMap;

/// Peer-facing side effects a task asks the connectivity layer to perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    /// Subscribe to availability info for an object on all peers
    Subscribe {
        /// Object class
        obj_type: ObjectType,
        /// Object id
        obj_id: String,
    },
    /// Cancel an availability subscription
    Unsubscribe {
        /// Object class
        obj_type: ObjectType,
        /// Object id
        obj_id: String,
    },
    /// Request a byte range from one peer
    RequestData {
        /// Target peer
        node_id: String,
        /// Object class
        obj_type: ObjectType,
        /// Object id
        obj_id: String,
        /// Range start
        offset: u64,
        /// Range length
        length: u64,
    },
    /// Abort all in-flight requests to one peer for an object
    AbortData {
        /// Target peer
        node_id: String,
        /// Object class
        obj_type: ObjectType,
        /// Object id
        obj_id: String,
    },
}

/// Lifecycle transitions surfaced to the download manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    /// A first usable range appeared; the task can be scheduled
    BecameReady,
    /// No peer offers anything usable anymore
    NotReady,
    /// The object finished and was renamed into place
    Completed,
    /// The task failed terminally (I/O or protocol)
    Failed,
    /// Hash verification failed after all retries
    WrongHash,
    /// Disk is too full to stage the download
    NoDiskSpace {
        /// True when an in-flight write hit the condition
        is_error: bool,
    },
    /// A full part landed; suppliers may announce it
    PartDownloaded {
        /// Part start offset
        offset: u64,
        /// Part length
        length: u64,
    },
    /// Request issuance parked on the rate limiter
    NetworkLimited,
    /// The limiter condition cleared
    NetworkOk,
    /// Received bytes attribution for traffic accounting
    TrafficRx {
        /// Bytes received peer-to-peer
        p2p: u64,
        /// Bytes received via relay
        relay: u64,
    },
}

/// Tuning knobs shared by all tasks
#[derive(Clone, Debug)]
pub(crate) struct TaskTuning {
    pub receive_timeout: Duration,
    pub retry_limit: u32,
    pub timeouts_limit: u32,
    pub max_node_chunk_requests: usize,
    pub end_race_timeout: Duration,
    pub leaky_park: Duration,
}

impl Default for TaskTuning {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(20),
            retry_limit: 2,
            timeouts_limit: 2,
            max_node_chunk_requests: 128,
            end_race_timeout: Duration::from_secs(5),
            leaky_park: Duration::from_secs(1),
        }
    }
}

/// One chunked download
pub(crate) struct DownloadTask {
    pub obj_type: ObjectType,
    pub id: String,
    pub priority: u32,
    pub size: u64,
    pub file_path: PathBuf,
    pub download_path: PathBuf,
    pub info_path: PathBuf,
    pub display_name: String,
    pub file_hash: Option<String>,
    pub received: u64,

    wanted: RangeMap,
    downloaded: RangeMap,
    peer_available: HashMap<String, RangeMap>,
    peer_requested: HashMap<String, RangeMap>,
    peer_last_receive: HashMap<String, Instant>,
    peer_downloaded_count: HashMap<String, u64>,
    peer_timeouts: HashMap<String, u32>,

    ready: bool,
    started: bool,
    paused: bool,
    finished: bool,
    pub hash_is_wrong: bool,
    retry: u32,
    parked_until: Option<Instant>,
    network_limited_reported: bool,

    file: Option<std::fs::File>,
    received_p2p: u64,
    received_relay: u64,

    tuning: TaskTuning,
    commands: VecDeque<PeerCommand>,
    lifecycle: VecDeque<Lifecycle>,
}

impl DownloadTask {
    pub(crate) fn new(
        obj_type: ObjectType,
        obj_id: String,
        priority: u32,
        size: u64,
        file_path: PathBuf,
        display_name: String,
        file_hash: Option<String>,
        tuning: TaskTuning,
    ) -> Self {
        let download_path = sidecar(&file_path, "download");
        let info_path = sidecar(&file_path, "info");
        Self {
            obj_type,
            id: obj_id,
            priority,
            size,
            file_path,
            download_path,
            info_path,
            display_name,
            file_hash,
            received: 0,
            wanted: RangeMap::with_range(0, size),
            downloaded: RangeMap::new(),
            peer_available: HashMap::new(),
            peer_requested: HashMap::new(),
            peer_last_receive: HashMap::new(),
            peer_downloaded_count: HashMap::new(),
            peer_timeouts: HashMap::new(),
            ready: false,
            started: false,
            paused: false,
            finished: false,
            hash_is_wrong: false,
            retry: 0,
            parked_until: None,
            network_limited_reported: false,
            file: None,
            received_p2p: 0,
            received_relay: 0,
            tuning,
            commands: VecDeque::new(),
            lifecycle: VecDeque::new(),
        }
    }

    /// Drain peer-facing side effects accumulated by the last calls
    pub(crate) fn take_commands(&mut self) -> Vec<PeerCommand> {
        self.commands.drain(..).collect()
    }

    /// Drain lifecycle transitions accumulated by the last calls
    pub(crate) fn take_lifecycle(&mut self) -> Vec<Lifecycle> {
        self.lifecycle.drain(..).collect()
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn remaining(&self) -> u64 {
        self.size.saturating_sub(self.received)
    }

    /// Ranges held so far, for supplier announcements and crash resume tests
    pub(crate) fn downloaded_ranges(&self) -> &RangeMap {
        &self.downloaded
    }

    /// Whether the park deadline passed and requests should resume
    pub(crate) fn should_unpark(&self, now: Instant) -> bool {
        self.parked_until.is_some_and(|t| t <= now)
    }

    /// Begin (or resume) transferring
    pub(crate) fn start(&mut self, limiter: &SpeedLimiter) {
        if self.file_path.exists() {
            info!(obj_id = %self.id, "object already downloaded");
            self.received = self.size;
            self.finished = true;
            self.clean_sidecars();
            self.lifecycle.push_back(Lifecycle::Completed);
            return;
        }

        if self.started {
            self.resume(limiter);
            return;
        }

        if !self.check_disk_space() {
            return;
        }

        debug!(obj_id = %self.id, size = self.size, "starting download task");
        self.started = true;
        self.paused = false;
        self.hash_is_wrong = false;

        if !self.open_file(false) {
            return;
        }
        self.read_info_file();
        self.wanted = RangeMap::with_range(0, self.size);
        self.wanted.subtract(&self.downloaded);
        self.received = self.downloaded.total();

        if self.complete_if_done(limiter) {
            return;
        }
        self.download_chunks(limiter, false);
    }

    pub(crate) fn pause(&mut self) {
        self.paused = true;
        self.stop_requests();
    }

    pub(crate) fn resume(&mut self, limiter: &SpeedLimiter) {
        self.paused = false;
        self.hash_is_wrong = false;
        self.started = true;
        self.download_chunks(limiter, false);
    }

    /// Cancel and remove staged state
    pub(crate) fn cancel(&mut self) {
        self.close_file();
        self.stop_requests();
        self.finished = true;
        self.clean_sidecars();
    }

    fn check_disk_space(&mut self) -> bool {
        let required = self.size * 2 + utils::signature_file_size(self.size);
        let base = self
            .file_path
            .parent()
            .filter(|p| p.exists())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        match utils::get_available_space(&base) {
            Ok(free) if free < required => {
                warn!(obj_id = %self.id, required, free, "no disk space for download");
                self.lifecycle
                    .push_back(Lifecycle::NoDiskSpace { is_error: false });
                false
            }
            _ => true,
        }
    }

    /// Availability info arrived from a peer
    pub(crate) fn on_availability_info(
        &mut self,
        limiter: &SpeedLimiter,
        node_id: &str,
        ranges: &RangeMap,
    ) {
        if self.finished {
            return;
        }
        debug!(obj_id = %self.id, node_id, ranges = ranges.len(), "availability info received");

        let known = self.peer_available.entry(node_id.to_string()).or_default();
        let grew = known.merge(ranges);

        if !self.ready && grew {
            self.ready = true;
            self.lifecycle.push_back(Lifecycle::BecameReady);
        }

        if self.started
            && !self.paused
            && self
                .peer_requested
                .get(node_id)
                .is_none_or(|r| r.is_empty())
        {
            self.download_next_chunks(limiter, node_id, Duration::ZERO);
            self.clean_last_receive_times();
        }
    }

    /// A peer reported failure for our subscription
    pub(crate) fn on_availability_failure(&mut self, error: crate::error::ProtocolError) {
        if self.finished {
            return;
        }
        if error == crate::error::ProtocolError::FileChanged {
            self.fail();
        }
    }

    /// Data arrived from a peer
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn on_data_received(
        &mut self,
        limiter: &SpeedLimiter,
        node_id: &str,
        offset: u64,
        length: u64,
        data: &[u8],
        relayed: bool,
    ) {
        if self.finished || length == 0 || data.len() as u64 != length {
            return;
        }
        debug!(obj_id = %self.id, node_id, offset, length, "data received");

        let now = Instant::now();
        let last = self
            .peer_last_receive
            .insert(node_id.to_string(), now)
            .unwrap_or(now);
        self.peer_timeouts.remove(node_id);
        let downloaded_count = self
            .peer_downloaded_count
            .entry(node_id.to_string())
            .and_modify(|c| *c += 1)
            .or_insert(1);
        let downloaded_count = *downloaded_count;

        if relayed {
            self.received_relay += length;
            self.lifecycle.push_back(Lifecycle::TrafficRx {
                p2p: 0,
                relay: length,
            });
        } else {
            self.received_p2p += length;
            self.lifecycle.push_back(Lifecycle::TrafficRx {
                p2p: length,
                relay: 0,
            });
        }

        if !self.downloaded.contains(offset) {
            if !self.write_chunk(offset, data) {
                return;
            }
            self.received += length;
            self.downloaded.insert(offset, length);
            self.wanted.remove(offset, length);
            self.checkpoint_part(offset, length);
        } else {
            // end-race duplicate: the bytes are byte-exact by hash contract,
            // nothing to write
            debug!(obj_id = %self.id, offset, "chunk already downloaded");
        }

        if let Some(requested) = self.peer_requested.get_mut(node_id) {
            requested.remove(offset, length);
            if requested.is_empty() {
                self.peer_requested.remove(node_id);
            }
        }

        if self.complete_if_done(limiter) {
            return;
        }

        let requested_count = self
            .peer_requested
            .get(node_id)
            .map(|r| r.total() / DOWNLOAD_CHUNK_SIZE)
            .unwrap_or(0) as usize;
        if downloaded_count as usize * 4 >= requested_count
            && requested_count < self.tuning.max_node_chunk_requests
        {
            self.download_next_chunks(limiter, node_id, now.duration_since(last));
            self.clean_last_receive_times();
        }
    }

    /// A data request failed at the peer
    pub(crate) fn on_data_failed(&mut self, limiter: &SpeedLimiter, node_id: &str) {
        if self.finished {
            return;
        }
        debug!(obj_id = %self.id, node_id, "data request failure");
        self.on_node_disconnected(limiter, node_id, false, true);
    }

    /// Drop a peer from the task
    pub(crate) fn on_node_disconnected(
        &mut self,
        limiter: &SpeedLimiter,
        node_id: &str,
        connection_alive: bool,
        drop_availability: bool,
    ) {
        let dropped = self.peer_requested.remove(node_id);
        debug!(obj_id = %self.id, node_id, requested = ?dropped.as_ref().map(RangeMap::total),
               "peer dropped from task");
        if drop_availability {
            self.peer_available.remove(node_id);
            self.peer_timeouts.remove(node_id);
        }
        self.peer_last_receive.remove(node_id);
        self.peer_downloaded_count.remove(node_id);

        if connection_alive {
            self.commands.push_back(PeerCommand::AbortData {
                node_id: node_id.to_string(),
                obj_type: self.obj_type,
                obj_id: self.id.clone(),
            });
        }

        if !self.peer_available.is_empty() {
            self.download_chunks(limiter, true);
        } else if self.ready && !self.finished {
            self.ready = false;
            self.lifecycle.push_back(Lifecycle::NotReady);
        }
    }

    /// Periodic timeout sweep; peers silent past the limit are dropped
    pub(crate) fn check_timeouts(&mut self, limiter: &SpeedLimiter) {
        if self.paused || !self.started || self.finished || self.parked_until.is_some() {
            return;
        }
        let now = Instant::now();
        let timed_out: Vec<String> = self
            .peer_last_receive
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > self.tuning.receive_timeout)
            .map(|(node, _)| node.clone())
            .collect();

        for node_id in timed_out {
            let count = self.peer_timeouts.remove(&node_id).unwrap_or(0) + 1;
            let drop_peer = count >= self.tuning.timeouts_limit;
            if !drop_peer {
                self.peer_timeouts.insert(node_id.clone(), count);
            }
            debug!(obj_id = %self.id, node_id, count, drop_peer, "peer receive timeout");
            self.on_node_disconnected(limiter, &node_id, true, drop_peer);
        }
    }

    /// Resume requesting after a rate-limiter park
    pub(crate) fn unpark(&mut self, limiter: &SpeedLimiter) {
        self.parked_until = None;
        self.download_chunks(limiter, false);
    }

    fn download_chunks(&mut self, limiter: &SpeedLimiter, check_node_busy: bool) {
        if !self.started || self.paused || self.finished {
            return;
        }
        let mut node_ids: Vec<String> = self.peer_available.keys().cloned().collect();
        node_ids.shuffle(&mut rand::thread_rng());

        for node_id in node_ids {
            let node_free = !check_node_busy
                || self
                    .peer_requested
                    .get(&node_id)
                    .is_none_or(|r| r.is_empty());
            if node_free {
                self.download_next_chunks(limiter, &node_id, Duration::ZERO);
            }
        }
        self.clean_last_receive_times();
    }

    fn download_next_chunks(
        &mut self,
        limiter: &SpeedLimiter,
        node_id: &str,
        time_from_last_receive: Duration,
    ) {
        if self.paused
            || !self.started
            || !self.ready
            || self.finished
            || self.wanted.is_empty()
            || self.parked_until.is_some()
        {
            return;
        }

        let total_requested: u64 = self.peer_requested.values().map(RangeMap::total).sum();

        let available = if total_requested + self.received >= self.size {
            if self
                .peer_requested
                .get(node_id)
                .is_some_and(|r| !r.is_empty())
                && time_from_last_receive <= self.tuning.end_race_timeout
            {
                return;
            }
            self.end_race_chunks(node_id)
        } else {
            self.available_chunks(node_id)
        };

        if available.is_empty() {
            debug!(obj_id = %self.id, node_id, "no chunks available from peer");
            return;
        }

        // random range, then a random part inside it
        let ranges: Vec<(u64, u64)> = available.iter().collect();
        let mut rng = rand::thread_rng();
        let (range_offset, range_length) = ranges[rng.gen_range(0..ranges.len())];

        let parts_count = range_length.div_ceil(DOWNLOAD_PART_SIZE).saturating_sub(1);
        let part = rng.gen_range(0..=parts_count);
        let offset = range_offset + part * DOWNLOAD_PART_SIZE;
        let length = DOWNLOAD_PART_SIZE.min(range_offset + range_length - offset);

        self.request_data(limiter, node_id, offset, length);
    }

    fn end_race_chunks(&self, node_id: &str) -> RangeMap {
        let Some(available) = self.peer_available.get(node_id) else {
            return RangeMap::new();
        };
        let mut available = available.clone();
        available.subtract(&self.downloaded);
        if available.is_empty() {
            return available;
        }

        // duplicate other peers' in-flight ranges, never our own
        let mut from_others = available.clone();
        if let Some(own) = self.peer_requested.get(node_id) {
            from_others.subtract(own);
        }
        if from_others.is_empty() {
            available
        } else {
            from_others
        }
    }

    fn available_chunks(&self, node_id: &str) -> RangeMap {
        let Some(available) = self.peer_available.get(node_id) else {
            return RangeMap::new();
        };
        let mut available = available.clone();
        for requested in self.peer_requested.values() {
            available.subtract(requested);
        }
        available.subtract(&self.downloaded);
        available
    }

    fn request_data(&mut self, limiter: &SpeedLimiter, node_id: &str, offset: u64, length: u64) {
        if !limiter.try_acquire(length) {
            if self
                .peer_requested
                .get(node_id)
                .is_none_or(|r| r.is_empty())
            {
                self.peer_last_receive.remove(node_id);
            }
            if !self.network_limited_reported {
                self.network_limited_reported = true;
                self.lifecycle.push_back(Lifecycle::NetworkLimited);
            }
            if self.parked_until.is_none() {
                self.parked_until = Some(Instant::now() + self.tuning.leaky_park);
            }
            return;
        }
        if self.network_limited_reported {
            self.network_limited_reported = false;
            self.lifecycle.push_back(Lifecycle::NetworkOk);
        }

        debug!(obj_id = %self.id, node_id, offset, length, "requesting chunk");
        self.peer_requested
            .entry(node_id.to_string())
            .or_default()
            .insert(offset, length);
        self.peer_last_receive
            .insert(node_id.to_string(), Instant::now());
        self.commands.push_back(PeerCommand::RequestData {
            node_id: node_id.to_string(),
            obj_type: self.obj_type,
            obj_id: self.id.clone(),
            offset,
            length,
        });
    }

    fn clean_last_receive_times(&mut self) {
        let with_requests: Vec<String> = self.peer_requested.keys().cloned().collect();
        self.peer_last_receive
            .retain(|node, _| with_requests.contains(node));
    }

    fn write_chunk(&mut self, offset: u64, data: &[u8]) -> bool {
        let Some(file) = self.file.as_mut() else {
            return false;
        };
        let result = file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(data));
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(obj_id = %self.id, error = %e, "write to download file failed");
                if e.kind() == std::io::ErrorKind::StorageFull {
                    self.lifecycle
                        .push_back(Lifecycle::NoDiskSpace { is_error: true });
                } else {
                    self.fail();
                }
                false
            }
        }
    }

    // At every completed DOWNLOAD_PART_SIZE boundary flush the file, commit
    // the sidecar, and let suppliers announce the new part.
    fn checkpoint_part(&mut self, offset: u64, _length: u64) {
        let part_offset = (offset / DOWNLOAD_PART_SIZE) * DOWNLOAD_PART_SIZE;
        let part_size = DOWNLOAD_PART_SIZE.min(self.size - part_offset);
        if !self.downloaded.covers(part_offset, part_size) {
            return;
        }
        if let Some(file) = self.file.as_mut() {
            file.flush().ok();
        }
        self.write_info_file();
        self.lifecycle.push_back(Lifecycle::PartDownloaded {
            offset: part_offset,
            length: part_size,
        });
    }

    fn complete_if_done(&mut self, limiter: &SpeedLimiter) -> bool {
        if !self.wanted.is_empty() || self.finished {
            return false;
        }
        debug!(obj_id = %self.id, "download complete, finalizing");

        self.peer_requested.clear();
        let peers: Vec<String> = self.peer_last_receive.keys().cloned().collect();
        for node_id in peers {
            self.commands.push_back(PeerCommand::AbortData {
                node_id,
                obj_type: self.obj_type,
                obj_id: self.id.clone(),
            });
        }

        if let Some(expected) = self.file_hash.clone()
            && !self.verify_hash(&expected)
        {
            if self.retry < self.tuning.retry_limit {
                self.retry += 1;
                self.restart_from_scratch();
                self.resume(limiter);
            } else {
                self.retry = 0;
                self.peer_available.clear();
                self.hash_is_wrong = true;
                self.ready = false;
                self.lifecycle.push_back(Lifecycle::WrongHash);
            }
            return true;
        }

        self.started = false;
        self.finished = true;
        std::fs::remove_file(&self.info_path).ok();
        self.close_file();

        match std::fs::rename(&self.download_path, &self.file_path) {
            Ok(()) => {
                info!(obj_id = %self.id, path = %self.file_path.display(), "download finished");
                self.lifecycle.push_back(Lifecycle::Completed);
            }
            Err(e) => {
                warn!(obj_id = %self.id, error = %e, "failed to move completed download");
                self.lifecycle.push_back(Lifecycle::Failed);
            }
        }
        true
    }

    fn verify_hash(&mut self, expected: &str) -> bool {
        if let Some(file) = self.file.as_mut() {
            file.flush().ok();
        }
        match crate::rsync::file_hash(&self.download_path) {
            Ok(actual) if actual == expected => true,
            Ok(actual) => {
                warn!(obj_id = %self.id, expected, actual, "download hash check failed");
                false
            }
            Err(e) => {
                warn!(obj_id = %self.id, error = %e, "hash computation failed");
                false
            }
        }
    }

    fn restart_from_scratch(&mut self) {
        self.close_file();
        self.open_file(true);
        self.downloaded = RangeMap::new();
        self.peer_downloaded_count.clear();
        self.peer_last_receive.clear();
        self.peer_timeouts.clear();
        self.write_info_file();
        self.wanted = RangeMap::with_range(0, self.size);
        self.received = 0;
    }

    fn fail(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.stop_requests();
        self.close_file();
        self.lifecycle.push_back(Lifecycle::Failed);
    }

    fn stop_requests(&mut self) {
        let peers: Vec<String> = self.peer_requested.keys().cloned().collect();
        for node_id in peers {
            self.commands.push_back(PeerCommand::AbortData {
                node_id,
                obj_type: self.obj_type,
                obj_id: self.id.clone(),
            });
        }
        self.peer_requested.clear();
        self.peer_last_receive.clear();
    }

    fn open_file(&mut self, truncate: bool) -> bool {
        let result = if truncate {
            std::fs::File::create(&self.download_path)
        } else {
            crate::rsync::open_rw(&self.download_path)
        };
        match result {
            Ok(file) => {
                self.file = Some(file);
                true
            }
            Err(e) => {
                warn!(obj_id = %self.id, error = %e, "cannot open download file");
                self.fail();
                false
            }
        }
    }

    fn close_file(&mut self) {
        if let Some(mut file) = self.file.take() {
            file.flush().ok();
        }
    }

    fn write_info_file(&self) {
        match serde_json::to_vec(&self.downloaded) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&self.info_path, bytes) {
                    debug!(obj_id = %self.id, error = %e, "cannot write info sidecar");
                }
            }
            Err(e) => debug!(obj_id = %self.id, error = %e, "cannot serialize info sidecar"),
        }
    }

    fn read_info_file(&mut self) {
        let Ok(bytes) = std::fs::read(&self.info_path) else {
            return;
        };
        match serde_json::from_slice::<RangeMap>(&bytes) {
            Ok(map) => {
                debug!(obj_id = %self.id, resumed = map.total(), "restored download state");
                self.downloaded = map;
            }
            Err(e) => debug!(obj_id = %self.id, error = %e, "invalid info sidecar ignored"),
        }
    }

    fn clean_sidecars(&self) {
        std::fs::remove_file(&self.download_path).ok();
        std::fs::remove_file(&self.info_path).ok();
    }
}

fn sidecar(file_path: &Path, ext: &str) -> PathBuf {
    let mut name = file_path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(ext);
    file_path.with_file_name(name)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn unlimited() -> SpeedLimiter {
        SpeedLimiter::new(None)
    }

    fn task(dir: &TempDir, size: u64, hash: Option<&str>) -> DownloadTask {
        DownloadTask::new(
            ObjectType::File,
            "obj-1".to_string(),
            crate::types::download_priority::FILE,
            size,
            dir.path().join("target.bin"),
            "target.bin".to_string(),
            hash.map(str::to_string),
            TaskTuning::default(),
        )
    }

    fn full_availability(size: u64) -> RangeMap {
        RangeMap::with_range(0, size)
    }

    #[test]
    fn availability_makes_task_ready() {
        let dir = TempDir::new().unwrap();
        let limiter = unlimited();
        let mut t = task(&dir, 1000, None);

        t.on_availability_info(&limiter, "peer-a", &full_availability(1000));
        assert!(t.is_ready());
        assert!(t.take_lifecycle().contains(&Lifecycle::BecameReady));

        // repeated info with nothing new does not re-announce
        t.on_availability_info(&limiter, "peer-a", &full_availability(1000));
        assert!(!t.take_lifecycle().contains(&Lifecycle::BecameReady));
    }

    #[test]
    fn start_requests_chunks_from_available_peers() {
        let dir = TempDir::new().unwrap();
        let limiter = unlimited();
        let mut t = task(&dir, 1000, None);
        t.on_availability_info(&limiter, "peer-a", &full_availability(1000));
        t.start(&limiter);

        let commands = t.take_commands();
        let requests: Vec<_> = commands
            .iter()
            .filter_map(|c| match c {
                PeerCommand::RequestData { offset, length, .. } => Some((*offset, *length)),
                _ => None,
            })
            .collect();
        assert_eq!(requests, vec![(0, 1000)], "small object is one request");
    }

    #[test]
    fn data_reception_completes_and_renames() {
        let dir = TempDir::new().unwrap();
        let limiter = unlimited();
        let content = vec![7u8; 1000];
        let hash = {
            let probe = dir.path().join("probe");
            std::fs::write(&probe, &content).unwrap();
            crate::rsync::file_hash(&probe).unwrap()
        };

        let mut t = task(&dir, 1000, Some(&hash));
        t.on_availability_info(&limiter, "peer-a", &full_availability(1000));
        t.start(&limiter);
        t.take_commands();

        t.on_data_received(&limiter, "peer-a", 0, 1000, &content, false);

        assert!(t.is_finished());
        assert!(t.take_lifecycle().contains(&Lifecycle::Completed));
        assert_eq!(std::fs::read(dir.path().join("target.bin")).unwrap(), content);
        assert!(!dir.path().join("target.bin.download").exists());
        assert!(!dir.path().join("target.bin.info").exists());
    }

    #[test]
    fn wrong_hash_retries_then_surfaces() {
        let dir = TempDir::new().unwrap();
        let limiter = unlimited();
        let mut t = task(&dir, 100, Some("00000000000000000000000000000000"));
        t.on_availability_info(&limiter, "peer-a", &full_availability(100));
        t.start(&limiter);

        let junk = vec![1u8; 100];
        // retry_limit retries restart from scratch, then wrong hash surfaces
        for round in 0..=t.tuning.retry_limit {
            t.take_commands();
            t.on_data_received(&limiter, "peer-a", 0, 100, &junk, false);
            let lifecycle = t.take_lifecycle();
            if round < t.tuning.retry_limit {
                assert!(
                    !lifecycle.contains(&Lifecycle::WrongHash),
                    "round {round} should retry silently"
                );
                assert_eq!(t.received, 0, "state reset for retry");
            } else {
                assert!(lifecycle.contains(&Lifecycle::WrongHash));
                assert!(t.hash_is_wrong);
                assert!(!t.is_ready(), "peers cleared after final failure");
            }
        }
    }

    #[test]
    fn end_race_duplicates_only_other_peers_ranges() {
        let dir = TempDir::new().unwrap();
        let limiter = unlimited();
        let size = DOWNLOAD_PART_SIZE;
        let mut t = task(&dir, size, None);

        t.on_availability_info(&limiter, "peer-a", &full_availability(size));
        t.start(&limiter);
        t.take_commands();

        // everything outstanding is requested from peer-a; a second peer
        // arrives and may race peer-a's in-flight range
        t.on_availability_info(&limiter, "peer-b", &full_availability(size));
        let commands = t.take_commands();
        let race_request = commands.iter().find_map(|c| match c {
            PeerCommand::RequestData {
                node_id, offset, ..
            } if node_id == "peer-b" => Some(*offset),
            _ => None,
        });
        assert_eq!(race_request, Some(0), "peer-b races the whole part");

        // peer-a itself may not duplicate its own in-flight range while the
        // end-race timeout has not elapsed
        t.on_availability_info(&limiter, "peer-a", &full_availability(size));
        let commands = t.take_commands();
        assert!(
            !commands.iter().any(|c| matches!(
                c,
                PeerCommand::RequestData { node_id, .. } if node_id == "peer-a"
            )),
            "own ranges are not re-requested within the race timeout"
        );
    }

    #[test]
    fn end_race_duplicate_write_is_byte_exact() {
        let dir = TempDir::new().unwrap();
        let limiter = unlimited();
        let content = vec![42u8; 500];

        let mut t = task(&dir, 500, None);
        t.on_availability_info(&limiter, "peer-a", &full_availability(500));
        t.on_availability_info(&limiter, "peer-b", &full_availability(500));
        t.start(&limiter);
        t.take_commands();

        t.on_data_received(&limiter, "peer-a", 0, 500, &content, false);
        assert!(t.is_finished());

        // duplicate response after completion is ignored
        t.on_data_received(&limiter, "peer-b", 0, 500, &content, false);
        assert_eq!(std::fs::read(dir.path().join("target.bin")).unwrap(), content);
    }

    #[test]
    fn sidecar_resume_skips_committed_parts() {
        let dir = TempDir::new().unwrap();
        let limiter = unlimited();
        let size = DOWNLOAD_PART_SIZE * 3 + 100;

        // first incarnation downloads one full part, then "crashes"
        {
            let mut t = task(&dir, size, None);
            t.on_availability_info(&limiter, "peer-a", &full_availability(size));
            t.start(&limiter);
            t.take_commands();
            let part = vec![9u8; DOWNLOAD_PART_SIZE as usize];
            t.on_data_received(&limiter, "peer-a", 0, DOWNLOAD_PART_SIZE, &part, false);
            assert!(
                t.take_lifecycle()
                    .iter()
                    .any(|l| matches!(l, Lifecycle::PartDownloaded { offset: 0, .. })),
                "part boundary committed"
            );
            // no clean shutdown: files stay on disk
        }

        // second incarnation resumes from the sidecar
        let mut t = task(&dir, size, None);
        t.on_availability_info(&limiter, "peer-a", &full_availability(size));
        t.start(&limiter);

        assert_eq!(t.received, DOWNLOAD_PART_SIZE, "resumed at committed boundary");
        let commands = t.take_commands();
        for c in &commands {
            if let PeerCommand::RequestData { offset, .. } = c {
                assert!(
                    *offset >= DOWNLOAD_PART_SIZE,
                    "no byte below the committed boundary is re-requested"
                );
            }
        }
    }

    #[test]
    fn rate_limited_task_parks_and_reports_once() {
        let dir = TempDir::new().unwrap();
        // limiter with a drained bucket
        let limiter = SpeedLimiter::new(Some(10));
        limiter.drain_for_test();

        let mut t = task(&dir, 1000, None);
        t.on_availability_info(&limiter, "peer-a", &full_availability(1000));
        t.start(&limiter);

        let lifecycle = t.take_lifecycle();
        assert!(lifecycle.contains(&Lifecycle::NetworkLimited));
        assert!(t.parked_until.is_some());
        assert!(t.take_commands().iter().all(|c| !matches!(c, PeerCommand::RequestData { .. })));

        // unparking with an unlimited limiter issues the request and clears
        // the soft error
        let open = unlimited();
        t.unpark(&open);
        let lifecycle = t.take_lifecycle();
        assert!(lifecycle.contains(&Lifecycle::NetworkOk));
        assert!(t.take_commands().iter().any(|c| matches!(c, PeerCommand::RequestData { .. })));
    }

    #[test]
    fn peer_timeout_drops_peer_after_limit() {
        let dir = TempDir::new().unwrap();
        let limiter = unlimited();
        let mut t = task(&dir, 1000, None);
        t.tuning.receive_timeout = Duration::ZERO;

        t.on_availability_info(&limiter, "peer-a", &full_availability(1000));
        t.start(&limiter);
        t.take_commands();

        // first timeout: retry, peer keeps its availability
        std::thread::sleep(Duration::from_millis(5));
        t.check_timeouts(&limiter);
        assert!(t.peer_available.contains_key("peer-a"));

        // peer re-requested, second timeout: dropped entirely
        std::thread::sleep(Duration::from_millis(5));
        t.check_timeouts(&limiter);
        assert!(!t.peer_available.contains_key("peer-a"));
        assert!(
            t.take_lifecycle().contains(&Lifecycle::NotReady),
            "last peer gone makes the task not ready"
        );
    }

    #[test]
    fn cancel_removes_sidecars() {
        let dir = TempDir::new().unwrap();
        let limiter = unlimited();
        let mut t = task(&dir, 1000, None);
        t.on_availability_info(&limiter, "peer-a", &full_availability(1000));
        t.start(&limiter);
        t.take_commands();
        t.on_data_received(&limiter, "peer-a", 0, 100, &vec![1u8; 100], false);

        t.cancel();
        assert!(t.is_finished());
        assert!(!dir.path().join("target.bin.download").exists());
        assert!(!dir.path().join("target.bin.info").exists());
    }
}

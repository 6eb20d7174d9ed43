//! The sync orchestrator
//!
//! [`SyncEngine`] owns every subsystem, wires their channels together, and
//! derives the engine-wide status from their counters. It is the only
//! component that changes global state: pause, stop, license downgrade, and
//! the idle-time old-event reaper all run here.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::copies::CopiesStore;
use crate::db::Database;
use crate::downloader::{DownloadCommand, DownloadEvent, DownloadManager};
use crate::error::Result;
use crate::monitor::{FilesystemMonitor, QuietPaths};
use crate::network::{ConnectivityService, Consumer, PeerRegistry, PeerTransport, Supplier};
use crate::patches::{PatchNotification, PatchTransfer, PatchesStore};
use crate::quiet::QuietProcessor;
use crate::signalling::{
    EventServer, EventsCheckTimer, InboundMessage, OutboundMessage, PatchAnnouncement,
    SignallingClient,
};
use crate::speed_limiter::SpeedLimiter;
use crate::types::{Event, ObjectType, SyncCounters, SyncStatus, SyncSubstatus};

pub mod conflict;
pub mod event_queue;
pub mod reaper;

pub use event_queue::EventQueueProcessor;

#[derive(Default)]
struct TrafficTotals {
    p2p_rx: u64,
    relay_rx: u64,
    p2p_tx: u64,
    relay_tx: u64,
}

/// The assembled peer-to-peer synchronization engine
pub struct SyncEngine {
    config: Config,
    db: Arc<Database>,
    copies: Arc<CopiesStore>,
    patches: Arc<PatchesStore>,
    monitor: Arc<FilesystemMonitor>,
    quiet: Arc<QuietProcessor>,
    downloads: DownloadManager,
    connectivity: Arc<ConnectivityService>,
    supplier: Arc<Supplier>,
    event_queue: Arc<EventQueueProcessor>,
    signalling: Arc<dyn SignallingClient>,

    events_tx: broadcast::Sender<Event>,
    status: Mutex<(SyncStatus, SyncSubstatus)>,
    last_status_sent: AtomicUsize,
    paused: AtomicBool,
    transfers_working: AtomicBool,
    events_erased: AtomicUsize,
    traffic: Mutex<TrafficTotals>,
    min_stored_event: Mutex<Option<String>>,
    events_check: Mutex<EventsCheckTimer>,

    local_rx: Mutex<Option<mpsc::UnboundedReceiver<crate::monitor::LocalEvent>>>,
    dl_events_rx: Mutex<Option<mpsc::UnboundedReceiver<DownloadEvent>>>,
    patch_transfers_rx: Mutex<Option<mpsc::UnboundedReceiver<PatchTransfer>>>,

    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Assemble the engine from its configuration and external services
    pub async fn new(
        config: Config,
        server: Arc<dyn EventServer>,
        signalling: Arc<dyn SignallingClient>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        std::fs::create_dir_all(&config.root)?;
        std::fs::create_dir_all(config.state_dir())?;

        let db = Arc::new(Database::open(&config.storage_db_path()).await?);
        let copies = Arc::new(
            CopiesStore::open(&config.copies_dir(), &config.signatures_dir()).await?,
        );
        let (patches, patch_transfers_rx) = PatchesStore::open(
            &config.patches_dir(),
            &config.signatures_dir(),
            Arc::clone(&copies),
            Arc::clone(&db),
            config.transfer.retry_download_timeout,
        )
        .await?;
        let patches = Arc::new(patches);

        let (events_tx, _) = broadcast::channel(1024);
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let quiet_paths = QuietPaths::new();

        let monitor = Arc::new(FilesystemMonitor::new(
            config.root.clone(),
            config.monitor.clone(),
            Arc::clone(&db),
            Arc::clone(&copies),
            config.signatures_dir(),
            quiet_paths.clone(),
            events_tx.clone(),
            local_tx,
        ));

        let quiet = Arc::new(QuietProcessor::new(
            config.root.clone(),
            Arc::clone(&db),
            Arc::clone(&copies),
            config.patches_dir(),
            config.signatures_dir(),
            quiet_paths,
        ));

        let (peer_cmd_tx, peer_cmd_rx) = mpsc::unbounded_channel();
        let (dl_events_tx, dl_events_rx) = mpsc::unbounded_channel();
        let (downloads, downloads_handle) =
            DownloadManager::spawn(&config.transfer, peer_cmd_tx, dl_events_tx);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(PeerRegistry::new());
        let supplier = Arc::new(Supplier::new(
            Arc::clone(&db),
            Arc::clone(&copies),
            Arc::clone(&patches),
            downloads.clone(),
            SpeedLimiter::new(config.transfer.upload_limit_bps),
            config.transfer.processing_requests_limit,
            outbound_tx.clone(),
        ));
        let consumer = Arc::new(Consumer::new(
            outbound_tx,
            downloads.clone(),
            Arc::clone(&registry),
        ));
        let cancel = CancellationToken::new();
        let (connectivity, mut network_handles) = ConnectivityService::new(
            registry,
            Arc::clone(&supplier),
            consumer,
            downloads.clone(),
            transport,
            peer_cmd_rx,
            outbound_rx,
            cancel.clone(),
        );

        let event_queue = Arc::new(EventQueueProcessor::new(
            config.root.clone(),
            Arc::clone(&db),
            Arc::clone(&copies),
            Arc::clone(&patches),
            Arc::clone(&quiet),
            downloads.clone(),
            server,
            events_tx.clone(),
            config.download_backups,
            config.monitor.excluded_dirs.clone(),
        ));

        let events_check = EventsCheckTimer::new(
            config.events_check.after_peer_batch,
            config.events_check.after_server_batch,
        );

        let mut handles = vec![downloads_handle];
        handles.append(&mut network_handles);

        Ok(Arc::new(Self {
            config,
            db,
            copies,
            patches,
            monitor,
            quiet,
            downloads,
            connectivity: Arc::new(connectivity),
            supplier,
            event_queue,
            signalling,
            events_tx,
            status: Mutex::new((SyncStatus::Init, SyncSubstatus::Sync)),
            last_status_sent: AtomicUsize::new(usize::MAX),
            paused: AtomicBool::new(false),
            transfers_working: AtomicBool::new(false),
            events_erased: AtomicUsize::new(0),
            traffic: Mutex::new(TrafficTotals::default()),
            min_stored_event: Mutex::new(None),
            events_check: Mutex::new(events_check),
            local_rx: Mutex::new(Some(local_rx)),
            dl_events_rx: Mutex::new(Some(dl_events_rx)),
            patch_transfers_rx: Mutex::new(Some(patch_transfers_rx)),
            cancel,
            handles: Mutex::new(handles),
        }))
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    /// The event queue processor (exposed for drivers and tests)
    pub fn event_queue(&self) -> &Arc<EventQueueProcessor> {
        &self.event_queue
    }

    /// The quiet processor (exposed for drivers and tests)
    pub fn quiet(&self) -> &Arc<QuietProcessor> {
        &self.quiet
    }

    /// The connectivity service (drivers feed peer sessions and frames here)
    pub fn connectivity(&self) -> &Arc<ConnectivityService> {
        &self.connectivity
    }

    /// Current upload info entries for the UI
    pub fn uploads_info(&self) -> Vec<crate::network::UploadInfo> {
        self.supplier.uploads_info()
    }

    /// Current status, substatus, and counters
    pub fn status(&self) -> (SyncStatus, SyncSubstatus, SyncCounters) {
        let (status, substatus) = *self.status.lock().unwrap_or_else(|e| e.into_inner());
        (status, substatus, self.counters())
    }

    fn counters(&self) -> SyncCounters {
        SyncCounters {
            local_events: self.event_queue.local_events_count(),
            remote_events: self.event_queue.remote_events_count(),
            fs_events: self.monitor.fs_events_count(),
            events_erased: self.events_erased.load(Ordering::Relaxed),
        }
    }

    /// Start every subsystem: scan, watch, process, transfer
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!(root = %self.config.root.display(), "sync engine starting");
        self.set_status(SyncStatus::Indexing, SyncSubstatus::Sync);

        // sweep staging leftovers before watching
        self.copies.remove_copies_not_in_db().await?;

        let monitor_handle = self.monitor.start()?;
        self.push_handle(monitor_handle);

        let offline = self.monitor.offline_scan().await?;
        self.monitor.inject(offline);

        let patches_handle = self.patches.spawn_worker();
        self.push_handle(patches_handle);
        self.patches.check_patches(true).await?;

        self.spawn_local_loop();
        self.spawn_download_events_loop();
        self.spawn_patch_transfers_loop();
        self.spawn_patch_notifications_loop();
        self.spawn_timer_loop();

        // reschedule interrupted remote content
        self.event_queue.drive_pending().await?;
        Ok(())
    }

    /// Sticky user pause
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
        self.downloads.send(DownloadCommand::PauseAll);
        self.set_status(SyncStatus::Pause, SyncSubstatus::Sync);
    }

    /// Resume from user pause
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
        self.downloads.send(DownloadCommand::ResumeAll);
        self.update_status();
    }

    /// The account license was downgraded; stop producing new events
    pub fn on_license_downgraded(&self) {
        warn!("license downgraded, pausing local event registration");
        self.event_queue.pause_registration();
    }

    /// The account license was restored
    pub fn on_license_restored(&self) {
        self.event_queue.resume_registration();
    }

    /// Stop everything in dependency order
    pub async fn shutdown(&self) {
        info!("sync engine shutting down");
        self.cancel.cancel();
        self.monitor.stop();
        self.patches.stop();
        self.downloads.shutdown();

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!("subsystem did not stop in time");
            }
        }

        self.patches.close().await;
        self.copies.close().await;
        self.db.close().await;
        info!("sync engine stopped");
    }

    /// Dispatch one message from the signalling server
    pub async fn handle_signalling(&self, message: InboundMessage) -> Result<()> {
        match message {
            InboundMessage::PeerList { peers } => {
                for peer in peers {
                    if peer.is_online {
                        self.connectivity.on_peer_connected(&peer.node_id, false);
                    }
                }
                self.patches.on_nodes_changed();
            }
            InboundMessage::PeerConnect { peer } => {
                self.connectivity.on_peer_connected(&peer.node_id, false);
                self.patches.on_nodes_changed();
            }
            InboundMessage::PeerDisconnect { node_id } => {
                self.connectivity.on_peer_disconnected(&node_id);
            }
            InboundMessage::Sdp { .. } => {
                // session negotiation belongs to the transport driver
            }
            InboundMessage::FileEvents { events, node_id } => {
                let from_peer = node_id.is_some();
                let count = self.event_queue.process_remote_batch(events).await?;
                debug!(count, from_peer, "remote event batch processed");
                let mut timer = self.events_check.lock().unwrap_or_else(|e| e.into_inner());
                if from_peer {
                    timer.on_peer_batch();
                } else {
                    timer.on_server_batch();
                }
            }
            InboundMessage::PatchesInfo { patches_info } => {
                for patch in patches_info {
                    self.patches.update_patch(&patch.diff_uuid, patch.size).await?;
                }
            }
            InboundMessage::MinStoredEvent { event_uuid } => {
                *self
                    .min_stored_event
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = Some(event_uuid);
            }
            InboundMessage::CollaboratedFolders { folders } => {
                self.event_queue.set_collaborated_folders(folders);
            }
            InboundMessage::SharingList { .. }
            | InboundMessage::SharingEnable { .. }
            | InboundMessage::SharingDisable { .. }
            | InboundMessage::NodeStatus { .. }
            | InboundMessage::NewNotificationsCount { .. } => {
                // outer surfaces; drivers render these
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // internal loops
    // ------------------------------------------------------------------

    fn spawn_local_loop(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let Some(mut local_rx) = engine
            .local_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            warn!("local loop already spawned");
            return;
        };

        self.push_handle(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = engine.cancel.cancelled() => break,
                    event = local_rx.recv() => {
                        let Some(event) = event else { break };
                        if let Err(e) = engine.event_queue.process_local(event).await {
                            warn!(error = %e, "local event processing failed");
                        }
                        engine.update_status();
                    }
                }
            }
            debug!("local event loop stopped");
        }));
    }

    fn spawn_download_events_loop(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let Some(mut dl_events_rx) = engine
            .dl_events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            warn!("download events loop already spawned");
            return;
        };

        self.push_handle(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = engine.cancel.cancelled() => break,
                    event = dl_events_rx.recv() => {
                        let Some(event) = event else { break };
                        engine.handle_download_event(event).await;
                        engine.update_status();
                    }
                }
            }
            debug!("download events loop stopped");
        }));
    }

    async fn handle_download_event(&self, event: DownloadEvent) {
        match event {
            DownloadEvent::Completed {
                obj_type: ObjectType::File,
                obj_id,
                ..
            } => {
                if let Err(e) = self.event_queue.on_file_downloaded(&obj_id).await {
                    warn!(obj_id, error = %e, "applying downloaded file failed");
                }
            }
            DownloadEvent::Completed {
                obj_type: ObjectType::Patch,
                obj_id,
                ..
            } => {
                self.patches.on_patch_downloaded(&obj_id);
            }
            DownloadEvent::Failed { obj_type, obj_id } => {
                if obj_type == ObjectType::Patch {
                    self.patches.on_patch_download_failed(&obj_id);
                }
            }
            DownloadEvent::WrongHash { obj_type, obj_id } => {
                if obj_type == ObjectType::File {
                    if let Err(e) = self.event_queue.on_wrong_hash(&obj_id).await {
                        warn!(obj_id, error = %e, "wrong-hash rescheduling failed");
                    }
                } else {
                    self.patches.on_patch_download_failed(&obj_id);
                }
            }
            DownloadEvent::NoDiskSpace {
                obj_id: _,
                display_name,
                is_error,
            } => {
                self.events_tx
                    .send(Event::NoDiskSpace {
                        name: display_name,
                        is_error,
                    })
                    .ok();
            }
            DownloadEvent::Progress {
                name,
                received,
                size,
            } => {
                self.events_tx
                    .send(Event::DownloadProgress {
                        name,
                        received,
                        size,
                    })
                    .ok();
            }
            DownloadEvent::PartDownloaded {
                obj_type,
                obj_id,
                offset,
                length,
            } => {
                self.supplier.announce_part(obj_type, &obj_id, offset, length);
            }
            DownloadEvent::Idle => {
                self.transfers_working.store(false, Ordering::Relaxed);
            }
            DownloadEvent::Working => {
                self.transfers_working.store(true, Ordering::Relaxed);
            }
            DownloadEvent::NetworkLimited => {
                self.events_tx.send(Event::NetworkLimited).ok();
            }
            DownloadEvent::NetworkOk => {
                self.events_tx.send(Event::NetworkOk).ok();
            }
            DownloadEvent::TrafficRx { p2p, relay } => {
                let mut traffic = self.traffic.lock().unwrap_or_else(|e| e.into_inner());
                traffic.p2p_rx += p2p;
                traffic.relay_rx += relay;
            }
        }
    }

    fn spawn_patch_transfers_loop(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let Some(mut transfers_rx) = engine
            .patch_transfers_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            warn!("patch transfers loop already spawned");
            return;
        };

        self.push_handle(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = engine.cancel.cancelled() => break,
                    transfer = transfers_rx.recv() => {
                        let Some(transfer) = transfer else { break };
                        match transfer {
                            PatchTransfer::Download {
                                uuid,
                                size,
                                priority,
                                files,
                            } => {
                                let display_name = files
                                    .first()
                                    .map(|(path, _)| path.clone())
                                    .unwrap_or_else(|| uuid.clone());
                                engine.downloads.add_patch_download(
                                    &uuid,
                                    priority,
                                    size,
                                    engine.patches.patch_path(&uuid),
                                    &display_name,
                                );
                            }
                            PatchTransfer::Cancel { uuid } => {
                                engine.downloads.cancel_download(&uuid);
                            }
                        }
                    }
                }
            }
            debug!("patch transfers loop stopped");
        }));
    }

    fn spawn_patch_notifications_loop(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let mut notifications = self.patches.subscribe();

        self.push_handle(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = engine.cancel.cancelled() => break,
                    notification = notifications.recv() => {
                        match notification {
                            Ok(PatchNotification::Created { uuid, size }) => {
                                engine.on_patch_created(&uuid, size).await;
                            }
                            Ok(PatchNotification::Deleted { .. }) => {}
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(missed = n, "patch notifications lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            debug!("patch notifications loop stopped");
        }));
    }

    async fn on_patch_created(&self, uuid: &str, size: u64) {
        // announce the patch to the server, then to peers
        match self.event_queue.server().register_patch(uuid, size).await {
            Ok(()) => {
                if let Err(e) = self.patches.on_patch_registered(uuid).await {
                    warn!(uuid, error = %e, "patch registration bookkeeping failed");
                }
                self.signalling
                    .send(OutboundMessage::PatchesInfo {
                        patches_info: vec![PatchAnnouncement {
                            diff_uuid: uuid.to_string(),
                            size,
                        }],
                    })
                    .await
                    .ok();
            }
            Err(e) => warn!(uuid, error = %e, "patch registration failed"),
        }
    }

    fn spawn_timer_loop(self: &Arc<Self>) {
        let engine = Arc::clone(self);

        self.push_handle(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            let mut traffic_tick = 0u32;
            loop {
                tokio::select! {
                    _ = engine.cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }

                engine.update_status();
                engine.publish_node_status().await;

                // re-ask for missed events on the configured cadence
                let due = {
                    let mut timer = engine
                        .events_check
                        .lock()
                        .unwrap_or_else(|e| e.into_inner());
                    timer.fire_if_due()
                };
                if due {
                    engine.request_last_file_events().await;
                }

                // the reaper runs only at full idle
                if engine.is_idle() {
                    let watermark = engine
                        .min_stored_event
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .take();
                    if let Some(uuid) = watermark {
                        match reaper::clean_old_events(
                            &engine.db,
                            &engine.copies,
                            &engine.patches,
                            &uuid,
                        )
                        .await
                        {
                            Ok(erased) => {
                                engine.events_erased.fetch_add(erased, Ordering::Relaxed);
                            }
                            Err(e) => {
                                warn!(error = %e, "old-event reaping failed, will retry");
                                *engine
                                    .min_stored_event
                                    .lock()
                                    .unwrap_or_else(|e| e.into_inner()) = Some(uuid);
                            }
                        }
                    }
                }

                traffic_tick += 1;
                if traffic_tick >= 30 {
                    traffic_tick = 0;
                    engine.send_traffic_info().await;
                }
            }
            debug!("timer loop stopped");
        }));
    }

    // Tell the server about status transitions, once per change.
    async fn publish_node_status(&self) {
        let (status, _) = *self.status.lock().unwrap_or_else(|e| e.into_inner());
        let code = match status {
            SyncStatus::Init => 0,
            SyncStatus::Disconnected => 1,
            SyncStatus::Indexing => 2,
            SyncStatus::InWork => 3,
            SyncStatus::Wait => 4,
            SyncStatus::Pause => 5,
        };
        if self.last_status_sent.swap(code, Ordering::Relaxed) == code {
            return;
        }
        let disk_free = crate::utils::get_available_space(&self.config.root).unwrap_or(0);
        self.signalling
            .send(OutboundMessage::NodeStatus {
                status: code as i32,
                disk_free,
            })
            .await
            .ok();
    }

    async fn request_last_file_events(&self) {
        let last_event_id = self.db.max_server_event_id().await.ok().flatten().unwrap_or(0);
        self.signalling
            .send(OutboundMessage::LastFileEvents {
                last_event_id,
                checked_event_id: last_event_id,
                events_count_check: 100,
                node_without_backup: !self.config.download_backups,
            })
            .await
            .ok();
    }

    async fn send_traffic_info(&self) {
        let (p2p_rx, relay_rx, p2p_tx, relay_tx) = {
            let mut traffic = self.traffic.lock().unwrap_or_else(|e| e.into_inner());
            let totals = (
                traffic.p2p_rx,
                traffic.relay_rx,
                traffic.p2p_tx,
                traffic.relay_tx,
            );
            *traffic = TrafficTotals::default();
            totals
        };
        if p2p_rx + relay_rx + p2p_tx + relay_tx == 0 {
            return;
        }
        self.signalling
            .send(OutboundMessage::TrafficInfo {
                p2p_rx,
                relay_rx,
                p2p_tx,
                relay_tx,
            })
            .await
            .ok();
    }

    fn is_idle(&self) -> bool {
        let counters = self.counters();
        counters.fs_events == 0
            && counters.local_events == 0
            && counters.remote_events == 0
            && self.downloads.downloads_count() == 0
            && !self.transfers_working.load(Ordering::Relaxed)
    }

    // Status is derived from counters, never set directly by subsystems.
    fn update_status(&self) {
        if self.paused.load(Ordering::Relaxed) {
            return;
        }

        let counters = self.counters();
        let transfers_active =
            self.downloads.downloads_count() > 0 || self.transfers_working.load(Ordering::Relaxed);
        let queues_active =
            counters.fs_events > 0 || counters.local_events > 0 || counters.remote_events > 0;

        let status = if !transfers_active && !queues_active {
            SyncStatus::Wait
        } else if !transfers_active {
            SyncStatus::Indexing
        } else {
            SyncStatus::InWork
        };
        let substatus = if counters.remote_events > 0 && !transfers_active {
            SyncSubstatus::Apply
        } else {
            SyncSubstatus::Sync
        };

        self.set_status(status, substatus);
    }

    fn set_status(&self, status: SyncStatus, substatus: SyncSubstatus) {
        let changed = {
            let mut current = self.status.lock().unwrap_or_else(|e| e.into_inner());
            if *current == (status, substatus) {
                false
            } else {
                *current = (status, substatus);
                true
            }
        };
        if changed {
            debug!(?status, ?substatus, "status changed");
            self.events_tx
                .send(Event::StatusChanged {
                    status,
                    substatus,
                    counters: self.counters(),
                })
                .ok();
        }
    }

    fn push_handle(&self, handle: JoinHandle<()>) {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Root directory of the synchronized tree
    pub fn root(&self) -> &PathBuf {
        &self.config.root
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

//! # swarmsync
//!
//! Peer-to-peer file synchronization engine with content-addressed storage
//! and rsync-style binary deltas.
//!
//! ## Design Philosophy
//!
//! swarmsync is designed to be:
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Content-addressed** - Full-file copies and binary patches are keyed
//!   by content hash and reference-counted
//! - **Causally consistent** - Per-file event chains linearize concurrent
//!   edits; the losing side of a race survives as a conflict copy
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! The signalling connection, the peer transport, and the event log API are
//! external collaborators: drivers implement [`SignallingClient`],
//! [`PeerTransport`], and [`EventServer`] and feed inbound traffic into the
//! engine.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use swarmsync::{Config, SyncEngine};
//! # use swarmsync::{EventServer, SignallingClient, PeerTransport};
//!
//! # async fn example(
//! #     server: Arc<dyn EventServer>,
//! #     signalling: Arc<dyn SignallingClient>,
//! #     transport: Arc<dyn PeerTransport>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::new("/data/box", "my-node-id");
//! let engine = SyncEngine::new(config, server, signalling, transport).await?;
//!
//! // Subscribe to events
//! let mut events = engine.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("Event: {:?}", event);
//!     }
//! });
//!
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Reference-counted content blob store
pub mod copies;
/// Database persistence layer
pub mod db;
/// Chunked swarm download manager
pub mod downloader;
/// Error types
pub mod error;
/// Filesystem monitoring and the staged event pipeline
pub mod monitor;
/// Peer connectivity, wire protocol, suppliers and consumers
pub mod network;
/// Reference-counted binary patch store
pub mod patches;
/// Quiet application of remote mutations
pub mod quiet;
/// Block signatures, content hashes, and patches
pub mod rsync;
/// Signalling message shapes and external service seams
pub mod signalling;
/// Rate limiting with a token bucket
pub mod speed_limiter;
/// The orchestrator, event queue processor, and conflict handling
pub mod sync;
/// Core types and events
pub mod types;
/// Path filtering and disk space utilities
pub mod utils;

// Re-export commonly used types
pub use config::{Config, EventsCheckConfig, MonitorConfig, TransferConfig};
pub use copies::CopiesStore;
pub use db::Database;
pub use downloader::{DownloadEvent, DownloadManager};
pub use error::{
    ApplyError, DatabaseError, DownloadError, Error, EventError, ProtocolError, Result,
};
pub use network::{ConnectivityService, PeerMessage, PeerTransport};
pub use patches::PatchesStore;
pub use signalling::{
    EventProposal, EventServer, InboundMessage, OutboundMessage, RegisterOutcome, RemoteFileEvent,
    SignallingClient,
};
pub use sync::{EventQueueProcessor, SyncEngine};
pub use types::{
    Event, EventState, EventType, FileId, ObjectType, SyncCounters, SyncStatus, SyncSubstatus,
};

/// Helper function to run the engine with graceful signal handling.
///
/// Waits for a termination signal and then calls the engine's `shutdown()`
/// method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal
///   registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(engine: std::sync::Arc<SyncEngine>) -> Result<()> {
    wait_for_signal().await;
    engine.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}

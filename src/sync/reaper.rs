//! The old-event reaper
//!
//! When the sync is idle and the server advertises the earliest retained
//! event, everything older becomes unreachable history: files whose head is
//! a DELETE at or before the watermark are removed from the database
//! entirely, and surviving files lose their pre-watermark chain entries.
//! Content and patch references held by the removed events are released;
//! patches and copies disappear on their own when their refcounts drain.

use std::sync::Arc;
use tracing::{debug, info};

use crate::copies::CopiesStore;
use crate::db::{Database, EventRecord};
use crate::error::Result;
use crate::patches::PatchesStore;

/// Remove events retired by the server watermark
///
/// `min_stored_uuid` is the earliest event uuid the server still retains.
/// Returns the number of erased event rows. The caller must ensure the sync
/// is idle; this pass does not check.
pub async fn clean_old_events(
    db: &Database,
    copies: &Arc<CopiesStore>,
    patches: &Arc<PatchesStore>,
    min_stored_uuid: &str,
) -> Result<usize> {
    let Some(min_event) = db.get_event_by_uuid(min_stored_uuid).await? else {
        debug!(min_stored_uuid, "watermark event unknown locally, nothing to reap");
        return Ok(0);
    };
    let Some(watermark) = min_event.server_event_id else {
        return Ok(0);
    };

    let mut erased = 0;

    // files whose head is a DELETE at or before the watermark disappear
    let dead_files = db.files_with_delete_head_before(watermark).await?;
    for file in &dead_files {
        let chain = db.events_for_file(file.id).await?;
        for event in &chain {
            release_event_references(copies, patches, event).await?;
        }
        erased += chain.len();
        db.purge_file(file.id).await?;
        debug!(path = %file.relative_path, events = chain.len(), "reaped deleted file");
    }

    // history trimming on surviving files; chain heads stay
    let trimmed = db.take_events_before(watermark).await?;
    for event in &trimmed {
        release_event_references(copies, patches, event).await?;
    }
    erased += trimmed.len();

    copies.commit_last_changes().await?;
    patches.commit_last_changes().await?;

    if erased > 0 {
        info!(erased, watermark, "old events reaped");
    }
    Ok(erased)
}

async fn release_event_references(
    copies: &Arc<CopiesStore>,
    patches: &Arc<PatchesStore>,
    event: &EventRecord,
) -> Result<()> {
    if let Some(hash) = &event.file_hash {
        copies
            .remove_copy_reference(hash, &format!("reaper event {}", event.uuid), true)
            .await?;
    }
    if let Some(hash) = &event.file_hash_before_event {
        copies
            .remove_copy_reference(hash, &format!("reaper event {}", event.uuid), true)
            .await?;
    }
    if let Some(uuid) = &event.diff_file_uuid {
        patches.remove_direct_patch(uuid, true).await?;
    }
    if let Some(uuid) = &event.rev_diff_file_uuid {
        patches.remove_reverse_patch(uuid, true).await?;
    }
    Ok(())
}

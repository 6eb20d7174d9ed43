//! Database layer tests against an in-memory SQLite pool.

use super::*;
use crate::types::{EventState, EventType};

fn new_file(path: &str, is_folder: bool) -> NewFile {
    NewFile {
        relative_path: path.to_string(),
        is_folder,
        file_hash: if is_folder { None } else { Some(format!("hash-{path}")) },
        mtime: 100,
        size: if is_folder { 0 } else { 6 },
        events_file_id: None,
    }
}

fn new_event(file_id: FileId, uuid: &str, event_type: EventType) -> NewEvent {
    NewEvent {
        uuid: uuid.to_string(),
        server_event_id: None,
        file_id,
        event_type: event_type.to_i32(),
        file_name: "f".to_string(),
        folder_uuid: None,
        file_hash: Some("h1".to_string()),
        file_hash_before_event: None,
        file_size: 6,
        file_size_before_event: 0,
        diff_file_uuid: None,
        rev_diff_file_uuid: None,
        state: EventState::Sent.to_i32(),
        last_event_id: None,
        timestamp: 1,
    }
}

#[tokio::test]
async fn insert_and_fetch_file_by_path_and_id() {
    let db = Database::in_memory().await.unwrap();
    let id = db.insert_file(&new_file("a/b.txt", false)).await.unwrap();

    let by_id = db.get_file(id).await.unwrap().unwrap();
    assert_eq!(by_id.relative_path, "a/b.txt");
    assert!(!by_id.is_folder);
    assert_eq!(by_id.file_hash.as_deref(), Some("hash-a/b.txt"));

    let by_path = db.get_file_by_path("a/b.txt").await.unwrap().unwrap();
    assert_eq!(by_path.id, id);

    assert!(db.get_file_by_path("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_paths_are_rejected() {
    let db = Database::in_memory().await.unwrap();
    db.insert_file(&new_file("dup.txt", false)).await.unwrap();
    assert!(db.insert_file(&new_file("dup.txt", false)).await.is_err());
}

#[tokio::test]
async fn events_file_id_lookup() {
    let db = Database::in_memory().await.unwrap();
    let id = db.insert_file(&new_file("x.txt", false)).await.unwrap();
    db.set_events_file_id(id, 42).await.unwrap();

    let found = db.get_file_by_events_file_id(42).await.unwrap().unwrap();
    assert_eq!(found.id, id);
    assert_eq!(found.events_file_id, Some(42));
}

#[tokio::test]
async fn move_subtree_rewrites_descendants_in_bulk() {
    let db = Database::in_memory().await.unwrap();
    db.insert_file(&new_file("d1", true)).await.unwrap();
    db.insert_file(&new_file("d1/f1", false)).await.unwrap();
    db.insert_file(&new_file("d1/sub", true)).await.unwrap();
    db.insert_file(&new_file("d1/sub/f2", false)).await.unwrap();
    db.insert_file(&new_file("d1other", false)).await.unwrap();

    let rewritten = db.move_subtree("d1", "d2").await.unwrap();
    assert_eq!(rewritten, 4, "folder plus three descendants");

    assert!(db.get_file_by_path("d2/sub/f2").await.unwrap().is_some());
    assert!(db.get_file_by_path("d1/sub/f2").await.unwrap().is_none());
    // sibling with a shared name prefix is untouched
    assert!(db.get_file_by_path("d1other").await.unwrap().is_some());
}

#[tokio::test]
async fn delete_subtree_hides_records_but_keeps_chains() {
    let db = Database::in_memory().await.unwrap();
    db.insert_file(&new_file("d", true)).await.unwrap();
    let fid = db.insert_file(&new_file("d/f", false)).await.unwrap();
    db.insert_event(&new_event(fid, "ev-1", EventType::Create))
        .await
        .unwrap();

    let deleted = db.delete_subtree("d").await.unwrap();
    assert_eq!(deleted.len(), 2);
    assert!(db.get_file_by_path("d/f").await.unwrap().is_none());
    // the chain survives for the reaper; the record is fetchable by id
    assert!(db.get_event_by_uuid("ev-1").await.unwrap().is_some());
    assert!(db.get_file(fid).await.unwrap().unwrap().deleted);

    // the path can be reused by a new record
    db.insert_file(&new_file("d/f", false)).await.unwrap();
}

#[tokio::test]
async fn purge_file_removes_row_and_chain() {
    let db = Database::in_memory().await.unwrap();
    let fid = db.insert_file(&new_file("p", false)).await.unwrap();
    db.insert_event(&new_event(fid, "ev-p", EventType::Create))
        .await
        .unwrap();
    db.delete_file(fid).await.unwrap();

    db.purge_file(fid).await.unwrap();
    assert!(db.get_file(fid).await.unwrap().is_none());
    assert!(db.get_event_by_uuid("ev-p").await.unwrap().is_none());
}

#[tokio::test]
async fn excluded_flag_covers_subtree() {
    let db = Database::in_memory().await.unwrap();
    db.insert_file(&new_file("d", true)).await.unwrap();
    db.insert_file(&new_file("d/f", false)).await.unwrap();
    db.insert_file(&new_file("other", false)).await.unwrap();

    let flagged = db.set_subtree_excluded("d", true).await.unwrap();
    assert_eq!(flagged, 2);

    assert!(db.get_file_by_path("d/f").await.unwrap().unwrap().excluded);
    assert!(!db.get_file_by_path("other").await.unwrap().unwrap().excluded);
}

#[tokio::test]
async fn head_event_prefers_registered_chain() {
    let db = Database::in_memory().await.unwrap();
    let fid = db.insert_file(&new_file("f", false)).await.unwrap();

    db.insert_event(&new_event(fid, "ev-1", EventType::Create))
        .await
        .unwrap();
    db.set_server_event_id("ev-1", 10, EventState::Applied)
        .await
        .unwrap();

    db.insert_event(&new_event(fid, "ev-2", EventType::Update))
        .await
        .unwrap();
    db.set_server_event_id("ev-2", 11, EventState::Downloaded)
        .await
        .unwrap();

    // unregistered local event exists too
    db.insert_event(&new_event(fid, "ev-3", EventType::Update))
        .await
        .unwrap();

    let head = db.head_event(fid).await.unwrap().unwrap();
    assert_eq!(head.uuid, "ev-2", "registered head wins over unregistered");
    assert_eq!(head.server_event_id, Some(11));
}

#[tokio::test]
async fn applied_event_is_unique_head() {
    let db = Database::in_memory().await.unwrap();
    let fid = db.insert_file(&new_file("f", false)).await.unwrap();

    db.insert_event(&new_event(fid, "ev-1", EventType::Create))
        .await
        .unwrap();
    db.set_server_event_id("ev-1", 1, EventState::Applied)
        .await
        .unwrap();

    db.insert_event(&new_event(fid, "ev-2", EventType::Update))
        .await
        .unwrap();
    db.demote_applied(fid).await.unwrap();
    db.set_server_event_id("ev-2", 2, EventState::Applied)
        .await
        .unwrap();

    let applied = db.applied_event(fid).await.unwrap().unwrap();
    assert_eq!(applied.uuid, "ev-2");

    let chain = db.events_for_file(fid).await.unwrap();
    let applied_count = chain
        .iter()
        .filter(|e| e.state() == EventState::Applied)
        .count();
    assert_eq!(applied_count, 1, "exactly one applied event per file");
}

#[tokio::test]
async fn events_after_replays_in_server_order() {
    let db = Database::in_memory().await.unwrap();
    let fid = db.insert_file(&new_file("f", false)).await.unwrap();

    for (uuid, sid) in [("e1", 5), ("e2", 9), ("e3", 7)] {
        db.insert_event(&new_event(fid, uuid, EventType::Update))
            .await
            .unwrap();
        db.set_server_event_id(uuid, sid, EventState::Applied)
            .await
            .unwrap();
    }

    let replay = db.events_after(5).await.unwrap();
    let ids: Vec<_> = replay.iter().map(|e| e.server_event_id.unwrap()).collect();
    assert_eq!(ids, vec![7, 9]);
}

#[tokio::test]
async fn reaper_queries_find_deleted_files_and_trim_history() {
    let db = Database::in_memory().await.unwrap();

    // file A: deleted at server id 3
    let fa = db.insert_file(&new_file("a", false)).await.unwrap();
    db.insert_event(&new_event(fa, "a1", EventType::Create))
        .await
        .unwrap();
    db.set_server_event_id("a1", 1, EventState::Applied)
        .await
        .unwrap();
    db.insert_event(&new_event(fa, "a2", EventType::Delete))
        .await
        .unwrap();
    db.set_server_event_id("a2", 3, EventState::Applied)
        .await
        .unwrap();

    // file B: alive with history
    let fb = db.insert_file(&new_file("b", false)).await.unwrap();
    for (uuid, sid) in [("b1", 2), ("b2", 4), ("b3", 6)] {
        db.insert_event(&new_event(fb, uuid, EventType::Update))
            .await
            .unwrap();
        db.set_server_event_id(uuid, sid, EventState::Applied)
            .await
            .unwrap();
    }

    let dead = db.files_with_delete_head_before(5).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, fa);

    // trimming below 6 removes b1/b2 but never the head b3
    let trimmed = db.take_events_before(6).await.unwrap();
    let trimmed_uuids: Vec<_> = trimmed.iter().map(|e| e.uuid.as_str()).collect();
    assert!(trimmed_uuids.contains(&"b1"));
    assert!(trimmed_uuids.contains(&"b2"));
    assert!(!trimmed_uuids.contains(&"b3"));

    let remaining = db.events_for_file(fb).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].uuid, "b3");
}

#[tokio::test]
async fn find_file_by_hash_skips_excluded() {
    let db = Database::in_memory().await.unwrap();
    let mut f = new_file("one.bin", false);
    f.file_hash = Some("shared-hash".to_string());
    db.insert_file(&f).await.unwrap();
    db.set_subtree_excluded("one.bin", true).await.unwrap();

    assert!(db.find_file_by_hash("shared-hash").await.unwrap().is_none());

    let mut g = new_file("two.bin", false);
    g.file_hash = Some("shared-hash".to_string());
    db.insert_file(&g).await.unwrap();

    let found = db.find_file_by_hash("shared-hash").await.unwrap().unwrap();
    assert_eq!(found.relative_path, "two.bin");
}

#[tokio::test]
async fn files_by_diff_uuid_distinguishes_direct_and_reverse() {
    let db = Database::in_memory().await.unwrap();
    let fid = db.insert_file(&new_file("p.txt", false)).await.unwrap();

    let mut ev = new_event(fid, "ev-d", EventType::Update);
    ev.diff_file_uuid = Some("patch-1".to_string());
    db.insert_event(&ev).await.unwrap();

    let mut ev = new_event(fid, "ev-r", EventType::Update);
    ev.rev_diff_file_uuid = Some("patch-2".to_string());
    db.insert_event(&ev).await.unwrap();

    assert_eq!(db.files_by_diff_uuid("patch-1", true).await.unwrap().len(), 1);
    assert_eq!(db.files_by_diff_uuid("patch-2", true).await.unwrap().len(), 0);
    assert_eq!(
        db.files_by_diff_uuid("patch-2", false).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn max_server_event_id_tracks_registrations() {
    let db = Database::in_memory().await.unwrap();
    assert_eq!(db.max_server_event_id().await.unwrap(), None);

    let fid = db.insert_file(&new_file("f", false)).await.unwrap();
    db.insert_event(&new_event(fid, "e1", EventType::Create))
        .await
        .unwrap();
    db.set_server_event_id("e1", 17, EventState::Applied)
        .await
        .unwrap();

    assert_eq!(db.max_server_event_id().await.unwrap(), Some(17));
}

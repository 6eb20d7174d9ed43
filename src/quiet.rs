//! Quiet application of remote decisions to the filesystem
//!
//! Every mutation marks its paths in the shared [`QuietPaths`] set first, so
//! the monitor tags the resulting raw events quiet and they reconcile state
//! without being re-registered. Operations are idempotent where the remote
//! log can replay them: deleting an absent file succeeds, re-applying a patch
//! reports [`ApplyError::AlreadyPatched`], and a move whose destination
//! already exists with the source gone counts as done.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::copies::CopiesStore;
use crate::db::{Database, NewFile};
use crate::error::{ApplyError, Error, Result};
use crate::monitor::QuietPaths;
use crate::rsync;
use crate::types::EMPTY_FILE_HASH;

/// Applies remote mutations to disk without re-triggering local events
pub struct QuietProcessor {
    root: PathBuf,
    db: Arc<Database>,
    copies: Arc<CopiesStore>,
    patches_dir: PathBuf,
    signatures_dir: PathBuf,
    quiet_paths: QuietPaths,
}

impl QuietProcessor {
    /// Create a processor over the given root and stores
    pub fn new(
        root: PathBuf,
        db: Arc<Database>,
        copies: Arc<CopiesStore>,
        patches_dir: PathBuf,
        signatures_dir: PathBuf,
        quiet_paths: QuietPaths,
    ) -> Self {
        Self {
            root,
            db,
            copies,
            patches_dir,
            signatures_dir,
            quiet_paths,
        }
    }

    fn abs(&self, rel: &Path) -> PathBuf {
        self.root.join(rel)
    }

    /// Delete a file; deleting an absent file is a no-op
    pub async fn delete_file(&self, rel_path: &Path) -> Result<()> {
        self.quiet_paths.mark(rel_path);
        let full = self.abs(rel_path);

        if full.exists() {
            std::fs::remove_file(&full).map_err(|e| access_denied(e, rel_path))?;
            debug!(path = %rel_path.display(), "deleted file quietly");
        }

        if let Some(record) = self.db.get_file_by_path(&path_str(rel_path)).await? {
            if let Some(hash) = &record.file_hash {
                self.copies
                    .remove_copy_reference(hash, &format!("quiet delete {}", rel_path.display()), false)
                    .await?;
            }
            self.db.delete_file(record.id).await?;
        }
        Ok(())
    }

    /// Delete a directory tree; an absent directory is a no-op
    ///
    /// A permission failure falls back to renaming the tree into the hidden
    /// state directory so the sync view stays consistent.
    pub async fn delete_directory(&self, rel_path: &Path) -> Result<()> {
        self.quiet_paths.mark(rel_path);
        let full = self.abs(rel_path);

        if full.exists() {
            if let Err(e) = std::fs::remove_dir_all(&full) {
                if e.kind() != std::io::ErrorKind::PermissionDenied {
                    return Err(e.into());
                }
                let trash = self
                    .patches_dir
                    .parent()
                    .unwrap_or(&self.root)
                    .join(format!(".trash_{}", uuid::Uuid::new_v4()));
                warn!(path = %rel_path.display(), "delete denied, hiding directory instead");
                std::fs::rename(&full, &trash).map_err(|e| access_denied(e, rel_path))?;
            }
            debug!(path = %rel_path.display(), "deleted directory quietly");
        }

        let deleted = self.db.delete_subtree(&path_str(rel_path)).await?;
        for record in &deleted {
            if let Some(hash) = &record.file_hash {
                self.copies
                    .remove_copy_reference(
                        hash,
                        &format!("quiet rmdir {}", rel_path.display()),
                        false,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Remove a subtree's materialized content while keeping its records
    ///
    /// Used when a directory is excluded: history survives in storage, the
    /// bytes on disk and the records' content references do not.
    pub async fn delete_directory_files_only(&self, rel_path: &Path) -> Result<()> {
        self.quiet_paths.mark(rel_path);

        let records = self.db.list_subtree(&path_str(rel_path)).await?;
        for record in &records {
            if record.is_folder {
                continue;
            }
            if let Some(hash) = &record.file_hash {
                self.copies
                    .remove_copy_reference(
                        hash,
                        &format!("exclude {}", rel_path.display()),
                        false,
                    )
                    .await?;
            }
        }

        let full = self.abs(rel_path);
        if full.exists() {
            if let Err(e) = std::fs::remove_dir_all(&full) {
                if e.kind() != std::io::ErrorKind::PermissionDenied {
                    return Err(e.into());
                }
                let trash = self
                    .patches_dir
                    .parent()
                    .unwrap_or(&self.root)
                    .join(format!(".trash_{}", uuid::Uuid::new_v4()));
                warn!(path = %rel_path.display(), "delete denied, hiding directory instead");
                std::fs::rename(&full, &trash).map_err(|e| access_denied(e, rel_path))?;
            }
        }
        Ok(())
    }

    /// Create a directory and register its remote identity
    pub async fn create_directory(&self, rel_path: &Path, events_file_id: i64) -> Result<()> {
        self.quiet_paths.mark(rel_path);
        let full = self.abs(rel_path);
        std::fs::create_dir_all(&full).map_err(|e| access_denied(e, rel_path))?;

        match self.db.get_file_by_path(&path_str(rel_path)).await? {
            Some(record) => match record.events_file_id {
                Some(existing) if existing != events_file_id => {
                    return Err(Error::Apply(ApplyError::WrongFileId {
                        expected: Some(events_file_id),
                        actual: Some(existing),
                    }));
                }
                Some(_) => {}
                None => self.db.set_events_file_id(record.id, events_file_id).await?,
            },
            None => {
                self.db
                    .insert_file(&NewFile {
                        relative_path: path_str(rel_path),
                        is_folder: true,
                        file_hash: None,
                        mtime: now(),
                        size: 0,
                        events_file_id: Some(events_file_id),
                    })
                    .await?;
            }
        }
        debug!(path = %rel_path.display(), events_file_id, "created directory quietly");
        Ok(())
    }

    /// Materialize a file from a content-addressed copy
    ///
    /// When the blob is absent, [`Self::make_copy_from_existing_files`] tries
    /// to reconstruct it from any tracked file carrying the same hash before
    /// giving up with [`ApplyError::CopyDoesNotExist`].
    pub async fn create_file_from_copy(
        &self,
        rel_path: &Path,
        copy_hash: &str,
        events_file_id: Option<i64>,
    ) -> Result<()> {
        if copy_hash == EMPTY_FILE_HASH {
            return self.create_empty_file(rel_path, events_file_id).await;
        }

        let blob = self.copies.copy_path(copy_hash);
        if !blob.is_file() && !self.make_copy_from_existing_files(copy_hash).await? {
            return Err(Error::Apply(ApplyError::CopyDoesNotExist {
                hash: copy_hash.to_string(),
            }));
        }

        self.quiet_paths.mark(rel_path);
        let full = self.abs(rel_path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        rsync::copy_file_atomic(&blob, &full).map_err(|e| match e {
            Error::Io(io) if io.kind() == std::io::ErrorKind::PermissionDenied => {
                Error::Apply(ApplyError::AccessDenied {
                    path: rel_path.to_path_buf(),
                })
            }
            other => other,
        })?;

        let metadata = std::fs::metadata(&full)?;
        self.upsert_record(
            rel_path,
            Some(copy_hash),
            metadata.len() as i64,
            mtime_secs(&metadata),
            events_file_id,
        )
        .await?;
        info!(path = %rel_path.display(), hash = copy_hash, "file created from copy");
        Ok(())
    }

    /// Materialize an empty file
    pub async fn create_empty_file(
        &self,
        rel_path: &Path,
        events_file_id: Option<i64>,
    ) -> Result<()> {
        self.quiet_paths.mark(rel_path);
        let full = self.abs(rel_path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&full, b"").map_err(|e| access_denied(e, rel_path))?;

        let metadata = std::fs::metadata(&full)?;
        self.upsert_record(
            rel_path,
            Some(EMPTY_FILE_HASH),
            0,
            mtime_secs(&metadata),
            events_file_id,
        )
        .await?;
        Ok(())
    }

    /// Apply a patch archive to a tracked file
    ///
    /// The on-disk content must carry the patch's `old_hash`; applying a
    /// patch whose result is already present raises
    /// [`ApplyError::AlreadyPatched`], which callers swallow.
    pub async fn patch_file(&self, rel_path: &Path, patch_uuid: &str) -> Result<String> {
        let record = self
            .db
            .get_file_by_path(&path_str(rel_path))
            .await?
            .ok_or_else(|| {
                Error::Apply(ApplyError::FileNotFound {
                    path: rel_path.to_path_buf(),
                })
            })?;

        self.quiet_paths.mark(rel_path);
        let archive = self.patches_dir.join(patch_uuid);
        let full = self.abs(rel_path);
        let staging = self.patches_dir.clone();
        let copies_dir = self.copies.copies_dir().to_path_buf();
        let known_old_hash = record.file_hash.clone();

        let applied = tokio::task::spawn_blocking(move || {
            rsync::accept_patch(
                &archive,
                &full,
                &staging,
                &copies_dir,
                known_old_hash.as_deref(),
            )
        })
        .await
        .map_err(|e| Error::Other(format!("patch task failed: {e}")))??;

        let metadata = std::fs::metadata(self.abs(rel_path))?;
        rsync::save_signature(&self.signatures_dir, &applied.new_hash, &applied.signature)?;
        self.copies
            .add_copy_reference(
                &applied.new_hash,
                &format!("quiet patch {}", rel_path.display()),
                false,
            )
            .await?;
        if let Some(old) = &record.file_hash {
            self.copies
                .remove_copy_reference(old, &format!("quiet patch {}", rel_path.display()), false)
                .await?;
        }
        self.db
            .update_file_content(
                record.id,
                Some(&applied.new_hash),
                mtime_secs(&metadata),
                metadata.len() as i64,
                true,
            )
            .await?;

        info!(path = %rel_path.display(), new_hash = %applied.new_hash, "patch applied quietly");
        Ok(applied.new_hash)
    }

    /// Move a file; a move whose dst exists and src is gone counts as done
    pub async fn move_file(
        &self,
        src_rel: &Path,
        dst_rel: &Path,
        events_file_id: Option<i64>,
    ) -> Result<()> {
        self.quiet_paths.mark(src_rel);
        self.quiet_paths.mark(dst_rel);

        let src = self.abs(src_rel);
        let dst = self.abs(dst_rel);

        if !src.exists() && dst.exists() {
            debug!(src = %src_rel.display(), dst = %dst_rel.display(), "move already done");
        } else {
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&src, &dst).map_err(|e| access_denied(e, src_rel))?;
        }

        if let Some(record) = self.db.get_file_by_path(&path_str(src_rel)).await? {
            if let (Some(expected), Some(actual)) = (events_file_id, record.events_file_id)
                && expected != actual
            {
                return Err(Error::Apply(ApplyError::WrongFileId {
                    expected: Some(expected),
                    actual: Some(actual),
                }));
            }
            self.db.rename_file(record.id, &path_str(dst_rel)).await?;
        }
        Ok(())
    }

    /// Move a directory, rewriting every descendant path in storage
    pub async fn move_directory(&self, src_rel: &Path, dst_rel: &Path) -> Result<()> {
        self.quiet_paths.mark(src_rel);
        self.quiet_paths.mark(dst_rel);

        let src = self.abs(src_rel);
        let dst = self.abs(dst_rel);

        if !src.exists() && dst.exists() {
            debug!(src = %src_rel.display(), dst = %dst_rel.display(), "directory move already done");
        } else {
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&src, &dst).map_err(|e| access_denied(e, src_rel))?;
        }

        self.db
            .move_subtree(&path_str(src_rel), &path_str(dst_rel))
            .await?;
        Ok(())
    }

    /// Attach a remote identity to a tracked path
    pub async fn sync_events_file_id(&self, rel_path: &Path, events_file_id: i64) -> Result<()> {
        let Some(record) = self.db.get_file_by_path(&path_str(rel_path)).await? else {
            return Err(Error::Apply(ApplyError::FileNotFound {
                path: rel_path.to_path_buf(),
            }));
        };
        match record.events_file_id {
            Some(existing) if existing != events_file_id => {
                Err(Error::Apply(ApplyError::WrongFileId {
                    expected: Some(events_file_id),
                    actual: Some(existing),
                }))
            }
            Some(_) => Ok(()),
            None => self.db.set_events_file_id(record.id, events_file_id).await,
        }
    }

    /// Rebuild a missing copy blob from any tracked file with the same hash
    ///
    /// Returns true when a verified copy was materialized.
    pub async fn make_copy_from_existing_files(&self, copy_hash: &str) -> Result<bool> {
        let Some(record) = self.db.find_file_by_hash(copy_hash).await? else {
            return Ok(false);
        };
        let source = self.abs(Path::new(&record.relative_path));
        if !source.is_file() {
            return Ok(false);
        }

        let temp = self
            .copies
            .copy_path(&format!(".rebuilding_{}", uuid::Uuid::new_v4()));
        let expected = copy_hash.to_string();
        let source_clone = source.clone();
        let temp_clone = temp.clone();
        let verified = tokio::task::spawn_blocking(move || -> Result<bool> {
            std::fs::copy(&source_clone, &temp_clone)?;
            Ok(rsync::file_hash(&temp_clone)? == expected)
        })
        .await
        .map_err(|e| Error::Other(format!("copy rebuild task failed: {e}")))??;

        if !verified {
            // the tracked file changed under us; its own event will follow
            std::fs::remove_file(&temp).ok();
            debug!(hash = copy_hash, source = %record.relative_path, "rebuild candidate stale");
            return Ok(false);
        }

        std::fs::rename(&temp, self.copies.copy_path(copy_hash))?;
        info!(hash = copy_hash, source = %record.relative_path, "copy rebuilt from local file");
        Ok(true)
    }

    /// Remove signature files whose hash has no materialized copy
    pub fn delete_old_signatures(&self) -> Result<usize> {
        let mut removed = 0;
        if !self.signatures_dir.exists() {
            return Ok(0);
        }
        let live: HashSet<String> = std::fs::read_dir(self.copies.copies_dir())?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();

        for entry in std::fs::read_dir(&self.signatures_dir)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !live.contains(&name) {
                std::fs::remove_file(entry.path()).ok();
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn upsert_record(
        &self,
        rel_path: &Path,
        file_hash: Option<&str>,
        size: i64,
        mtime: i64,
        events_file_id: Option<i64>,
    ) -> Result<()> {
        // the record's reference to its content swaps from old to new
        if let Some(hash) = file_hash {
            self.copies
                .add_copy_reference(hash, &format!("record {}", rel_path.display()), false)
                .await?;
        }

        match self.db.get_file_by_path(&path_str(rel_path)).await? {
            Some(record) => {
                if let Some(old) = &record.file_hash
                    && Some(old.as_str()) != file_hash
                {
                    self.copies
                        .remove_copy_reference(old, &format!("record {}", rel_path.display()), false)
                        .await?;
                }
                self.db
                    .update_file_content(record.id, file_hash, mtime, size, false)
                    .await?;
                if let (Some(id), None) = (events_file_id, record.events_file_id) {
                    self.db.set_events_file_id(record.id, id).await?;
                }
            }
            None => {
                self.db
                    .insert_file(&NewFile {
                        relative_path: path_str(rel_path),
                        is_folder: false,
                        file_hash: file_hash.map(str::to_string),
                        mtime,
                        size,
                        events_file_id,
                    })
                    .await?;
            }
        }
        Ok(())
    }
}

fn access_denied(e: std::io::Error, path: &Path) -> Error {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        Error::Apply(ApplyError::AccessDenied {
            path: path.to_path_buf(),
        })
    } else {
        Error::Io(e)
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn mtime_secs(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        db: Arc<Database>,
        copies: Arc<CopiesStore>,
        quiet_paths: QuietPaths,
        processor: QuietProcessor,
    }

    async fn fixture() -> Fixture {
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
        let quiet_paths = QuietPaths::new();
        let processor = QuietProcessor::new(
            root.clone(),
            Arc::clone(&db),
            Arc::clone(&copies),
            state.join("patches"),
            state.join("signatures"),
            quiet_paths.clone(),
        );
        std::fs::create_dir_all(state.join("patches")).unwrap();

        Fixture {
            _dir: dir,
            root,
            db,
            copies,
            quiet_paths,
            processor,
        }
    }

    #[tokio::test]
    async fn create_file_from_copy_materializes_and_marks_quiet() {
        let f = fixture().await;
        let content = b"copied content";
        let hash = "0123456789abcdef0123456789abcdef";
        std::fs::write(f.copies.copy_path(hash), content).unwrap();

        f.processor
            .create_file_from_copy(Path::new("restored.txt"), hash, Some(9))
            .await
            .unwrap();

        assert_eq!(std::fs::read(f.root.join("restored.txt")).unwrap(), content);
        assert!(f.quiet_paths.take(Path::new("restored.txt")), "path marked quiet");

        let record = f.db.get_file_by_path("restored.txt").await.unwrap().unwrap();
        assert_eq!(record.file_hash.as_deref(), Some(hash));
        assert_eq!(record.events_file_id, Some(9));
        assert_eq!(f.copies.refcount(hash).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn create_from_missing_copy_rebuilds_from_tracked_file() {
        let f = fixture().await;
        let content = b"shared bytes across two paths";
        std::fs::write(f.root.join("origin.txt"), content).unwrap();
        let hash = rsync::file_hash(&f.root.join("origin.txt")).unwrap();

        f.db
            .insert_file(&NewFile {
                relative_path: "origin.txt".to_string(),
                is_folder: false,
                file_hash: Some(hash.clone()),
                mtime: 1,
                size: content.len() as i64,
                events_file_id: None,
            })
            .await
            .unwrap();

        f.processor
            .create_file_from_copy(Path::new("clone.txt"), &hash, None)
            .await
            .unwrap();

        assert_eq!(std::fs::read(f.root.join("clone.txt")).unwrap(), content);
        assert!(f.copies.copy_path(&hash).exists(), "blob rebuilt locally");
    }

    #[tokio::test]
    async fn create_from_absent_copy_fails_typed() {
        let f = fixture().await;
        let err = f
            .processor
            .create_file_from_copy(Path::new("x.txt"), "ffffffffffffffffffffffffffffffff", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Apply(ApplyError::CopyDoesNotExist { .. })
        ));
    }

    #[tokio::test]
    async fn double_delete_is_a_noop() {
        let f = fixture().await;
        std::fs::write(f.root.join("gone.txt"), b"x").unwrap();
        f.db
            .insert_file(&NewFile {
                relative_path: "gone.txt".to_string(),
                is_folder: false,
                file_hash: None,
                mtime: 1,
                size: 1,
                events_file_id: None,
            })
            .await
            .unwrap();

        f.processor.delete_file(Path::new("gone.txt")).await.unwrap();
        assert!(!f.root.join("gone.txt").exists());

        // second delete: file and record both absent, still Ok
        f.processor.delete_file(Path::new("gone.txt")).await.unwrap();
    }

    #[tokio::test]
    async fn move_with_done_state_is_accepted() {
        let f = fixture().await;
        std::fs::write(f.root.join("dst.txt"), b"already moved").unwrap();
        f.db
            .insert_file(&NewFile {
                relative_path: "src.txt".to_string(),
                is_folder: false,
                file_hash: None,
                mtime: 1,
                size: 1,
                events_file_id: Some(42),
            })
            .await
            .unwrap();

        f.processor
            .move_file(Path::new("src.txt"), Path::new("dst.txt"), Some(42))
            .await
            .unwrap();

        let record = f.db.get_file_by_path("dst.txt").await.unwrap().unwrap();
        assert_eq!(record.events_file_id, Some(42));
    }

    #[tokio::test]
    async fn move_with_wrong_identity_is_rejected() {
        let f = fixture().await;
        std::fs::write(f.root.join("a.txt"), b"content").unwrap();
        f.db
            .insert_file(&NewFile {
                relative_path: "a.txt".to_string(),
                is_folder: false,
                file_hash: None,
                mtime: 1,
                size: 7,
                events_file_id: Some(1),
            })
            .await
            .unwrap();

        let err = f
            .processor
            .move_file(Path::new("a.txt"), Path::new("b.txt"), Some(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Apply(ApplyError::WrongFileId { .. })));
    }

    #[tokio::test]
    async fn patch_file_applies_and_swaps_references() {
        let f = fixture().await;
        let patches = f.root.join(".pvtbox/patches");

        // build old and new content plus the connecting patch
        let old_content = b"old old old old!";
        let new_content = b"new new new new!";
        std::fs::write(f.root.join("doc.txt"), old_content).unwrap();
        let scratch = f.root.join(".pvtbox");
        std::fs::write(scratch.join("newfile"), new_content).unwrap();

        let old_sig = rsync::block_signature(&f.root.join("doc.txt")).unwrap();
        let old_hash = rsync::hash_from_signature(&old_sig);
        let new_hash = rsync::file_hash(&scratch.join("newfile")).unwrap();
        rsync::create_patch(
            &scratch.join("newfile"),
            &patches,
            "patch-u",
            Some(&old_sig),
            None,
            Some(&old_hash),
            Some(&new_hash),
        )
        .unwrap();

        f.db
            .insert_file(&NewFile {
                relative_path: "doc.txt".to_string(),
                is_folder: false,
                file_hash: Some(old_hash.clone()),
                mtime: 1,
                size: old_content.len() as i64,
                events_file_id: None,
            })
            .await
            .unwrap();
        f.copies
            .add_copy_reference(&old_hash, "record", false)
            .await
            .unwrap();
        std::fs::write(f.copies.copy_path(&old_hash), old_content).unwrap();

        let result_hash = f
            .processor
            .patch_file(Path::new("doc.txt"), "patch-u")
            .await
            .unwrap();

        assert_eq!(result_hash, new_hash);
        assert_eq!(std::fs::read(f.root.join("doc.txt")).unwrap(), new_content);
        assert_eq!(f.copies.refcount(&new_hash).await.unwrap(), 1);
        assert_eq!(f.copies.refcount(&old_hash).await.unwrap(), 0);

        let record = f.db.get_file_by_path("doc.txt").await.unwrap().unwrap();
        assert_eq!(record.file_hash.as_deref(), Some(new_hash.as_str()));

        // applying the same patch again reports AlreadyPatched
        let err = f
            .processor
            .patch_file(Path::new("doc.txt"), "patch-u")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Apply(ApplyError::AlreadyPatched)));
    }

    #[tokio::test]
    async fn create_directory_attaches_identity_once() {
        let f = fixture().await;
        f.processor
            .create_directory(Path::new("shared"), 7)
            .await
            .unwrap();
        assert!(f.root.join("shared").is_dir());

        // idempotent with the same identity
        f.processor
            .create_directory(Path::new("shared"), 7)
            .await
            .unwrap();

        // conflicting identity is a typed error
        let err = f
            .processor
            .create_directory(Path::new("shared"), 8)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Apply(ApplyError::WrongFileId { .. })));
    }

    #[tokio::test]
    async fn delete_directory_releases_descendant_references() {
        let f = fixture().await;
        std::fs::create_dir_all(f.root.join("d")).unwrap();
        std::fs::write(f.root.join("d/f.bin"), b"bytes").unwrap();

        let hash = "abcdabcdabcdabcdabcdabcdabcdabcd";
        f.copies.add_copy_reference(hash, "record", false).await.unwrap();
        f.db
            .insert_file(&NewFile {
                relative_path: "d".to_string(),
                is_folder: true,
                file_hash: None,
                mtime: 1,
                size: 0,
                events_file_id: None,
            })
            .await
            .unwrap();
        f.db
            .insert_file(&NewFile {
                relative_path: "d/f.bin".to_string(),
                is_folder: false,
                file_hash: Some(hash.to_string()),
                mtime: 1,
                size: 5,
                events_file_id: None,
            })
            .await
            .unwrap();

        f.processor.delete_directory(Path::new("d")).await.unwrap();

        assert!(!f.root.join("d").exists());
        assert!(f.db.get_file_by_path("d/f.bin").await.unwrap().is_none());
        assert_eq!(f.copies.refcount(hash).await.unwrap(), 0);
    }
}

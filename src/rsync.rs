//! Block signatures, content hashes, and binary patches
//!
//! A file's *signature* is the sorted map of block offset to md5 hex digest,
//! block size 1 MiB. The *content hash* is the md5 of the concatenated block
//! digests in ascending offset order. Patches are tar archives with two
//! members: `info` (UTF-8 JSON describing blocks) and `data` (opaque bytes
//! holding the blocks that cannot be copied from the source file).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{ApplyError, Error, Result};
use crate::types::{EMPTY_FILE_HASH, SIGNATURE_BLOCK_SIZE};

/// Sorted map of block offset to md5 hex digest
pub type Signature = BTreeMap<u64, String>;

/// One block entry of a patch `info` member
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatchBlock {
    /// True when the block's bytes live in the patch `data` member
    pub new: bool,
    /// md5 hex digest of the block content
    pub hash: String,
    /// For new blocks: offset into `data`. For `from_patch` blocks: the new-file
    /// offset of the block to clone. Otherwise: offset into the source file.
    pub offset: u64,
    /// Byte length of a new block's data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_size: Option<u64>,
    /// True when the block is cloned from another block of this patch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_patch: Option<bool>,
}

/// The `info` member of a patch archive
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PatchInfo {
    /// Content hash of the file the patch applies to (None for create-from-nothing)
    pub old_hash: Option<String>,
    /// Content hash of the file the patch produces
    pub new_hash: String,
    /// Block size the signature was computed with
    pub blocksize: u64,
    /// Size in bytes of the patched result
    pub size: u64,
    /// Modification time of the file the patch was derived from (unix seconds)
    pub time_modify: i64,
    /// Blocks of the patched result keyed by offset
    pub blocks: BTreeMap<u64, PatchBlock>,
}

/// Result of creating a patch archive
#[derive(Clone, Debug)]
pub struct CreatedPatch {
    /// Path of the tar archive
    pub archive_path: PathBuf,
    /// Size of the tar archive in bytes
    pub archive_size: u64,
    /// Content hash of the patched result
    pub new_hash: String,
}

/// Result of applying a patch
#[derive(Clone, Debug)]
pub struct AppliedPatch {
    /// Content hash of the patched file
    pub new_hash: String,
    /// Signature of the patched file
    pub signature: Signature,
    /// Content hash the patch expected the source to have
    pub old_hash: Option<String>,
}

/// Compute the block signature of a file
pub fn block_signature(path: &Path) -> Result<Signature> {
    block_signature_with(path, SIGNATURE_BLOCK_SIZE)
}

pub(crate) fn block_signature_with(path: &Path, blocksize: u64) -> Result<Signature> {
    let mut file = File::open(path)?;
    let mut signature = Signature::new();
    let mut buf = vec![0u8; blocksize as usize];
    let mut offset = 0u64;

    loop {
        let read = read_full(&mut file, &mut buf)?;
        if read == 0 {
            break;
        }
        signature.insert(offset, format!("{:x}", md5::compute(&buf[..read])));
        offset += read as u64;
        if read < blocksize as usize {
            break;
        }
    }

    Ok(signature)
}

/// Derive the content hash from a block signature
#[must_use]
pub fn hash_from_signature(signature: &Signature) -> String {
    if signature.is_empty() {
        return EMPTY_FILE_HASH.to_string();
    }
    let mut context = md5::Context::new();
    for digest in signature.values() {
        context.consume(digest.as_bytes());
    }
    format!("{:x}", context.compute())
}

/// Compute a file's content hash (signature-derived)
pub fn file_hash(path: &Path) -> Result<String> {
    Ok(hash_from_signature(&block_signature(path)?))
}

/// Create a patch archive transforming `old` content into the content of `modify_file`
///
/// `old_signature` enables block reuse from the source file; without it every
/// block is carried in `data`. The archive lands at `<patches_dir>/<uuid>`.
pub fn create_patch(
    modify_file: &Path,
    patches_dir: &Path,
    uuid: &str,
    old_signature: Option<&Signature>,
    new_signature: Option<Signature>,
    old_hash: Option<&str>,
    new_hash: Option<&str>,
) -> Result<CreatedPatch> {
    create_patch_with(
        modify_file,
        patches_dir,
        uuid,
        old_signature,
        new_signature,
        old_hash,
        new_hash,
        SIGNATURE_BLOCK_SIZE,
    )
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn create_patch_with(
    modify_file: &Path,
    patches_dir: &Path,
    uuid: &str,
    old_signature: Option<&Signature>,
    new_signature: Option<Signature>,
    old_hash: Option<&str>,
    new_hash: Option<&str>,
    blocksize: u64,
) -> Result<CreatedPatch> {
    fs::create_dir_all(patches_dir)?;

    let stem = format!(
        "{}{}",
        old_hash.unwrap_or("none"),
        new_hash.unwrap_or("pending")
    );
    let data_path = patches_dir.join(format!("{stem}.patch_data"));
    let info_path = patches_dir.join(format!("{stem}.patch_info"));

    let new_signature = match new_signature {
        Some(s) => s,
        None => block_signature_with(modify_file, blocksize)?,
    };

    let old_search: BTreeMap<&str, u64> = old_signature
        .map(|sig| sig.iter().map(|(off, hash)| (hash.as_str(), *off)).collect())
        .unwrap_or_default();

    let mut blocks: BTreeMap<u64, PatchBlock> = BTreeMap::new();
    let mut new_search: BTreeMap<&str, u64> = BTreeMap::new();

    {
        let mut source = File::open(modify_file)?;
        let mut data_file = File::create(&data_path)?;
        let mut data_offset = 0u64;

        for (new_offset, block_hash) in &new_signature {
            if let Some(clone_offset) = new_search.get(block_hash.as_str()) {
                blocks.insert(
                    *new_offset,
                    PatchBlock {
                        new: false,
                        hash: block_hash.clone(),
                        offset: *clone_offset,
                        data_size: None,
                        from_patch: Some(true),
                    },
                );
            } else if let Some(old_offset) = old_search.get(block_hash.as_str()) {
                blocks.insert(
                    *new_offset,
                    PatchBlock {
                        new: false,
                        hash: block_hash.clone(),
                        offset: *old_offset,
                        data_size: None,
                        from_patch: Some(false),
                    },
                );
            } else {
                source.seek(SeekFrom::Start(*new_offset))?;
                let mut buf = vec![0u8; blocksize as usize];
                let read = read_full(&mut source, &mut buf)?;
                data_file.write_all(&buf[..read])?;
                blocks.insert(
                    *new_offset,
                    PatchBlock {
                        new: true,
                        hash: block_hash.clone(),
                        offset: data_offset,
                        data_size: Some(read as u64),
                        from_patch: None,
                    },
                );
                data_offset += read as u64;
                new_search.insert(block_hash.as_str(), *new_offset);
            }
        }
        data_file.flush()?;
    }

    let metadata = fs::metadata(modify_file)?;
    let resolved_new_hash = match new_hash {
        Some(h) => h.to_string(),
        None => hash_from_signature(&new_signature),
    };

    let patch_info = PatchInfo {
        old_hash: old_hash.map(str::to_string),
        new_hash: resolved_new_hash.clone(),
        blocksize,
        size: metadata.len(),
        time_modify: mtime_secs(&metadata),
        blocks,
    };
    fs::write(&info_path, serde_json::to_vec(&patch_info)?)?;

    let archive_path = patches_dir.join(uuid);
    {
        let archive_file = File::create(&archive_path)?;
        let mut builder = tar::Builder::new(archive_file);
        builder.append_path_with_name(&info_path, "info")?;
        builder.append_path_with_name(&data_path, "data")?;
        builder.into_inner()?.flush()?;
    }
    fs::remove_file(&info_path).ok();
    fs::remove_file(&data_path).ok();

    let archive_size = fs::metadata(&archive_path)?.len();
    info!(
        uuid,
        size = archive_size,
        new_hash = %resolved_new_hash,
        "patch created"
    );

    Ok(CreatedPatch {
        archive_path,
        archive_size,
        new_hash: resolved_new_hash,
    })
}

/// Apply a patch archive to `unpatched_file` in place
///
/// `known_old_hash` is the hash of the current on-disk content. When it equals
/// the patch's `new_hash` the patch was already applied and
/// [`ApplyError::AlreadyPatched`] is returned; when it differs from the
/// patch's `old_hash` the patch targets a different file.
///
/// On success the patched content also lands in `copies_dir` under its hash.
pub fn accept_patch(
    patch_archive: &Path,
    unpatched_file: &Path,
    staging_dir: &Path,
    copies_dir: &Path,
    known_old_hash: Option<&str>,
) -> Result<AppliedPatch> {
    info!(archive = %patch_archive.display(), target = %unpatched_file.display(), "accepting patch");

    let (patch_info, data_path) = unpack_archive(patch_archive, staging_dir)?;
    let result = (|| {
        if patch_info.new_hash == known_old_hash.unwrap_or_default() {
            return Err(Error::Apply(ApplyError::AlreadyPatched));
        }
        if patch_info.old_hash.as_deref() != known_old_hash {
            return Err(Error::Apply(ApplyError::PatchSourceMismatch {
                expected: patch_info.old_hash.clone(),
                actual: known_old_hash.map(str::to_string),
            }));
        }
        rebuild(&patch_info, &data_path, unpatched_file, staging_dir, copies_dir)
    })();
    fs::remove_file(&data_path).ok();
    result
}

/// Read the `info` member of a patch archive without applying it
pub fn read_patch_info(patch_archive: &Path) -> Result<PatchInfo> {
    let file = File::open(patch_archive)?;
    let mut archive = tar::Archive::new(file);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.as_ref() == Path::new("info") {
            let mut raw = String::new();
            entry.read_to_string(&mut raw)?;
            return Ok(serde_json::from_str(&raw)?);
        }
    }
    Err(Error::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        "invalid patch archive: no info member",
    )))
}

fn unpack_archive(patch_archive: &Path, staging_dir: &Path) -> Result<(PatchInfo, PathBuf)> {
    fs::create_dir_all(staging_dir)?;
    let file = File::open(patch_archive)?;
    let mut archive = tar::Archive::new(file);

    let mut patch_info: Option<PatchInfo> = None;
    let data_path = staging_dir.join(format!(".patch_data_{}", uuid::Uuid::new_v4()));
    let mut data_found = false;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.into_owned();
        if name == Path::new("info") {
            debug!("extracting patch info");
            let mut raw = String::new();
            entry.read_to_string(&mut raw)?;
            patch_info = Some(serde_json::from_str(&raw)?);
        } else if name == Path::new("data") {
            debug!("extracting patch data");
            let mut out = File::create(&data_path)?;
            io::copy(&mut entry, &mut out)?;
            data_found = true;
        }
    }

    match (patch_info, data_found) {
        (Some(info), true) => Ok((info, data_path)),
        _ => {
            fs::remove_file(&data_path).ok();
            Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid patch archive: missing info or data member",
            )))
        }
    }
}

fn rebuild(
    patch_info: &PatchInfo,
    data_path: &Path,
    unpatched_file: &Path,
    staging_dir: &Path,
    copies_dir: &Path,
) -> Result<AppliedPatch> {
    let temp_path = staging_dir.join(format!(".patching_{}", uuid::Uuid::new_v4()));
    let mut data_file = File::open(data_path)?;
    let mut source_file = if unpatched_file.exists() {
        Some(File::open(unpatched_file)?)
    } else {
        None
    };

    let mut expected_signature = Signature::new();
    {
        let mut temp_file = File::create(&temp_path)?;
        for (offset, block) in &patch_info.blocks {
            let data = if block.new {
                let size = block.data_size.unwrap_or(patch_info.blocksize);
                read_at(&mut data_file, block.offset, size as usize)?
            } else if block.from_patch == Some(true) {
                let origin = patch_info.blocks.get(&block.offset).ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("patch block at {offset} clones unknown block {}", block.offset),
                    )
                })?;
                let size = origin.data_size.unwrap_or(patch_info.blocksize);
                read_at(&mut data_file, origin.offset, size as usize)?
            } else {
                let source = source_file.as_mut().ok_or(ApplyError::FileNotFound {
                    path: unpatched_file.to_path_buf(),
                })?;
                read_at(source, block.offset, patch_info.blocksize as usize)?
            };
            temp_file.seek(SeekFrom::Start(*offset))?;
            temp_file.write_all(&data)?;
            expected_signature.insert(*offset, block.hash.clone());
        }
        temp_file.flush()?;
    }

    debug!("verifying patched file signature");
    let actual_signature = block_signature_with(&temp_path, patch_info.blocksize)?;
    if actual_signature != expected_signature {
        fs::remove_file(&temp_path).ok();
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            "patch produced content with an unexpected signature",
        )));
    }

    fs::create_dir_all(copies_dir)?;
    let copy_path = copies_dir.join(&patch_info.new_hash);
    if !copy_path.exists() {
        fs::copy(&temp_path, &copy_path)?;
    }
    fs::rename(&temp_path, unpatched_file)?;
    debug!("moved patched file into place");

    Ok(AppliedPatch {
        new_hash: patch_info.new_hash.clone(),
        signature: expected_signature,
        old_hash: patch_info.old_hash.clone(),
    })
}

fn read_at(file: &mut File, offset: u64, size: usize) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; size];
    let read = read_full(file, &mut buf)?;
    buf.truncate(read);
    Ok(buf)
}

// Reads until the buffer is full or EOF; plain read() may return short.
fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn mtime_secs(metadata: &fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Write a signature to `signatures_dir/<hash>` as JSON
pub fn save_signature(signatures_dir: &Path, hash: &str, signature: &Signature) -> Result<()> {
    fs::create_dir_all(signatures_dir)?;
    fs::write(
        signatures_dir.join(hash),
        serde_json::to_vec(signature)?,
    )?;
    Ok(())
}

/// Load a signature from `signatures_dir/<hash>`, if present
pub fn load_signature(signatures_dir: &Path, hash: &str) -> Result<Option<Signature>> {
    let path = signatures_dir.join(hash);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read(path)?;
    Ok(Some(serde_json::from_slice(&raw)?))
}

/// Copy `src` into `dst` atomically via a staging file next to `dst`
pub fn copy_file_atomic(src: &Path, dst: &Path) -> Result<()> {
    let staging = dst.with_extension(format!("staging_{}", std::process::id()));
    fs::copy(src, &staging)?;
    match fs::rename(&staging, dst) {
        Ok(()) => Ok(()),
        Err(e) => {
            fs::remove_file(&staging).ok();
            Err(e.into())
        }
    }
}

/// Open options helper for the download file (read+write without truncation)
pub fn open_rw(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

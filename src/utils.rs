//! Utility functions for path filtering and disk space checking

use std::path::{Component, Path, PathBuf};

use crate::types::{SIGNATURE_BLOCK_SIZE, STATE_DIR_NAME};

/// File names the monitor never synchronizes
const HIDDEN_FILES: &[&str] = &["desktop.ini", ".DS_Store", "Icon\r", ".directory"];

/// Check whether a single path component is hidden from synchronization
///
/// Matches the fixed hidden-file set plus the `._*` resource-fork prefix and
/// the engine's own state directory.
#[must_use]
pub fn is_hidden_name(name: &str) -> bool {
    name == STATE_DIR_NAME || name.starts_with("._") || HIDDEN_FILES.contains(&name)
}

/// Check whether any component of a root-relative path is hidden
#[must_use]
pub fn is_hidden_path(rel_path: &Path) -> bool {
    rel_path.components().any(|c| match c {
        Component::Normal(name) => name.to_str().is_some_and(is_hidden_name),
        _ => false,
    })
}

/// Check whether a root-relative path lies inside one of the given directories
#[must_use]
pub fn is_in_dirs(rel_path: &Path, dirs: &[PathBuf]) -> bool {
    dirs.iter()
        .any(|dir| rel_path == dir || rel_path.starts_with(dir))
}

/// Strip the sync root from an absolute path
///
/// Returns `None` when the path does not lie under the root.
#[must_use]
pub fn relative_to_root(path: &Path, root: &Path) -> Option<PathBuf> {
    path.strip_prefix(root).ok().map(Path::to_path_buf)
}

/// True when one path is the other or an ancestor of it
///
/// Used by the pipeline to refuse dispatching an event whose path overlaps a
/// path currently being processed.
#[must_use]
pub fn paths_overlap(a: &Path, b: &Path) -> bool {
    a == b || a.starts_with(b) || b.starts_with(a)
}

/// Estimated on-disk size of the signature file for content of the given size
///
/// Signatures are JSON maps of block offset to md5 hex; one entry costs the
/// offset digits, the 32-char digest, and JSON punctuation. 64 bytes per
/// block is a safe upper bound used by the download disk-space check.
#[must_use]
pub fn signature_file_size(content_size: u64) -> u64 {
    let blocks = content_size.div_ceil(SIGNATURE_BLOCK_SIZE).max(1);
    blocks * 64 + 2
}

/// Get available disk space for a given path
///
/// Uses platform-specific APIs to query filesystem statistics:
/// - Unix: statvfs
/// - Windows: GetDiskFreeSpaceExW
pub fn get_available_space(path: &Path) -> std::io::Result<u64> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: c_path is a valid null-terminated C string, stat is zeroed
        // before the call, and the struct is only read after success.
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(std::io::Error::last_os_error());
            }

            // f_bavail is blocks available to unprivileged users,
            // f_frsize the fragment size.
            let available_bytes = stat.f_bavail.saturating_mul(stat.f_frsize);
            Ok(available_bytes)
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::fileapi::GetDiskFreeSpaceExW;

        let wide_path: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        // SAFETY: wide_path is null-terminated and the output pointers are
        // valid aligned u64 variables read only after success.
        unsafe {
            let mut free_bytes_available: u64 = 0;
            let mut _total_bytes: u64 = 0;
            let mut _total_free_bytes: u64 = 0;

            if GetDiskFreeSpaceExW(
                wide_path.as_ptr(),
                &mut free_bytes_available as *mut u64 as *mut _,
                &mut _total_bytes as *mut u64 as *mut _,
                &mut _total_free_bytes as *mut u64 as *mut _,
            ) == 0
            {
                return Err(std::io::Error::last_os_error());
            }

            Ok(free_bytes_available)
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "Disk space checking is not supported on this platform",
        ))
    }
}

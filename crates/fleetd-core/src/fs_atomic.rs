//! Atomic file I/O for agent state.
//!
//! Everything the agent persists (access key, device id, last-known-good
//! bundle) goes through these helpers:
//!
//! 1. [`atomic_write`] / [`atomic_write_with_mode`]: write to a temp file in
//!    the same directory, fsync the data, rename to the final path, then
//!    fsync the parent directory. A crash at any point leaves either the old
//!    complete file or the new complete file, never a partial write.
//! 2. [`read_optional`]: bounded read that treats an absent file as `None`
//!    so fresh devices and corrupt-state recovery share one code path.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

/// Maximum size for any single state file read.
///
/// 16 MiB is generous for JSON state files while still bounding the
/// allocation a corrupt or adversarial file can force.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 16 * 1024 * 1024;

/// Errors from atomic filesystem operations.
#[derive(Debug, thiserror::Error)]
pub enum FsAtomicError {
    /// The final path has no parent directory (cannot create temp file).
    #[error("path has no parent directory: {}", path.display())]
    NoParentDirectory {
        /// Path with no parent.
        path: std::path::PathBuf,
    },

    /// File exceeds the configured size cap.
    #[error("file too large: {size} bytes exceeds maximum of {max} bytes")]
    FileTooLarge {
        /// Actual file size in bytes.
        size: u64,
        /// Maximum allowed size in bytes.
        max: u64,
    },

    /// An I/O error occurred during the operation.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Human-readable description of the operation that failed.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl FsAtomicError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Creates `dir` (and missing parents) with 0700 permissions.
///
/// # Errors
///
/// Returns [`FsAtomicError`] if the directory cannot be created.
pub fn ensure_dir(dir: &Path) -> Result<(), FsAtomicError> {
    if dir.exists() {
        return Ok(());
    }

    fs::create_dir_all(dir).map_err(|e| FsAtomicError::io("create directory", e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
            .map_err(|e| FsAtomicError::io("set directory permissions", e))?;
    }

    Ok(())
}

/// Writes `data` to `path` atomically with 0600 permissions.
///
/// # Errors
///
/// Returns [`FsAtomicError`] if any filesystem operation fails.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), FsAtomicError> {
    atomic_write_inner(path, data, None)
}

/// Writes `data` to `path` atomically and then sets `mode` on the result.
///
/// # Errors
///
/// Returns [`FsAtomicError`] if any filesystem operation fails.
pub fn atomic_write_with_mode(path: &Path, data: &[u8], mode: u32) -> Result<(), FsAtomicError> {
    atomic_write_inner(path, data, Some(mode))
}

fn atomic_write_inner(path: &Path, data: &[u8], mode: Option<u32>) -> Result<(), FsAtomicError> {
    let parent = path
        .parent()
        .ok_or_else(|| FsAtomicError::NoParentDirectory {
            path: path.to_path_buf(),
        })?;

    ensure_dir(parent)?;

    // Temp file in the same directory: same filesystem, so the rename below
    // is atomic. NamedTempFile defaults to 0600.
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| FsAtomicError::io("create temp file", e))?;

    tmp.write_all(data)
        .map_err(|e| FsAtomicError::io("write to temp file", e))?;

    tmp.flush()
        .map_err(|e| FsAtomicError::io("flush temp file", e))?;

    tmp.as_file()
        .sync_all()
        .map_err(|e| FsAtomicError::io("fsync temp file", e))?;

    tmp.persist(path)
        .map_err(|e| FsAtomicError::io("atomic rename to final path", e.error))?;

    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|e| FsAtomicError::io("set file permissions", e))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    // fsync the parent directory so the rename itself is durable.
    fsync_directory(parent)?;

    Ok(())
}

fn fsync_directory(dir: &Path) -> Result<(), FsAtomicError> {
    let handle = File::open(dir).map_err(|e| FsAtomicError::io("open parent directory", e))?;
    handle
        .sync_all()
        .map_err(|e| FsAtomicError::io("fsync parent directory", e))?;
    Ok(())
}

/// Reads `path` in full, bounded by [`DEFAULT_MAX_FILE_SIZE`].
///
/// Returns `Ok(None)` if the file does not exist.
///
/// # Errors
///
/// Returns [`FsAtomicError::FileTooLarge`] if the file exceeds the size cap,
/// or an I/O error for any other failure.
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, FsAtomicError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(FsAtomicError::io("open file", e)),
    };

    let size = file
        .metadata()
        .map_err(|e| FsAtomicError::io("read file metadata", e))?
        .len();
    if size > DEFAULT_MAX_FILE_SIZE {
        return Err(FsAtomicError::FileTooLarge {
            size,
            max: DEFAULT_MAX_FILE_SIZE,
        });
    }

    #[allow(clippy::cast_possible_truncation)] // bounded by the size cap above
    let mut contents = Vec::with_capacity(size as usize);
    file.read_to_end(&mut contents)
        .map_err(|e| FsAtomicError::io("read file", e))?;

    Ok(Some(contents))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");

        atomic_write(&path, b"first").unwrap();
        assert_eq!(read_optional(&path).unwrap().unwrap(), b"first");

        atomic_write(&path, b"second").unwrap();
        assert_eq!(read_optional(&path).unwrap().unwrap(), b"second");
    }

    #[test]
    fn test_read_optional_absent_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_optional(&dir.path().join("missing")).unwrap().is_none());
    }

    #[test]
    fn test_atomic_write_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/state");
        atomic_write(&path, b"nested").unwrap();
        assert_eq!(read_optional(&path).unwrap().unwrap(), b"nested");
    }

    #[cfg(unix)]
    #[test]
    fn test_atomic_write_with_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle");
        atomic_write_with_mode(&path, b"{}", 0o644).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        atomic_write(&path, b"data").unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("state")]);
    }
}

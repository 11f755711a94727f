//! Filesystem helpers for the PID file, address file and socket directory.
//!
//! # Security Considerations
//!
//! - Files are written to a temp file in the target directory, synced and
//!   renamed, so readers never see a partial PID or address
//! - Directories created here get mode 0700; existing directories are left
//!   untouched
//! - Symlinked directories and non-file targets are refused

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{DaemonError, DaemonResult};

/// Permissions of directories this module creates.
pub const DIRECTORY_MODE: u32 = 0o700;

/// Permissions of files this module writes.
pub const FILE_MODE: u32 = 0o644;

/// Ensures `path` is a directory, creating it with [`DIRECTORY_MODE`].
pub fn ensure_directory(path: &Path) -> DaemonResult<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) => {
            if metadata.file_type().is_symlink() {
                return Err(DaemonError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} is a symlink, refusing to use it", path.display()),
                )));
            }
            if !metadata.is_dir() {
                return Err(DaemonError::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists but is not a directory", path.display()),
                )));
            }
            Ok(())
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let mut builder = fs::DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::DirBuilderExt;
                builder.mode(DIRECTORY_MODE);
            }
            builder
                .create(path)
                .map_err(|e| DaemonError::io_context(&e, format!("creating {}", path.display())))?;
            debug!(path = %path.display(), "created directory");
            Ok(())
        },
        Err(e) => Err(DaemonError::io_context(&e, format!("stat {}", path.display()))),
    }
}

/// Writes `data` to `target` atomically: temp file, fsync, rename.
pub fn atomic_write(target: &Path, data: &[u8]) -> DaemonResult<()> {
    if let Ok(metadata) = fs::symlink_metadata(target) {
        if metadata.is_dir() {
            return Err(DaemonError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is a directory", target.display()),
            )));
        }
    }
    let parent = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    ensure_directory(parent)?;

    let temp = tempfile::NamedTempFile::new_in(parent).map_err(|e| {
        DaemonError::io_context(&e, format!("creating temp file in {}", parent.display()))
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(temp.path(), fs::Permissions::from_mode(FILE_MODE)) {
            warn!(path = %temp.path().display(), error = %e, "failed to set temp file permissions");
        }
    }

    let mut file = temp.as_file();
    file.write_all(data)
        .map_err(|e| DaemonError::io_context(&e, format!("writing {}", target.display())))?;
    file.sync_all()
        .map_err(|e| DaemonError::io_context(&e, format!("syncing {}", target.display())))?;
    temp.persist(target).map_err(|e| {
        DaemonError::io_context(&e.error, format!("renaming into {}", target.display()))
    })?;
    Ok(())
}

/// Removes a file the daemon created, ignoring a missing file.
pub fn remove_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {},
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove file"),
    }
}

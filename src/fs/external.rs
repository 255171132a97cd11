//! Boundary to an external (host) file system, used by mounts and by
//! lazily loaded file contents.

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::error::{Errno, FsError};

/// Attributes reported by an external resolver for a single entry.
#[derive(Debug, Clone, Copy)]
pub struct ExternalStat {
    pub mode: u32,
    pub size: u64,
}

/// Synchronous resolver over some external tree. Mount points consult it
/// lazily: once per directory for `readdir_sync`, once per entry for
/// `stat_sync`, and once per file for `read_file_sync`.
pub trait ExternalFs: Send + Sync {
    fn stat_sync(&self, path: &str) -> io::Result<ExternalStat>;
    fn readdir_sync(&self, path: &str) -> io::Result<Vec<String>>;
    fn read_file_sync(&self, path: &str) -> io::Result<Vec<u8>>;
}

/// Map an io error from a resolver into the closed error set.
pub(crate) fn map_io_error(err: &io::Error, syscall: &'static str, path: &str) -> FsError {
    use io::ErrorKind;
    let code = match err.kind() {
        ErrorKind::NotFound => Errno::ENOENT,
        ErrorKind::PermissionDenied => Errno::EACCES,
        ErrorKind::AlreadyExists => Errno::EEXIST,
        ErrorKind::InvalidInput => Errno::EINVAL,
        _ => Errno::EIO,
    };
    FsError::new(code, syscall).with_path(path)
}

/// [`ExternalFs`] over the real file system via `std::fs`, for mounting
/// host directories into a virtual tree.
#[derive(Debug, Default)]
pub struct HostFs;

impl ExternalFs for HostFs {
    fn stat_sync(&self, path: &str) -> io::Result<ExternalStat> {
        let meta = std::fs::metadata(Path::new(path))?;
        Ok(ExternalStat {
            mode: meta.mode(),
            size: meta.len(),
        })
    }

    fn readdir_sync(&self, path: &str) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(Path::new(path))? {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn read_file_sync(&self, path: &str) -> io::Result<Vec<u8>> {
        std::fs::read(Path::new(path))
    }
}

/// Join a mount source path with a child entry name.
pub(crate) fn join_source(source: &str, name: &str) -> String {
    if source.ends_with('/') {
        format!("{}{}", source, name)
    } else {
        format!("{}/{}", source, name)
    }
}

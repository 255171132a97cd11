//! Open-file table and per-descriptor state.
//!
//! A descriptor references its inode by identity, so it stays valid across
//! `rename` and `unlink` of the underlying file. Writes accumulate in a
//! descriptor-private buffer and reach the inode only on `fsync`/`close`.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{Errno, FsError, Result};

use super::inodes::{next_fd, Inode};

/// Parsed open flags. Wraps the libc `O_*` bitmask; the string forms
/// (`"r"`, `"w+"`, `"ax"`, ...) parse into the same representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(i32);

impl OpenFlags {
    pub const fn bits(self) -> i32 {
        self.0
    }

    pub(crate) fn has(self, bit: i32) -> bool {
        self.0 & bit != 0
    }

    pub(crate) fn access_mode(self) -> i32 {
        self.0 & libc::O_ACCMODE
    }

    pub(crate) fn readable(self) -> bool {
        self.access_mode() != libc::O_WRONLY
    }

    pub(crate) fn writable(self) -> bool {
        self.access_mode() != libc::O_RDONLY
    }

    /// Parse one of the recognized mode strings. Unknown strings are
    /// rejected with `EINVAL`.
    pub fn parse(s: &str) -> Result<Self> {
        use libc::{O_APPEND, O_CREAT, O_EXCL, O_RDONLY, O_RDWR, O_SYNC, O_TRUNC, O_WRONLY};
        let bits = match s {
            "r" => O_RDONLY,
            "r+" => O_RDWR,
            "rs+" => O_RDWR | O_SYNC,
            "w" => O_WRONLY | O_CREAT | O_TRUNC,
            "wx" => O_WRONLY | O_CREAT | O_TRUNC | O_EXCL,
            "w+" => O_RDWR | O_CREAT | O_TRUNC,
            "wx+" => O_RDWR | O_CREAT | O_TRUNC | O_EXCL,
            "a" => O_WRONLY | O_CREAT | O_APPEND,
            "ax" => O_WRONLY | O_CREAT | O_APPEND | O_EXCL,
            "a+" => O_RDWR | O_CREAT | O_APPEND,
            "ax+" => O_RDWR | O_CREAT | O_APPEND | O_EXCL,
            _ => return Err(FsError::new(Errno::EINVAL, "open").with_path(s)),
        };
        Ok(OpenFlags(bits))
    }
}

/// Numeric masks pass through unchanged.
impl From<i32> for OpenFlags {
    fn from(bits: i32) -> Self {
        OpenFlags(bits)
    }
}

impl std::str::FromStr for OpenFlags {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self> {
        OpenFlags::parse(s)
    }
}

/// One open-file description.
pub(crate) struct OpenHandle {
    pub fd: u64,
    pub path: String,
    pub basename: String,
    pub parent: Arc<Inode>,
    pub node: Arc<Inode>,
    pub flags: OpenFlags,
    /// Whether this descriptor has buffered unsynced writes.
    pub written: bool,
    /// Current byte offset for positionless reads and writes.
    pub offset: usize,
    /// Descriptor-private write buffer; snapshotted from the inode on the
    /// first write (or emptied by `O_TRUNC`).
    pub buffer: Option<Vec<u8>>,
}

/// Serializable snapshot of a descriptor, for test assertions and
/// debugging output.
#[derive(Debug, Clone, Serialize)]
pub struct DescriptorInfo {
    pub fd: u64,
    pub path: String,
    pub basename: String,
    /// Inode number of the directory the file was opened under.
    pub dir_ino: u64,
    pub flags: i32,
    pub written: bool,
    pub offset: usize,
    pub buffered: Option<usize>,
}

/// The open-file table, keyed by descriptor number.
pub(crate) struct FdTable {
    handles: DashMap<u64, Mutex<OpenHandle>>,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
        }
    }

    /// Register a new open-file description and return its descriptor.
    pub fn alloc(
        &self,
        path: String,
        basename: String,
        parent: Arc<Inode>,
        node: Arc<Inode>,
        flags: OpenFlags,
        offset: usize,
        buffer: Option<Vec<u8>>,
    ) -> u64 {
        let fd = next_fd();
        self.handles.insert(
            fd,
            Mutex::new(OpenHandle {
                fd,
                path,
                basename,
                parent,
                node,
                flags,
                written: false,
                offset,
                buffer,
            }),
        );
        fd
    }

    /// Run `f` against the handle for `fd`, or fail with `EBADF`.
    pub fn with<R>(
        &self,
        fd: u64,
        syscall: &'static str,
        f: impl FnOnce(&mut OpenHandle) -> Result<R>,
    ) -> Result<R> {
        let entry = self
            .handles
            .get(&fd)
            .ok_or_else(|| FsError::new(Errno::EBADF, syscall))?;
        let mut handle = entry.lock();
        f(&mut handle)
    }

    pub fn remove(&self, fd: u64) -> Option<OpenHandle> {
        self.handles.remove(&fd).map(|(_, h)| h.into_inner())
    }

    pub fn snapshot(&self) -> Vec<DescriptorInfo> {
        let mut infos: Vec<DescriptorInfo> = self
            .handles
            .iter()
            .map(|entry| {
                let h = entry.value().lock();
                DescriptorInfo {
                    fd: h.fd,
                    path: h.path.clone(),
                    basename: h.basename.clone(),
                    dir_ino: h.parent.ino,
                    flags: h.flags.bits(),
                    written: h.written,
                    offset: h.offset,
                    buffered: h.buffer.as_ref().map(Vec::len),
                }
            })
            .collect();
        infos.sort_by_key(|info| info.fd);
        infos
    }
}

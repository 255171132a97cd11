use chrono::{DateTime, Utc};
use serde::Serialize;

/// File-type masks, cast from libc to the crate's mode width.
pub const S_IFMT: u32 = libc::S_IFMT as u32;
pub const S_IFREG: u32 = libc::S_IFREG as u32;
pub const S_IFDIR: u32 = libc::S_IFDIR as u32;
pub const S_IFLNK: u32 = libc::S_IFLNK as u32;
pub const S_IFBLK: u32 = libc::S_IFBLK as u32;
pub const S_IFCHR: u32 = libc::S_IFCHR as u32;
pub const S_IFIFO: u32 = libc::S_IFIFO as u32;
pub const S_IFSOCK: u32 = libc::S_IFSOCK as u32;

/// Permission bits, including the sticky/setuid/setgid nibble.
pub const MODE_PERM_MASK: u32 = 0o7777;

pub const DEFAULT_BLKSIZE: u32 = 4096;

/// Snapshot of an inode's attributes, shaped like `stat(2)` output.
///
/// `uid`/`gid` are always 0 and `blocks` is always 0; the file system does
/// not model ownership or block allocation.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub atime_ms: i64,
    pub mtime_ms: i64,
    pub ctime_ms: i64,
    pub birthtime_ms: i64,
}

impl Stats {
    pub fn atime(&self) -> DateTime<Utc> {
        ms_to_datetime(self.atime_ms)
    }

    pub fn mtime(&self) -> DateTime<Utc> {
        ms_to_datetime(self.mtime_ms)
    }

    pub fn ctime(&self) -> DateTime<Utc> {
        ms_to_datetime(self.ctime_ms)
    }

    pub fn birthtime(&self) -> DateTime<Utc> {
        ms_to_datetime(self.birthtime_ms)
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_directory(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_symbolic_link(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    pub fn is_block_device(&self) -> bool {
        self.mode & S_IFMT == S_IFBLK
    }

    pub fn is_character_device(&self) -> bool {
        self.mode & S_IFMT == S_IFCHR
    }

    pub fn is_fifo(&self) -> bool {
        self.mode & S_IFMT == S_IFIFO
    }

    pub fn is_socket(&self) -> bool {
        self.mode & S_IFMT == S_IFSOCK
    }
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

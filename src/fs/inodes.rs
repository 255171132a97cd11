//! Inode allocation and hard-link bookkeeping.
//!
//! Device, inode, and descriptor numbers come from process-wide counters so
//! distinct file systems in one process never collide; values are never
//! reused. The link graph is bidirectional: directories hold the only
//! strong child references (through their link maps), while every inode
//! records its incoming links keyed by the parent's inode number with a
//! weak back-reference.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::external::ExternalFs;
use super::links::LinkMap;
use super::stat::{MODE_PERM_MASK, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};

static DEV_COUNT: AtomicU64 = AtomicU64::new(0);
static INO_COUNT: AtomicU64 = AtomicU64::new(0);
static FD_COUNT: AtomicU64 = AtomicU64::new(0);

pub(crate) fn next_dev() -> u64 {
    DEV_COUNT.fetch_add(1, Ordering::Relaxed) + 1
}

pub(crate) fn next_ino() -> u64 {
    INO_COUNT.fetch_add(1, Ordering::Relaxed) + 1
}

pub(crate) fn next_fd() -> u64 {
    FD_COUNT.fetch_add(1, Ordering::Relaxed) + 1
}

/// What to build when allocating a fresh inode.
#[derive(Debug, Clone)]
pub(crate) enum InodeKind {
    File,
    Dir,
    Symlink(String),
}

impl InodeKind {
    fn format_bits(&self) -> u32 {
        match self {
            InodeKind::File => S_IFREG,
            InodeKind::Dir => S_IFDIR,
            InodeKind::Symlink(_) => S_IFLNK,
        }
    }
}

/// External backing for a lazily populated directory or file.
#[derive(Clone)]
pub(crate) struct ExternalSource {
    pub source: String,
    pub resolver: Arc<dyn ExternalFs>,
}

impl std::fmt::Debug for ExternalSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalSource")
            .field("source", &self.source)
            .finish()
    }
}

/// Mutable state of a regular file.
#[derive(Debug, Default)]
pub(crate) struct FileState {
    /// In-memory contents. Absent while the file defers to a shadow root
    /// or to an unread external source.
    pub buffer: Option<Vec<u8>>,
    /// Cached size, pinned at mount materialization or on fsync.
    pub size: Option<u64>,
    /// Lazy-load source; cleared once the contents are read.
    pub external: Option<ExternalSource>,
}

/// Mutable state of a directory's child map.
#[derive(Debug)]
pub(crate) enum DirState {
    /// No children known yet; materializes to an empty map, or from the
    /// shadow root when the file system is a shadow.
    Empty,
    /// Mount point (or mount subdirectory): children come from the
    /// resolver on first access.
    Pinned(ExternalSource),
    Materialized(LinkMap),
}

#[derive(Debug)]
pub(crate) enum Payload {
    File(Mutex<FileState>),
    Dir(Mutex<DirState>),
    Symlink(String),
}

/// One incoming hard link set: all names under a single parent directory
/// that point at this inode.
#[derive(Debug, Clone)]
pub(crate) struct IncomingEntry {
    pub parent: Weak<Inode>,
    pub names: Vec<String>,
}

/// Attribute block shared by every inode type.
#[derive(Debug)]
pub(crate) struct Meta {
    pub mode: u32,
    pub atime_ms: i64,
    pub mtime_ms: i64,
    pub ctime_ms: i64,
    pub birthtime_ms: i64,
    pub nlink: u32,
    /// parent ino -> names in that parent pointing here.
    pub incoming: BTreeMap<u64, IncomingEntry>,
    /// Cached absolute paths naming this inode; invalidated whenever an
    /// ancestor link changes.
    pub paths: Option<Vec<String>>,
    pub metadata: Option<serde_json::Value>,
}

pub(crate) struct Inode {
    pub dev: u64,
    pub ino: u64,
    pub(crate) payload: Payload,
    pub(crate) meta: Mutex<Meta>,
    /// Corresponding inode in the frozen parent file system, when this
    /// inode was produced by the shadow engine.
    pub(crate) shadow_root: Option<Arc<Inode>>,
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode")
            .field("dev", &self.dev)
            .field("ino", &self.ino)
            .field("shadowed", &self.shadow_root.is_some())
            .finish()
    }
}

impl Inode {
    /// Allocate a fresh inode with `ino = ++INO_COUNT`, zero links, and the
    /// type bits folded into the permission-masked mode.
    pub(crate) fn mknod(
        dev: u64,
        kind: InodeKind,
        mode: u32,
        umask: u32,
        now_ms: i64,
    ) -> Arc<Inode> {
        let mode = (mode & !S_IFMT & !umask & MODE_PERM_MASK) | kind.format_bits();
        let payload = match kind {
            InodeKind::File => Payload::File(Mutex::new(FileState::default())),
            InodeKind::Dir => Payload::Dir(Mutex::new(DirState::Empty)),
            InodeKind::Symlink(target) => Payload::Symlink(target),
        };
        Arc::new(Inode {
            dev,
            ino: next_ino(),
            payload,
            meta: Mutex::new(Meta {
                mode,
                atime_ms: now_ms,
                mtime_ms: now_ms,
                ctime_ms: now_ms,
                birthtime_ms: now_ms,
                nlink: 0,
                incoming: BTreeMap::new(),
                paths: None,
                metadata: None,
            }),
            shadow_root: None,
        })
    }

    pub(crate) fn is_file(&self) -> bool {
        matches!(self.payload, Payload::File(_))
    }

    pub(crate) fn is_dir(&self) -> bool {
        matches!(self.payload, Payload::Dir(_))
    }

    pub(crate) fn is_symlink(&self) -> bool {
        matches!(self.payload, Payload::Symlink(_))
    }

    pub(crate) fn file_state(&self) -> Option<&Mutex<FileState>> {
        match &self.payload {
            Payload::File(state) => Some(state),
            _ => None,
        }
    }

    pub(crate) fn dir_state(&self) -> Option<&Mutex<DirState>> {
        match &self.payload {
            Payload::Dir(state) => Some(state),
            _ => None,
        }
    }

    pub(crate) fn symlink_target(&self) -> Option<&str> {
        match &self.payload {
            Payload::Symlink(target) => Some(target.as_str()),
            _ => None,
        }
    }

    pub(crate) fn mode(&self) -> u32 {
        self.meta.lock().mode
    }
}

/// Insert `name -> node` into `links`, bump `nlink`, and record the name in
/// the node's incoming set for `parent`.
pub(crate) fn add_link(parent: &Arc<Inode>, links: &mut LinkMap, name: &str, node: &Arc<Inode>) {
    links.insert(name, node.clone());
    let mut meta = node.meta.lock();
    meta.nlink += 1;
    meta.incoming
        .entry(parent.ino)
        .or_insert_with(|| IncomingEntry {
            parent: Arc::downgrade(parent),
            names: Vec::new(),
        })
        .names
        .push(name.to_string());
}

/// Remove `name` from `links` and the node's incoming set; an emptied name
/// set is dropped entirely. Works on the stored spelling of the name so
/// case-folded lookups stay consistent with the incoming records.
pub(crate) fn remove_link(parent: &Arc<Inode>, links: &mut LinkMap, name: &str, node: &Arc<Inode>) {
    let Some((stored, _)) = links.remove(name) else {
        return;
    };
    let mut meta = node.meta.lock();
    meta.nlink = meta.nlink.saturating_sub(1);
    if let Some(entry) = meta.incoming.get_mut(&parent.ino) {
        if let Some(idx) = entry.names.iter().position(|n| n == &stored) {
            entry.names.remove(idx);
        }
        if entry.names.is_empty() {
            meta.incoming.remove(&parent.ino);
        }
    }
}

/// Move a link between two distinct parents: `remove_link` then `add_link`.
pub(crate) fn replace_link(
    old_parent: &Arc<Inode>,
    old_links: &mut LinkMap,
    old_name: &str,
    new_parent: &Arc<Inode>,
    new_links: &mut LinkMap,
    new_name: &str,
    node: &Arc<Inode>,
) {
    remove_link(old_parent, old_links, old_name, node);
    add_link(new_parent, new_links, new_name, node);
}

/// Re-key a link within a single parent, leaving `nlink` untouched.
pub(crate) fn replace_link_same_parent(
    parent: &Arc<Inode>,
    links: &mut LinkMap,
    old_name: &str,
    new_name: &str,
    node: &Arc<Inode>,
) {
    let Some((stored, _)) = links.remove(old_name) else {
        return;
    };
    links.insert(new_name, node.clone());
    let mut meta = node.meta.lock();
    if let Some(entry) = meta.incoming.get_mut(&parent.ino) {
        if let Some(slot) = entry.names.iter_mut().find(|n| **n == stored) {
            *slot = new_name.to_string();
        }
    }
}

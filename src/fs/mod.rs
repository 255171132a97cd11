//! The in-memory file system and its top-level operations.

pub mod external;
pub mod fileset;
pub mod handles;
pub mod scan;
pub mod stat;

pub(crate) mod inodes;
pub(crate) mod links;

mod shadow;
mod walk;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::clock::Clock;
use crate::error::{Errno, FsError, Result};
use crate::vpath;
use crate::vpath::PathFlags;

use self::external::{join_source, map_io_error, ExternalFs};
use self::fileset::{FileSet, FileSetEntry};
use self::handles::{DescriptorInfo, FdTable, OpenFlags, OpenHandle};
use self::inodes::{
    add_link, next_dev, remove_link, replace_link, replace_link_same_parent, DirState,
    ExternalSource, Inode, InodeKind,
};
use self::links::LinkMap;
use self::stat::{Stats, DEFAULT_BLKSIZE, MODE_PERM_MASK, S_IFDIR, S_IFMT, S_IFREG};

const MKDIR_MODE_MASK: u32 = 0o1777;
const DEFAULT_UMASK: u32 = 0o022;
const READ_CHUNK: usize = 8192;

/// Construction options for [`MemFs`].
pub struct MemFsOptions {
    /// Fold case in every link map. Immutable after construction.
    pub ignore_case: bool,
    /// Time source; `Clock::from(-1)` selects the wall clock.
    pub time: Clock,
    /// Initial working directory (must exist once `files` are applied).
    pub cwd: Option<String>,
    /// File set applied before the constructor returns.
    pub files: Option<FileSet>,
}

impl Default for MemFsOptions {
    fn default() -> Self {
        Self {
            ignore_case: false,
            time: Clock::default(),
            cwd: None,
            files: None,
        }
    }
}

/// A deterministic in-memory POSIX-like file system.
///
/// Single-threaded by construction: every operation runs to completion
/// before returning, and no operation is observable partially. Interior
/// mutability lets all operations take `&self`.
pub struct MemFs {
    ignore_case: bool,
    readonly: AtomicBool,
    clock: Mutex<Clock>,
    cwd: Mutex<String>,
    dir_stack: Mutex<Vec<String>>,
    /// Root link map; names are complete absolute prefixes such as `/`.
    pub(crate) roots: Mutex<LinkMap>,
    fds: FdTable,
    /// Frozen file system this one shadows, if any.
    pub(crate) parent: Option<Arc<MemFs>>,
    /// Shadow inodes by parent `ino`; preserves identity across lookups.
    pub(crate) shadow_memo: DashMap<u64, Arc<Inode>>,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemFs")
            .field("ignore_case", &self.ignore_case)
            .field("readonly", &self.is_readonly())
            .field("cwd", &self.cwd())
            .field("shadowed", &self.parent.is_some())
            .finish()
    }
}

impl MemFs {
    /// A fresh case-sensitive file system containing only the `/` root.
    pub fn new() -> MemFs {
        let fs = MemFs::empty(false, Clock::default());
        fs.create_root("/", 0o777);
        fs
    }

    /// Build from options; the optional file set is applied and the
    /// optional working directory entered before returning.
    pub fn with_options(options: MemFsOptions) -> Result<MemFs> {
        let fs = MemFs::empty(options.ignore_case, options.time);
        fs.create_root("/", 0o777);
        if let Some(files) = &options.files {
            fs.apply(files)?;
        }
        if let Some(cwd) = &options.cwd {
            fs.chdir(cwd)?;
        }
        Ok(fs)
    }

    fn empty(ignore_case: bool, time: Clock) -> MemFs {
        MemFs {
            ignore_case,
            readonly: AtomicBool::new(false),
            clock: Mutex::new(time),
            cwd: Mutex::new("/".to_string()),
            dir_stack: Mutex::new(Vec::new()),
            roots: Mutex::new(LinkMap::new(ignore_case)),
            fds: FdTable::new(),
            parent: None,
            shadow_memo: DashMap::new(),
        }
    }

    /// Shell of a shadow child; roots are translated by `shadow()`.
    pub(crate) fn new_shadow(
        ignore_case: bool,
        time: Clock,
        cwd: String,
        parent: Arc<MemFs>,
    ) -> MemFs {
        MemFs {
            ignore_case,
            readonly: AtomicBool::new(false),
            clock: Mutex::new(time),
            cwd: Mutex::new(cwd),
            dir_stack: Mutex::new(Vec::new()),
            roots: Mutex::new(LinkMap::new(ignore_case)),
            fds: FdTable::new(),
            parent: Some(parent),
            shadow_memo: DashMap::new(),
        }
    }

    pub fn ignore_case(&self) -> bool {
        self.ignore_case
    }

    // -----------------------------------------------------------------
    // Time, freezing, current directory
    // -----------------------------------------------------------------

    /// Current time in epoch milliseconds, per the installed clock.
    pub fn time(&self) -> i64 {
        self.now_ms()
    }

    /// Replace the time source. `-1` means real wall-clock time.
    pub fn set_time(&self, clock: impl Into<Clock>) {
        *self.clock.lock() = clock.into();
    }

    pub(crate) fn clock(&self) -> Clock {
        self.clock.lock().clone()
    }

    fn now_ms(&self) -> i64 {
        self.clock.lock().now_ms()
    }

    /// Freeze the file system; every later mutation fails with `EROFS`.
    /// Freezing is monotone: there is no way back.
    pub fn make_readonly(&self) {
        debug!("make_readonly()");
        self.readonly.store(true, Ordering::Relaxed);
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::Relaxed)
    }

    fn check_writable(&self, syscall: &'static str) -> Result<()> {
        if self.is_readonly() {
            Err(FsError::new(Errno::EROFS, syscall))
        } else {
            Ok(())
        }
    }

    pub fn cwd(&self) -> String {
        self.cwd.lock().clone()
    }

    pub fn chdir(&self, path: &str) -> Result<()> {
        debug!("chdir(path={})", path);
        if self.is_readonly() {
            return Err(FsError::new(Errno::EPERM, "chdir").with_path(path));
        }
        let resolved = self.resolve_path(path);
        let found = self
            .find(&resolved, "chdir")?
            .ok_or_else(|| FsError::new(Errno::ENOENT, "chdir").with_path(&resolved))?;
        if !found.node.is_dir() {
            return Err(FsError::new(Errno::ENOTDIR, "chdir").with_path(&resolved));
        }
        *self.cwd.lock() = found.path;
        Ok(())
    }

    /// Save the current directory; with a path, also change into it.
    pub fn pushd(&self, path: Option<&str>) -> Result<()> {
        debug!("pushd(path={:?})", path);
        if self.is_readonly() {
            return Err(FsError::new(Errno::EPERM, "pushd"));
        }
        let saved = self.cwd();
        if let Some(path) = path {
            self.chdir(path)?;
        }
        self.dir_stack.lock().push(saved);
        Ok(())
    }

    /// Restore the most recently pushed directory. A no-op on an empty
    /// stack.
    pub fn popd(&self) -> Result<()> {
        debug!("popd()");
        if self.is_readonly() {
            return Err(FsError::new(Errno::EPERM, "popd"));
        }
        if let Some(previous) = self.dir_stack.lock().pop() {
            *self.cwd.lock() = previous;
        }
        Ok(())
    }

    pub(crate) fn resolve_path(&self, path: &str) -> String {
        vpath::resolve(&self.cwd(), path)
    }

    // -----------------------------------------------------------------
    // Directory materialization
    // -----------------------------------------------------------------

    /// Make sure a directory's link map exists. Mount pins are consumed
    /// (cleared before the resolver runs, so re-entry never repeats the
    /// listing); shadow directories mirror the frozen parent; anything
    /// else materializes empty.
    pub(crate) fn ensure_materialized(&self, dir: &Arc<Inode>) -> Result<()> {
        let Some(state_lock) = dir.dir_state() else {
            return Err(FsError::new(Errno::ENOTDIR, "scandir"));
        };
        let pinned = {
            let mut state = state_lock.lock();
            match &*state {
                DirState::Materialized(_) => return Ok(()),
                DirState::Pinned(source) => {
                    let source = source.clone();
                    *state = DirState::Empty;
                    Some(source)
                }
                DirState::Empty => None,
            }
        };

        let map = if let Some(source) = pinned {
            self.materialize_mount(dir, &source)?
        } else if let (Some(parent_fs), Some(shadow_root)) = (&self.parent, &dir.shadow_root) {
            self.materialize_shadow(parent_fs, shadow_root)?
        } else {
            LinkMap::new(self.ignore_case)
        };
        *state_lock.lock() = DirState::Materialized(map);
        Ok(())
    }

    /// Populate a mount directory from its resolver. Regular files are
    /// pinned with their source and stat size for lazy loading; child
    /// directories are pinned for deeper lazy listing. Symlinks and other
    /// entry types are not materialized.
    fn materialize_mount(&self, dir: &Arc<Inode>, source: &ExternalSource) -> Result<LinkMap> {
        debug!("materialize_mount(source={})", source.source);
        let names = source
            .resolver
            .readdir_sync(&source.source)
            .map_err(|e| map_io_error(&e, "scandir", &source.source))?;
        let mut map = LinkMap::new(self.ignore_case);
        let now = self.now_ms();
        for name in names {
            let child_source = join_source(&source.source, &name);
            let st = source
                .resolver
                .stat_sync(&child_source)
                .map_err(|e| map_io_error(&e, "stat", &child_source))?;
            match st.mode & S_IFMT {
                bits if bits == S_IFREG => {
                    let node =
                        Inode::mknod(dir.dev, InodeKind::File, st.mode & MODE_PERM_MASK, 0, now);
                    if let Some(file) = node.file_state() {
                        let mut file = file.lock();
                        file.size = Some(st.size);
                        file.external = Some(ExternalSource {
                            source: child_source,
                            resolver: source.resolver.clone(),
                        });
                    }
                    add_link(dir, &mut map, &name, &node);
                }
                bits if bits == S_IFDIR => {
                    let node =
                        Inode::mknod(dir.dev, InodeKind::Dir, st.mode & MODE_PERM_MASK, 0, now);
                    if let Some(state) = node.dir_state() {
                        *state.lock() = DirState::Pinned(ExternalSource {
                            source: child_source,
                            resolver: source.resolver.clone(),
                        });
                    }
                    add_link(dir, &mut map, &name, &node);
                }
                _ => {}
            }
        }
        Ok(map)
    }

    /// Run `f` on a directory's materialized link map.
    pub(crate) fn with_dir_links<R>(
        &self,
        dir: &Arc<Inode>,
        f: impl FnOnce(&mut LinkMap) -> Result<R>,
    ) -> Result<R> {
        self.ensure_materialized(dir)?;
        let Some(state_lock) = dir.dir_state() else {
            return Err(FsError::new(Errno::ENOTDIR, "scandir"));
        };
        let mut state = state_lock.lock();
        match &mut *state {
            DirState::Materialized(links) => f(links),
            _ => Err(FsError::new(Errno::EIO, "scandir")),
        }
    }

    // -----------------------------------------------------------------
    // File contents
    // -----------------------------------------------------------------

    /// Current bytes of a regular file, pulling lazily from an external
    /// source or the shadowed parent when the inode has no buffer of its
    /// own yet.
    pub(crate) fn file_contents(&self, node: &Arc<Inode>) -> Result<Vec<u8>> {
        let Some(state_lock) = node.file_state() else {
            let code = if node.is_dir() {
                Errno::EISDIR
            } else {
                Errno::EINVAL
            };
            return Err(FsError::new(code, "read"));
        };
        let mut state = state_lock.lock();
        if let Some(buffer) = &state.buffer {
            return Ok(buffer.clone());
        }
        if let Some(source) = state.external.take() {
            match source.resolver.read_file_sync(&source.source) {
                Ok(bytes) => {
                    state.size = Some(bytes.len() as u64);
                    state.buffer = Some(bytes.clone());
                    return Ok(bytes);
                }
                Err(e) => {
                    let err = map_io_error(&e, "read", &source.source);
                    state.external = Some(source);
                    return Err(err);
                }
            }
        }
        drop(state);
        if let (Some(parent_fs), Some(shadow_root)) = (&self.parent, &node.shadow_root) {
            return parent_fs.file_contents(shadow_root);
        }
        Ok(Vec::new())
    }

    pub(crate) fn file_size(&self, node: &Arc<Inode>) -> u64 {
        if let Some(state_lock) = node.file_state() {
            let state = state_lock.lock();
            if let Some(size) = state.size {
                return size;
            }
            if let Some(buffer) = &state.buffer {
                return buffer.len() as u64;
            }
            drop(state);
            if let (Some(parent_fs), Some(shadow_root)) = (&self.parent, &node.shadow_root) {
                return parent_fs.file_size(shadow_root);
            }
        }
        0
    }

    pub(crate) fn stats_for(&self, node: &Arc<Inode>) -> Stats {
        let size = if node.is_file() {
            self.file_size(node)
        } else if let Some(target) = node.symlink_target() {
            target.len() as u64
        } else {
            0
        };
        let meta = node.meta.lock();
        Stats {
            dev: node.dev,
            ino: node.ino,
            mode: meta.mode,
            nlink: meta.nlink,
            uid: 0,
            gid: 0,
            rdev: 0,
            size,
            blksize: DEFAULT_BLKSIZE,
            blocks: 0,
            atime_ms: meta.atime_ms,
            mtime_ms: meta.mtime_ms,
            ctime_ms: meta.ctime_ms,
            birthtime_ms: meta.birthtime_ms,
        }
    }

    fn touch(&self, node: &Arc<Inode>, mtime: bool, ctime: bool) {
        let now = self.now_ms();
        let mut meta = node.meta.lock();
        if mtime {
            meta.mtime_ms = now;
        }
        if ctime {
            meta.ctime_ms = now;
        }
    }

    /// Drop cached path lists on an inode and, through materialized link
    /// maps, all of its descendants.
    fn invalidate_paths(&self, node: &Arc<Inode>) {
        node.meta.lock().paths = None;
        if let Some(state_lock) = node.dir_state() {
            let children: Vec<Arc<Inode>> = match &*state_lock.lock() {
                DirState::Materialized(links) => {
                    links.iter().map(|(_, child)| child.clone()).collect()
                }
                _ => Vec::new(),
            };
            for child in children {
                self.invalidate_paths(&child);
            }
        }
    }

    // -----------------------------------------------------------------
    // Tree mutations
    // -----------------------------------------------------------------

    fn create_root(&self, name: &str, mode: u32) -> Arc<Inode> {
        let node = Inode::mknod(
            next_dev(),
            InodeKind::Dir,
            mode & MKDIR_MODE_MASK,
            DEFAULT_UMASK,
            self.now_ms(),
        );
        let mut roots = self.roots.lock();
        add_link(&node, &mut roots, name, &node);
        node
    }

    /// Walk the containing directory of `resolved` and return it with the
    /// final name.
    fn locate_parent(&self, resolved: &str, syscall: &'static str) -> Result<(Arc<Inode>, String)> {
        let dir_path = vpath::dirname(resolved);
        let name = vpath::basename(resolved);
        let found = self
            .find(&dir_path, syscall)?
            .ok_or_else(|| FsError::new(Errno::ENOENT, syscall).with_path(resolved))?;
        if !found.node.is_dir() {
            return Err(FsError::new(Errno::ENOTDIR, syscall).with_path(dir_path));
        }
        Ok((found.node, name))
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        self.mkdir_mode(path, 0o777)
    }

    pub fn mkdir_mode(&self, path: &str, mode: u32) -> Result<()> {
        debug!("mkdir(path={}, mode={:#o})", path, mode);
        self.check_writable("mkdir")?;
        let resolved = self.resolve_path(path);
        let mode = mode & MKDIR_MODE_MASK;

        if vpath::dirname(&resolved) == resolved {
            let exists = self.roots.lock().contains(&resolved);
            if exists {
                return Err(FsError::new(Errno::EEXIST, "mkdir").with_path(&resolved));
            }
            self.create_root(&resolved, mode);
            return Ok(());
        }

        let (parent, name) = self.locate_parent(&resolved, "mkdir")?;
        let now = self.now_ms();
        self.with_dir_links(&parent, |links| {
            if links.contains(&name) {
                return Err(FsError::new(Errno::EEXIST, "mkdir").with_path(&resolved));
            }
            let node = Inode::mknod(parent.dev, InodeKind::Dir, mode, DEFAULT_UMASK, now);
            add_link(&parent, links, &name, &node);
            Ok(())
        })?;
        self.touch(&parent, true, true);
        Ok(())
    }

    /// Create a directory and any missing ancestors. Idempotent.
    pub fn mkdirp(&self, path: &str) -> Result<()> {
        match self.mkdir(path) {
            Ok(()) => Ok(()),
            Err(e) if e.code == Errno::EEXIST => Ok(()),
            Err(e) if e.code == Errno::ENOENT => {
                let resolved = self.resolve_path(path);
                let parent = vpath::dirname(&resolved);
                if parent == resolved {
                    return Err(e);
                }
                self.mkdirp(&parent)?;
                match self.mkdir(path) {
                    Ok(()) => Ok(()),
                    Err(e) if e.code == Errno::EEXIST => Ok(()),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        debug!("rmdir(path={})", path);
        self.check_writable("rmdir")?;
        let resolved = self.resolve_path(path);
        if vpath::is_root(&resolved) {
            return Err(FsError::new(Errno::EPERM, "rmdir").with_path(&resolved));
        }
        let found = self
            .lfind(&resolved, "rmdir")?
            .ok_or_else(|| FsError::new(Errno::ENOENT, "rmdir").with_path(&resolved))?;
        if !found.node.is_dir() {
            return Err(FsError::new(Errno::ENOTDIR, "rmdir").with_path(&resolved));
        }
        let empty = self.with_dir_links(&found.node, |links| Ok(links.is_empty()))?;
        if !empty {
            return Err(FsError::new(Errno::ENOTEMPTY, "rmdir").with_path(&resolved));
        }
        self.with_dir_links(&found.parent, |links| {
            remove_link(&found.parent, links, &found.basename, &found.node);
            Ok(())
        })?;
        self.touch(&found.parent, true, true);
        self.touch(&found.node, false, true);
        self.invalidate_paths(&found.node);
        Ok(())
    }

    /// Create an additional name for an existing non-directory inode.
    pub fn link(&self, old_path: &str, new_path: &str) -> Result<()> {
        debug!("link(old={}, new={})", old_path, new_path);
        self.check_writable("link")?;
        let old_resolved = self.resolve_path(old_path);
        let new_resolved = self.resolve_path(new_path);
        let source = self.lfind(&old_resolved, "link")?.ok_or_else(|| {
            FsError::new(Errno::ENOENT, "link")
                .with_path(&old_resolved)
                .with_dest(&new_resolved)
        })?;
        if source.node.is_dir() {
            return Err(FsError::new(Errno::EPERM, "link")
                .with_path(&old_resolved)
                .with_dest(&new_resolved));
        }
        let (parent, name) = self.locate_parent(&new_resolved, "link")?;
        self.with_dir_links(&parent, |links| {
            if links.contains(&name) {
                return Err(FsError::new(Errno::EEXIST, "link")
                    .with_path(&old_resolved)
                    .with_dest(&new_resolved));
            }
            add_link(&parent, links, &name, &source.node);
            Ok(())
        })?;
        self.touch(&parent, true, true);
        self.touch(&source.node, false, true);
        self.invalidate_paths(&source.node);
        Ok(())
    }

    /// Remove a name. The inode survives while other links or open
    /// descriptors reference it.
    pub fn unlink(&self, path: &str) -> Result<()> {
        debug!("unlink(path={})", path);
        self.check_writable("unlink")?;
        let resolved = self.resolve_path(path);
        let found = self
            .lfind(&resolved, "unlink")?
            .ok_or_else(|| FsError::new(Errno::ENOENT, "unlink").with_path(&resolved))?;
        if found.node.is_dir() {
            return Err(FsError::new(Errno::EISDIR, "unlink").with_path(&resolved));
        }
        self.with_dir_links(&found.parent, |links| {
            remove_link(&found.parent, links, &found.basename, &found.node);
            Ok(())
        })?;
        self.touch(&found.parent, true, true);
        self.touch(&found.node, false, true);
        self.invalidate_paths(&found.node);
        Ok(())
    }

    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        debug!("rename(old={}, new={})", old_path, new_path);
        self.check_writable("rename")?;
        let old_resolved = self.resolve_path(old_path);
        let new_resolved = self.resolve_path(new_path);
        if old_resolved == new_resolved {
            return Ok(());
        }
        if vpath::is_root(&old_resolved) || vpath::is_root(&new_resolved) {
            return Err(FsError::new(Errno::EPERM, "rename")
                .with_path(&old_resolved)
                .with_dest(&new_resolved));
        }
        let old_prefix = vpath::add_trailing_separator(&old_resolved);
        let is_subtree = if self.ignore_case {
            new_resolved
                .to_lowercase()
                .starts_with(&old_prefix.to_lowercase())
        } else {
            new_resolved.starts_with(&old_prefix)
        };
        if is_subtree {
            return Err(FsError::new(Errno::EINVAL, "rename")
                .with_path(&old_resolved)
                .with_dest(&new_resolved));
        }

        let source = self.lfind(&old_resolved, "rename")?.ok_or_else(|| {
            FsError::new(Errno::ENOENT, "rename")
                .with_path(&old_resolved)
                .with_dest(&new_resolved)
        })?;
        let (new_parent, new_name) = self.locate_parent(&new_resolved, "rename")?;

        let target = self.with_dir_links(&new_parent, |links| Ok(links.get(&new_name)))?;
        if let Some(target) = target {
            if Arc::ptr_eq(&target, &source.node) {
                return Ok(());
            }
            if target.is_dir() {
                if !source.node.is_dir() {
                    return Err(FsError::new(Errno::EISDIR, "rename")
                        .with_path(&old_resolved)
                        .with_dest(&new_resolved));
                }
                let empty = self.with_dir_links(&target, |links| Ok(links.is_empty()))?;
                if !empty {
                    return Err(FsError::new(Errno::ENOTEMPTY, "rename")
                        .with_path(&old_resolved)
                        .with_dest(&new_resolved));
                }
            } else if source.node.is_dir() {
                return Err(FsError::new(Errno::ENOTDIR, "rename")
                    .with_path(&old_resolved)
                    .with_dest(&new_resolved));
            }
            self.with_dir_links(&new_parent, |links| {
                remove_link(&new_parent, links, &new_name, &target);
                Ok(())
            })?;
            self.touch(&target, false, true);
            self.invalidate_paths(&target);
        }

        if Arc::ptr_eq(&source.parent, &new_parent) {
            self.with_dir_links(&new_parent, |links| {
                replace_link_same_parent(
                    &new_parent,
                    links,
                    &source.basename,
                    &new_name,
                    &source.node,
                );
                Ok(())
            })?;
        } else {
            // Materialize both ends before taking either lock.
            self.ensure_materialized(&source.parent)?;
            self.ensure_materialized(&new_parent)?;
            self.with_dir_links(&source.parent, |old_links| {
                self.with_dir_links_unlocked(&new_parent, |new_links| {
                    replace_link(
                        &source.parent,
                        old_links,
                        &source.basename,
                        &new_parent,
                        new_links,
                        &new_name,
                        &source.node,
                    );
                    Ok(())
                })
            })?;
        }
        self.touch(&source.parent, true, true);
        self.touch(&new_parent, true, true);
        self.touch(&source.node, false, true);
        self.invalidate_paths(&source.node);
        Ok(())
    }

    /// Like [`with_dir_links`](Self::with_dir_links) but assumes the
    /// directory is already materialized, for use while another link map
    /// is locked.
    fn with_dir_links_unlocked<R>(
        &self,
        dir: &Arc<Inode>,
        f: impl FnOnce(&mut LinkMap) -> Result<R>,
    ) -> Result<R> {
        let Some(state_lock) = dir.dir_state() else {
            return Err(FsError::new(Errno::ENOTDIR, "scandir"));
        };
        let mut state = state_lock.lock();
        match &mut *state {
            DirState::Materialized(links) => f(links),
            _ => Err(FsError::new(Errno::EIO, "scandir")),
        }
    }

    /// Store `target` verbatim as a symbolic link at `link_path`.
    pub fn symlink(&self, target: &str, link_path: &str) -> Result<()> {
        debug!("symlink(target={}, link={})", target, link_path);
        self.check_writable("symlink")?;
        vpath::validate(target, PathFlags::RelativeOrAbsolute)?;
        let resolved = self.resolve_path(link_path);
        let (parent, name) = self.locate_parent(&resolved, "symlink")?;
        let now = self.now_ms();
        self.with_dir_links(&parent, |links| {
            if links.contains(&name) {
                return Err(FsError::new(Errno::EEXIST, "symlink")
                    .with_path(target)
                    .with_dest(&resolved));
            }
            let node = Inode::mknod(
                parent.dev,
                InodeKind::Symlink(target.to_string()),
                0o666,
                0,
                now,
            );
            add_link(&parent, links, &name, &node);
            Ok(())
        })?;
        self.touch(&parent, true, true);
        Ok(())
    }

    pub fn readlink(&self, path: &str) -> Result<String> {
        debug!("readlink(path={})", path);
        let resolved = self.resolve_path(path);
        let found = self
            .lfind(&resolved, "readlink")?
            .ok_or_else(|| FsError::new(Errno::ENOENT, "readlink").with_path(&resolved))?;
        found
            .node
            .symlink_target()
            .map(str::to_string)
            .ok_or_else(|| FsError::new(Errno::EINVAL, "readlink").with_path(&resolved))
    }

    /// Child names in comparator order.
    pub fn readdir(&self, path: &str) -> Result<Vec<String>> {
        debug!("readdir(path={})", path);
        let resolved = self.resolve_path(path);
        let found = self
            .find(&resolved, "scandir")?
            .ok_or_else(|| FsError::new(Errno::ENOENT, "scandir").with_path(&resolved))?;
        if !found.node.is_dir() {
            return Err(FsError::new(Errno::ENOTDIR, "scandir").with_path(&resolved));
        }
        self.with_dir_links(&found.node, |links| Ok(links.names()))
    }

    /// Replace the permission bits, preserving the type bits.
    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        debug!("chmod(path={}, mode={:#o})", path, mode);
        self.check_writable("chmod")?;
        let resolved = self.resolve_path(path);
        let found = self
            .find(&resolved, "chmod")?
            .ok_or_else(|| FsError::new(Errno::ENOENT, "chmod").with_path(&resolved))?;
        let now = self.now_ms();
        let mut meta = found.node.meta.lock();
        meta.mode = (meta.mode & S_IFMT) | (mode & MODE_PERM_MASK);
        meta.ctime_ms = now;
        Ok(())
    }

    pub fn stat(&self, path: &str) -> Result<Stats> {
        let resolved = self.resolve_path(path);
        let found = self
            .find(&resolved, "stat")?
            .ok_or_else(|| FsError::new(Errno::ENOENT, "stat").with_path(&resolved))?;
        Ok(self.stats_for(&found.node))
    }

    pub fn lstat(&self, path: &str) -> Result<Stats> {
        let resolved = self.resolve_path(path);
        let found = self
            .lfind(&resolved, "lstat")?
            .ok_or_else(|| FsError::new(Errno::ENOENT, "lstat").with_path(&resolved))?;
        Ok(self.stats_for(&found.node))
    }

    pub fn fstat(&self, fd: u64) -> Result<Stats> {
        self.fds
            .with(fd, "fstat", |handle| Ok(self.stats_for(&handle.node)))
    }

    /// Canonical absolute path after full symlink expansion.
    pub fn realpath(&self, path: &str) -> Result<String> {
        let resolved = self.resolve_path(path);
        let found = self
            .find(&resolved, "realpath")?
            .ok_or_else(|| FsError::new(Errno::ENOENT, "realpath").with_path(&resolved))?;
        Ok(found.path)
    }

    /// Whether the path resolves to anything. Walk errors count as absent.
    pub fn exists(&self, path: &str) -> bool {
        let resolved = self.resolve_path(path);
        matches!(self.find(&resolved, "stat"), Ok(Some(_)))
    }

    /// Every absolute path naming the inode at `path`, computed from the
    /// incoming-link sets and cached until an ancestor link changes.
    pub fn paths(&self, path: &str) -> Result<Vec<String>> {
        let resolved = self.resolve_path(path);
        let found = self
            .find(&resolved, "stat")?
            .ok_or_else(|| FsError::new(Errno::ENOENT, "stat").with_path(&resolved))?;
        Ok(self.paths_of(&found.node))
    }

    fn paths_of(&self, node: &Arc<Inode>) -> Vec<String> {
        if let Some(cached) = &node.meta.lock().paths {
            return cached.clone();
        }
        let incoming: Vec<(u64, inodes::IncomingEntry)> = node
            .meta
            .lock()
            .incoming
            .iter()
            .map(|(ino, entry)| (*ino, entry.clone()))
            .collect();
        let mut out = Vec::new();
        for (parent_ino, entry) in incoming {
            if parent_ino == node.ino {
                // Root: the incoming names are the absolute prefixes.
                out.extend(entry.names.iter().cloned());
                continue;
            }
            let Some(parent) = entry.parent.upgrade() else {
                continue;
            };
            for parent_path in self.paths_of(&parent) {
                for name in &entry.names {
                    out.push(vpath::combine(&parent_path, name));
                }
            }
        }
        out.sort();
        out.dedup();
        node.meta.lock().paths = Some(out.clone());
        out
    }

    /// Create a lazily populated directory backed by `resolver` at
    /// `target`.
    pub fn mount(&self, source: &str, target: &str, resolver: Arc<dyn ExternalFs>) -> Result<()> {
        self.mount_mode(source, target, resolver, 0o777)
    }

    pub fn mount_mode(
        &self,
        source: &str,
        target: &str,
        resolver: Arc<dyn ExternalFs>,
        mode: u32,
    ) -> Result<()> {
        debug!("mount(source={}, target={})", source, target);
        self.check_writable("mount")?;
        let resolved = self.resolve_path(target);
        let mode = mode & MKDIR_MODE_MASK;
        let pin = ExternalSource {
            source: source.to_string(),
            resolver,
        };

        if vpath::dirname(&resolved) == resolved {
            let exists = self.roots.lock().contains(&resolved);
            if exists {
                return Err(FsError::new(Errno::EEXIST, "mount").with_path(&resolved));
            }
            let node = self.create_root(&resolved, mode);
            if let Some(state) = node.dir_state() {
                *state.lock() = DirState::Pinned(pin);
            }
            return Ok(());
        }

        let (parent, name) = self.locate_parent(&resolved, "mount")?;
        let now = self.now_ms();
        self.with_dir_links(&parent, |links| {
            if links.contains(&name) {
                return Err(FsError::new(Errno::EEXIST, "mount").with_path(&resolved));
            }
            let node = Inode::mknod(parent.dev, InodeKind::Dir, mode, DEFAULT_UMASK, now);
            if let Some(state) = node.dir_state() {
                *state.lock() = DirState::Pinned(pin);
            }
            add_link(&parent, links, &name, &node);
            Ok(())
        })?;
        self.touch(&parent, true, true);
        Ok(())
    }

    /// Recursively remove a tree. Missing entries are ignored; a root is
    /// emptied but left in place.
    pub fn rimraf(&self, path: &str) -> Result<()> {
        debug!("rimraf(path={})", path);
        self.check_writable("rimraf")?;
        let resolved = self.resolve_path(path);
        self.rimraf_inner(&resolved)
    }

    fn rimraf_inner(&self, resolved: &str) -> Result<()> {
        let found = match self.lfind(resolved, "rimraf") {
            Ok(Some(found)) => found,
            Ok(None) => return Ok(()),
            Err(e) if e.code == Errno::ENOENT => return Ok(()),
            Err(e) => return Err(e),
        };
        if found.node.is_dir() {
            let names = self.with_dir_links(&found.node, |links| Ok(links.names()))?;
            for name in names {
                self.rimraf_inner(&vpath::combine(resolved, &name))?;
            }
            if vpath::is_root(resolved) {
                return Ok(());
            }
            match self.rmdir(resolved) {
                Ok(()) => Ok(()),
                Err(e) if e.code == Errno::ENOENT => Ok(()),
                Err(e) => Err(e),
            }
        } else {
            match self.unlink(resolved) {
                Ok(()) => Ok(()),
                Err(e) if e.code == Errno::ENOENT => Ok(()),
                Err(e) => Err(e),
            }
        }
    }

    // -----------------------------------------------------------------
    // Open files and I/O
    // -----------------------------------------------------------------

    pub fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> Result<u64> {
        debug!("open(path={}, flags={:#o}, mode={:#o})", path, flags.bits(), mode);
        if flags.writable() {
            self.check_writable("open")?;
        }
        let resolved = self.resolve_path(path);
        let no_follow = flags.has(libc::O_NOFOLLOW);
        let found = self.walk(&resolved, no_follow, "open")?;

        let (parent, basename, node) = match found {
            None if flags.has(libc::O_CREAT) => {
                if flags.has(libc::O_DIRECTORY) {
                    return Err(FsError::new(Errno::EINVAL, "open").with_path(&resolved));
                }
                self.check_writable("open")?;
                let (parent, name) = self.locate_parent(&resolved, "open")?;
                let now = self.now_ms();
                let node = self.with_dir_links(&parent, |links| {
                    let node =
                        Inode::mknod(parent.dev, InodeKind::File, mode, DEFAULT_UMASK, now);
                    if let Some(file) = node.file_state() {
                        file.lock().buffer = Some(Vec::new());
                    }
                    add_link(&parent, links, &name, &node);
                    Ok(node)
                })?;
                self.touch(&parent, true, true);
                (parent, name, node)
            }
            None => {
                return Err(FsError::new(Errno::ENOENT, "open").with_path(&resolved));
            }
            Some(found) => {
                if flags.has(libc::O_CREAT) && flags.has(libc::O_EXCL) {
                    return Err(FsError::new(Errno::EEXIST, "open").with_path(&resolved));
                }
                if found.node.is_symlink() {
                    return Err(FsError::new(Errno::ELOOP, "open").with_path(&resolved));
                }
                if flags.has(libc::O_DIRECTORY) && found.node.is_file() {
                    return Err(FsError::new(Errno::ENOTDIR, "open").with_path(&resolved));
                }
                if flags.writable() && found.node.is_dir() {
                    return Err(FsError::new(Errno::EISDIR, "open").with_path(&resolved));
                }
                (found.parent, found.basename, found.node)
            }
        };

        let offset = if node.is_file()
            && flags.bits() & (libc::O_APPEND | libc::O_TRUNC) == libc::O_APPEND
        {
            self.file_size(&node) as usize
        } else {
            0
        };
        let buffer = if flags.has(libc::O_TRUNC) {
            Some(Vec::new())
        } else {
            None
        };
        let fd = self
            .fds
            .alloc(resolved, basename, parent, node, flags, offset, buffer);
        if flags.has(libc::O_TRUNC) && flags.has(libc::O_SYNC) {
            self.fsync_fd(fd, true)?;
        }
        Ok(fd)
    }

    /// [`open`](Self::open) with a mode string (`"r"`, `"w+"`, ...) and
    /// the default creation mode `0o666`.
    pub fn open_with(&self, path: &str, flags: &str) -> Result<u64> {
        self.open(path, OpenFlags::parse(flags)?, 0o666)
    }

    /// Read up to `length` bytes into `buf[offset..]`. A `position` of
    /// `-1` reads at the descriptor offset and advances it; any other
    /// position leaves the descriptor offset alone.
    pub fn read(
        &self,
        fd: u64,
        buf: &mut [u8],
        offset: usize,
        length: usize,
        position: i64,
    ) -> Result<usize> {
        self.fds.with(fd, "read", |handle| {
            if !handle.flags.readable() {
                return Err(FsError::new(Errno::EBADF, "read").with_path(&handle.path));
            }
            if handle.node.is_dir() {
                return Err(FsError::new(Errno::EISDIR, "read").with_path(&handle.path));
            }
            if position < -1 || offset.checked_add(length).map_or(true, |end| end > buf.len()) {
                return Err(FsError::new(Errno::EINVAL, "read").with_path(&handle.path));
            }
            let data = match &handle.buffer {
                Some(buffer) => buffer.clone(),
                None => self.file_contents(&handle.node)?,
            };
            let pos = if position < 0 {
                handle.offset
            } else {
                position as usize
            };
            let n = length.min(data.len().saturating_sub(pos));
            buf[offset..offset + n].copy_from_slice(&data[pos..pos + n]);
            if position < 0 {
                handle.offset = pos + n;
            }
            Ok(n)
        })
    }

    /// Write `buf[offset..offset + length]` through the descriptor's
    /// private buffer; the inode is untouched until `fsync`/`close`. The
    /// buffer grows to exactly `position + length` when the write lands
    /// past its end, zero-filling any gap.
    pub fn write(
        &self,
        fd: u64,
        buf: &[u8],
        offset: usize,
        length: usize,
        position: i64,
    ) -> Result<usize> {
        let sync = self.fds.with(fd, "write", |handle| {
            self.check_writable("write")?;
            if !handle.flags.writable() {
                return Err(FsError::new(Errno::EBADF, "write").with_path(&handle.path));
            }
            if position < -1 || offset.checked_add(length).map_or(true, |end| end > buf.len()) {
                return Err(FsError::new(Errno::EINVAL, "write").with_path(&handle.path));
            }
            let mut data = match handle.buffer.take() {
                Some(data) => data,
                None => self.file_contents(&handle.node)?,
            };
            let pos = if position < 0 {
                handle.offset
            } else {
                position as usize
            };
            let end = pos + length;
            if end > data.len() {
                data.resize(end, 0);
            }
            data[pos..end].copy_from_slice(&buf[offset..offset + length]);
            handle.buffer = Some(data);
            handle.written = true;
            if position < 0 {
                handle.offset = end;
            }
            Ok(handle.flags.has(libc::O_SYNC))
        })?;
        if sync {
            self.fsync_fd(fd, true)?;
        }
        Ok(length)
    }

    /// Install the descriptor's buffered writes into the inode and stamp
    /// `mtime`/`ctime`; also refresh the cached size.
    pub fn fsync(&self, fd: u64) -> Result<()> {
        self.fsync_fd(fd, true)
    }

    /// Data-only flush: contents reach the inode, the cached size does
    /// not change.
    pub fn fdatasync(&self, fd: u64) -> Result<()> {
        self.fsync_fd(fd, false)
    }

    fn fsync_fd(&self, fd: u64, metadata: bool) -> Result<()> {
        self.fds
            .with(fd, "fsync", |handle| self.fsync_handle(handle, metadata))
    }

    fn fsync_handle(&self, handle: &mut OpenHandle, metadata: bool) -> Result<()> {
        let Some(buffer) = handle.buffer.clone() else {
            return Ok(());
        };
        self.check_writable("fsync")?;
        if let Some(state_lock) = handle.node.file_state() {
            let mut state = state_lock.lock();
            state.external = None;
            if metadata {
                state.size = Some(buffer.len() as u64);
            }
            state.buffer = Some(buffer);
        }
        self.touch(&handle.node, true, true);
        handle.written = false;
        Ok(())
    }

    /// Unregister the descriptor and flush with metadata.
    pub fn close(&self, fd: u64) -> Result<()> {
        debug!("close(fd={})", fd);
        let Some(mut handle) = self.fds.remove(fd) else {
            return Err(FsError::new(Errno::EBADF, "close"));
        };
        self.fsync_handle(&mut handle, true)
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        debug!("read_file(path={})", path);
        let fd = self.open(path, OpenFlags::from(libc::O_RDONLY), 0)?;
        let result = self.read_file_fd(fd);
        let closed = self.close(fd);
        result.and_then(|bytes| closed.map(|_| bytes))
    }

    /// Drain a pre-opened descriptor from its current offset. The
    /// descriptor is left open.
    pub fn read_file_fd(&self, fd: u64) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        let mut stalled = 0;
        loop {
            let n = self.read(fd, &mut chunk, 0, READ_CHUNK, -1)?;
            if n == 0 {
                stalled += 1;
                if stalled >= 2 {
                    break;
                }
            } else {
                stalled = 0;
                out.extend_from_slice(&chunk[..n]);
            }
        }
        Ok(out)
    }

    pub fn read_file_text(&self, path: &str) -> Result<String> {
        let resolved = self.resolve_path(path);
        String::from_utf8(self.read_file(path)?)
            .map_err(|_| FsError::new(Errno::EINVAL, "read").with_path(resolved))
    }

    pub fn write_file(&self, path: &str, data: impl AsRef<[u8]>) -> Result<()> {
        debug!("write_file(path={}, len={})", path, data.as_ref().len());
        let fd = self.open_with(path, "w")?;
        let result = self.write_file_fd(fd, data.as_ref());
        let closed = self.close(fd);
        result.and(closed)
    }

    /// Write everything through a pre-opened descriptor at its current
    /// offset. The descriptor is left open.
    pub fn write_file_fd(&self, fd: u64, data: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < data.len() {
            let n = self.write(fd, data, written, data.len() - written, -1)?;
            if n == 0 {
                break;
            }
            written += n;
        }
        Ok(())
    }

    /// Snapshot of the open-file table, ordered by descriptor.
    pub fn open_files(&self) -> Vec<DescriptorInfo> {
        self.fds.snapshot()
    }

    // -----------------------------------------------------------------
    // Bulk population
    // -----------------------------------------------------------------

    /// Install a declarative file set. Directories, files, and removals
    /// apply immediately; hard links, symlinks, and mounts are deferred
    /// to a second pass so they may reference first-pass entries. Roots
    /// may only be directories or mounts.
    pub fn apply(&self, files: &FileSet) -> Result<()> {
        debug!("apply({} entries)", files.len());
        self.check_writable("apply")?;
        let mut deferred = Vec::new();
        for (name, entry) in files {
            let path = self.resolve_path(name);
            self.apply_entry(&path, entry, &mut deferred)?;
        }
        for entry in deferred {
            match entry {
                Deferred::Symlink {
                    path,
                    target,
                    mode,
                    metadata,
                } => {
                    self.symlink(&target, &path)?;
                    if let Some(mode) = mode {
                        self.set_mode_no_follow(&path, mode)?;
                    }
                    if let Some(metadata) = metadata {
                        self.set_metadata(&path, metadata, true)?;
                    }
                }
                Deferred::HardLink { path, source } => {
                    self.link(&source, &path)?;
                }
                Deferred::Mount {
                    path,
                    source,
                    resolver,
                    mode,
                    metadata,
                } => {
                    self.mount_mode(&source, &path, resolver, mode.unwrap_or(0o777))?;
                    if let Some(metadata) = metadata {
                        self.set_metadata(&path, metadata, false)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_entry(
        &self,
        path: &str,
        entry: &FileSetEntry,
        deferred: &mut Vec<Deferred>,
    ) -> Result<()> {
        let at_root = vpath::is_root(path);
        match entry {
            FileSetEntry::Dir {
                files,
                mode,
                metadata,
            } => {
                if self.exists(path) {
                    if let Some(mode) = mode {
                        self.chmod(path, *mode)?;
                    }
                } else {
                    self.mkdirp(&vpath::dirname(path))?;
                    self.mkdir_mode(path, mode.unwrap_or(0o777))?;
                }
                if let Some(metadata) = metadata {
                    self.set_metadata(path, metadata.clone(), false)?;
                }
                for (name, child) in files {
                    let child_path = vpath::resolve(path, name);
                    self.apply_entry(&child_path, child, deferred)?;
                }
                Ok(())
            }
            FileSetEntry::File {
                data,
                mode,
                metadata,
            } => {
                if at_root {
                    return Err(FsError::new(Errno::EINVAL, "apply").with_path(path));
                }
                self.mkdirp(&vpath::dirname(path))?;
                self.write_file(path, data)?;
                if let Some(mode) = mode {
                    self.chmod(path, *mode)?;
                }
                if let Some(metadata) = metadata {
                    self.set_metadata(path, metadata.clone(), false)?;
                }
                Ok(())
            }
            FileSetEntry::Remove => {
                if at_root {
                    return Err(FsError::new(Errno::EINVAL, "apply").with_path(path));
                }
                self.rimraf(path)
            }
            FileSetEntry::HardLink { path: source } => {
                if at_root {
                    return Err(FsError::new(Errno::EINVAL, "apply").with_path(path));
                }
                deferred.push(Deferred::HardLink {
                    path: path.to_string(),
                    source: source.clone(),
                });
                Ok(())
            }
            FileSetEntry::Symlink {
                target,
                mode,
                metadata,
            } => {
                if at_root {
                    return Err(FsError::new(Errno::EINVAL, "apply").with_path(path));
                }
                deferred.push(Deferred::Symlink {
                    path: path.to_string(),
                    target: target.clone(),
                    mode: *mode,
                    metadata: metadata.clone(),
                });
                Ok(())
            }
            FileSetEntry::Mount {
                source,
                resolver,
                mode,
                metadata,
            } => {
                deferred.push(Deferred::Mount {
                    path: path.to_string(),
                    source: source.clone(),
                    resolver: resolver.clone(),
                    mode: *mode,
                    metadata: metadata.clone(),
                });
                Ok(())
            }
        }
    }

    fn set_metadata(&self, path: &str, value: Value, no_follow: bool) -> Result<()> {
        let resolved = self.resolve_path(path);
        let found = self
            .walk(&resolved, no_follow, "stat")?
            .ok_or_else(|| FsError::new(Errno::ENOENT, "stat").with_path(&resolved))?;
        found.node.meta.lock().metadata = Some(value);
        Ok(())
    }

    /// Metadata bag attached to the inode at `path`, if any.
    pub fn metadata(&self, path: &str) -> Result<Option<Value>> {
        let resolved = self.resolve_path(path);
        let found = self
            .find(&resolved, "stat")?
            .ok_or_else(|| FsError::new(Errno::ENOENT, "stat").with_path(&resolved))?;
        let metadata = found.node.meta.lock().metadata.clone();
        Ok(metadata)
    }

    fn set_mode_no_follow(&self, path: &str, mode: u32) -> Result<()> {
        let resolved = self.resolve_path(path);
        let found = self
            .lfind(&resolved, "chmod")?
            .ok_or_else(|| FsError::new(Errno::ENOENT, "chmod").with_path(&resolved))?;
        let mut meta = found.node.meta.lock();
        meta.mode = (meta.mode & S_IFMT) | (mode & MODE_PERM_MASK);
        Ok(())
    }
}

enum Deferred {
    Symlink {
        path: String,
        target: String,
        mode: Option<u32>,
        metadata: Option<Value>,
    },
    HardLink {
        path: String,
        source: String,
    },
    Mount {
        path: String,
        source: String,
        resolver: Arc<dyn ExternalFs>,
        mode: Option<u32>,
        metadata: Option<Value>,
    },
}

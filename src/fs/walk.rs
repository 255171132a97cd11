//! POSIX name resolution over the in-memory inode graph.
//!
//! The walker serves every stat-like and lstat-like query through a single
//! `no_follow` flag; symlink expansion restarts component parsing from the
//! root with a per-walk depth budget.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Errno, FsError, Result};
use crate::vpath;

use super::inodes::Inode;
use super::MemFs;

/// Symlink expansions allowed per walk before `ELOOP`.
pub(crate) const SYMLINK_DEPTH_LIMIT: usize = 40;

/// Outcome of a successful walk.
pub(crate) struct WalkResult {
    /// Fully resolved absolute path of the located entry.
    pub path: String,
    pub basename: String,
    /// Containing directory. A root is its own parent.
    pub parent: Arc<Inode>,
    pub node: Arc<Inode>,
}

impl MemFs {
    /// Resolve an absolute path to an inode. Returns `Ok(None)` when some
    /// component does not exist; `no_follow` leaves a symlink in the final
    /// position unexpanded.
    pub(crate) fn walk(
        &self,
        path: &str,
        no_follow: bool,
        syscall: &'static str,
    ) -> Result<Option<WalkResult>> {
        let mut components = vpath::parse(path)?;
        let mut step = 0usize;
        let mut depth = 0usize;
        let mut parent: Option<Arc<Inode>> = None;

        loop {
            let basename = components[step].clone();
            let node = match &parent {
                None => self.roots.lock().get(&basename),
                Some(dir) => self.with_dir_links(dir, |links| Ok(links.get(&basename)))?,
            };
            let Some(node) = node else {
                return Ok(None);
            };
            let last = step + 1 == components.len();

            if node.is_symlink() && !(no_follow && last) {
                depth += 1;
                if depth >= SYMLINK_DEPTH_LIMIT {
                    debug!("walk: symlink budget exhausted at {}", path);
                    return Err(FsError::new(Errno::ELOOP, syscall).with_path(path));
                }
                let dirname = vpath::format(&components[..step]);
                let target = node.symlink_target().unwrap_or_default();
                let resolved = vpath::resolve(&dirname, target);
                let mut rejoined = vpath::parse(&resolved)?;
                rejoined.extend(components[step + 1..].iter().cloned());
                components = rejoined;
                step = 0;
                parent = None;
                continue;
            }

            if last {
                let resolved_path = vpath::format(&components);
                let parent = parent.unwrap_or_else(|| node.clone());
                return Ok(Some(WalkResult {
                    path: resolved_path,
                    basename,
                    parent,
                    node,
                }));
            }

            if node.is_dir() {
                parent = Some(node);
                step += 1;
                continue;
            }

            return Err(FsError::new(Errno::ENOTDIR, syscall)
                .with_path(vpath::format(&components[..=step])));
        }
    }

    /// `walk` with symlink following on the final component.
    pub(crate) fn find(&self, path: &str, syscall: &'static str) -> Result<Option<WalkResult>> {
        self.walk(path, false, syscall)
    }

    /// `walk` leaving a final-component symlink unexpanded.
    pub(crate) fn lfind(&self, path: &str, syscall: &'static str) -> Result<Option<WalkResult>> {
        self.walk(path, true, syscall)
    }
}

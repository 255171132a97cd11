//! Copy-on-read shadowing of a frozen parent file system.
//!
//! A shadow inode reuses the parent's identity fields (`dev`, `ino`, mode,
//! timestamps, `nlink`) and points back at the parent inode through
//! `shadow_root`. Contents and directory children defer to the parent until
//! the child writes; the memo table guarantees that two lookups of the same
//! parent inode yield the same shadow object.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Errno, FsError, Result};

use super::inodes::{DirState, FileState, IncomingEntry, Inode, Meta, Payload};
use super::links::LinkMap;
use super::MemFs;

impl MemFs {
    /// Derive a mutable child file system from a frozen parent.
    ///
    /// The parent must already be read-only. Case sensitivity is preserved
    /// unless explicitly widened: a case-insensitive child cannot be
    /// derived from a case-sensitive parent.
    pub fn shadow(parent: &Arc<MemFs>, ignore_case: Option<bool>) -> Result<MemFs> {
        debug!("shadow(ignore_case={:?})", ignore_case);
        if !parent.is_readonly() {
            return Err(FsError::new(Errno::EINVAL, "shadow"));
        }
        let child_ignore_case = ignore_case.unwrap_or(parent.ignore_case);
        if child_ignore_case && !parent.ignore_case {
            return Err(FsError::new(Errno::EINVAL, "shadow"));
        }

        let fs = MemFs::new_shadow(
            child_ignore_case,
            parent.clock(),
            parent.cwd(),
            Arc::clone(parent),
        );

        let parent_roots: Vec<(String, Arc<Inode>)> = {
            let roots = parent.roots.lock();
            roots
                .iter()
                .map(|(name, node)| (name.to_string(), node.clone()))
                .collect()
        };
        for (name, node) in parent_roots {
            let mirrored = fs.get_shadow(&node);
            fs.roots.lock().insert(&name, mirrored);
        }
        Ok(fs)
    }

    /// Mirror a parent inode into this (child) file system, memoized by
    /// `ino` so identity is preserved across lookups.
    pub(crate) fn get_shadow(&self, root: &Arc<Inode>) -> Arc<Inode> {
        if let Some(existing) = self.shadow_memo.get(&root.ino) {
            return existing.value().clone();
        }

        let (mode, atime_ms, mtime_ms, ctime_ms, birthtime_ms, nlink, metadata, incoming) = {
            let meta = root.meta.lock();
            (
                meta.mode,
                meta.atime_ms,
                meta.mtime_ms,
                meta.ctime_ms,
                meta.birthtime_ms,
                meta.nlink,
                meta.metadata.clone(),
                meta.incoming
                    .iter()
                    .map(|(ino, entry)| (*ino, entry.clone()))
                    .collect::<Vec<_>>(),
            )
        };

        let payload = match &root.payload {
            Payload::File(_) => Payload::File(Mutex::new(FileState::default())),
            Payload::Dir(_) => Payload::Dir(Mutex::new(DirState::Empty)),
            Payload::Symlink(target) => Payload::Symlink(target.clone()),
        };
        let node = Arc::new(Inode {
            dev: root.dev,
            ino: root.ino,
            payload,
            meta: Mutex::new(Meta {
                mode,
                atime_ms,
                mtime_ms,
                ctime_ms,
                birthtime_ms,
                nlink,
                incoming: BTreeMap::new(),
                paths: None,
                metadata,
            }),
            shadow_root: Some(root.clone()),
        });
        // Memoize before translating incoming links: a root directory's
        // incoming set references itself, and siblings may share parents.
        self.shadow_memo.insert(root.ino, node.clone());

        for (parent_ino, entry) in incoming {
            let Some(parent) = entry.parent.upgrade() else {
                continue;
            };
            let mirrored_parent = self.get_shadow(&parent);
            node.meta.lock().incoming.insert(
                parent_ino,
                IncomingEntry {
                    parent: Arc::downgrade(&mirrored_parent),
                    names: entry.names.clone(),
                },
            );
        }
        node
    }

    /// Build a shadow directory's link map by translating the parent
    /// directory's entries through the memo table.
    pub(crate) fn materialize_shadow(
        &self,
        parent_fs: &Arc<MemFs>,
        shadow_root: &Arc<Inode>,
    ) -> Result<LinkMap> {
        parent_fs.ensure_materialized(shadow_root)?;
        let entries: Vec<(String, Arc<Inode>)> = parent_fs.with_dir_links(shadow_root, |links| {
            Ok(links
                .iter()
                .map(|(name, node)| (name.to_string(), node.clone()))
                .collect())
        })?;
        let mut map = LinkMap::new(self.ignore_case);
        for (name, node) in entries {
            map.insert(&name, self.get_shadow(&node));
        }
        Ok(map)
    }
}

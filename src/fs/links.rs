//! Ordered name → inode maps.
//!
//! Every directory holds one of these, and the file system holds one more
//! as its root map (keyed by absolute root prefixes such as `/`). Ordering
//! is fixed at construction by the file-system-wide comparator.

use std::sync::Arc;

use crate::vpath;

use super::inodes::Inode;

#[derive(Clone)]
pub(crate) struct LinkMap {
    ignore_case: bool,
    entries: Vec<(String, Arc<Inode>)>,
}

impl LinkMap {
    pub fn new(ignore_case: bool) -> Self {
        Self {
            ignore_case,
            entries: Vec::new(),
        }
    }

    pub fn ignore_case(&self) -> bool {
        self.ignore_case
    }

    fn position(&self, name: &str) -> std::result::Result<usize, usize> {
        self.entries
            .binary_search_by(|(entry, _)| vpath::compare(entry, name, self.ignore_case))
    }

    pub fn get(&self, name: &str) -> Option<Arc<Inode>> {
        self.position(name)
            .ok()
            .map(|idx| self.entries[idx].1.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_ok()
    }

    /// Insert `name -> node`, returning the displaced inode if the name
    /// (under the comparator) was already present.
    pub fn insert(&mut self, name: &str, node: Arc<Inode>) -> Option<Arc<Inode>> {
        match self.position(name) {
            Ok(idx) => {
                let old = std::mem::replace(&mut self.entries[idx], (name.to_string(), node));
                Some(old.1)
            }
            Err(idx) => {
                self.entries.insert(idx, (name.to_string(), node));
                None
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<(String, Arc<Inode>)> {
        match self.position(name) {
            Ok(idx) => Some(self.entries.remove(idx)),
            Err(_) => None,
        }
    }

    /// Re-key an entry in place, keeping its inode.
    pub fn rename(&mut self, old_name: &str, new_name: &str) -> bool {
        match self.remove(old_name) {
            Some((_, node)) => {
                self.insert(new_name, node);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<Inode>)> {
        self.entries
            .iter()
            .map(|(name, node)| (name.as_str(), node))
    }
}

impl std::fmt::Debug for LinkMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkMap")
            .field("ignore_case", &self.ignore_case)
            .field("names", &self.names())
            .finish()
    }
}

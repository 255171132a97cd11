//! Axis-based tree enumeration.

use tracing::warn;

use crate::error::{Errno, FsError, Result};
use crate::vpath;

use super::stat::Stats;
use super::MemFs;

/// Direction of a [`MemFs::scan`] relative to the starting path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanAxis {
    Ancestors,
    AncestorsOrSelf,
    SelfOnly,
    DescendantsOrSelf,
    Descendants,
}

/// One candidate offered to the traversal predicates.
#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub path: String,
    pub stats: Stats,
}

type Predicate = Box<dyn Fn(&ScanEntry) -> bool>;

/// Predicates gating a scan: `accept` controls inclusion in the result,
/// `traverse` controls recursion past the candidate. Both default to
/// always-true.
#[derive(Default)]
pub struct Traversal {
    accept: Option<Predicate>,
    traverse: Option<Predicate>,
}

impl Traversal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(mut self, f: impl Fn(&ScanEntry) -> bool + 'static) -> Self {
        self.accept = Some(Box::new(f));
        self
    }

    pub fn traverse(mut self, f: impl Fn(&ScanEntry) -> bool + 'static) -> Self {
        self.traverse = Some(Box::new(f));
        self
    }

    fn accepts(&self, entry: &ScanEntry) -> bool {
        self.accept.as_ref().map_or(true, |f| f(entry))
    }

    fn traverses(&self, entry: &ScanEntry) -> bool {
        self.traverse.as_ref().map_or(true, |f| f(entry))
    }
}

impl MemFs {
    /// Enumerate paths along `axis`, following symlinks when statting
    /// candidates. Errors inside a sibling branch are swallowed so one
    /// unreadable branch does not abort the scan.
    pub fn scan(&self, path: &str, axis: ScanAxis, traversal: &Traversal) -> Result<Vec<String>> {
        self.scan_impl(path, axis, traversal, false)
    }

    /// [`MemFs::scan`] with `no_follow` statting: the starting path and
    /// every candidate are examined without expanding final symlinks.
    pub fn lscan(&self, path: &str, axis: ScanAxis, traversal: &Traversal) -> Result<Vec<String>> {
        self.scan_impl(path, axis, traversal, true)
    }

    fn scan_impl(
        &self,
        path: &str,
        axis: ScanAxis,
        traversal: &Traversal,
        no_follow: bool,
    ) -> Result<Vec<String>> {
        let resolved = self.resolve_path(path);
        let entry = self.scan_entry(&resolved, no_follow)?;
        let mut out = Vec::new();
        match axis {
            ScanAxis::SelfOnly => {
                if traversal.accepts(&entry) {
                    out.push(entry.path);
                }
            }
            ScanAxis::Ancestors | ScanAxis::AncestorsOrSelf => {
                if axis == ScanAxis::AncestorsOrSelf && traversal.accepts(&entry) {
                    out.push(entry.path.clone());
                }
                if !traversal.traverses(&entry) {
                    return Ok(out);
                }
                let mut current = entry.path;
                while !vpath::is_root(&current) {
                    current = vpath::dirname(&current);
                    let candidate = match self.scan_entry(&current, no_follow) {
                        Ok(candidate) => candidate,
                        Err(err) => {
                            warn!("scan: skipping ancestor {}: {}", current, err);
                            break;
                        }
                    };
                    if traversal.accepts(&candidate) {
                        out.push(candidate.path.clone());
                    }
                    if !traversal.traverses(&candidate) {
                        break;
                    }
                }
            }
            ScanAxis::Descendants | ScanAxis::DescendantsOrSelf => {
                let include_self = axis == ScanAxis::DescendantsOrSelf;
                self.scan_descend(&entry, traversal, no_follow, include_self, &mut out);
            }
        }
        Ok(out)
    }

    fn scan_descend(
        &self,
        entry: &ScanEntry,
        traversal: &Traversal,
        no_follow: bool,
        include_self: bool,
        out: &mut Vec<String>,
    ) {
        if include_self && traversal.accepts(entry) {
            out.push(entry.path.clone());
        }
        if !entry.stats.is_directory() || !traversal.traverses(entry) {
            return;
        }
        let names = match self.readdir(&entry.path) {
            Ok(names) => names,
            Err(err) => {
                warn!("scan: skipping unreadable directory {}: {}", entry.path, err);
                return;
            }
        };
        for name in names {
            let child_path = vpath::combine(&entry.path, &name);
            match self.scan_entry(&child_path, no_follow) {
                Ok(child) => self.scan_descend(&child, traversal, no_follow, true, out),
                Err(err) => {
                    warn!("scan: skipping {}: {}", child_path, err);
                }
            }
        }
    }

    fn scan_entry(&self, resolved: &str, no_follow: bool) -> Result<ScanEntry> {
        let found = self
            .walk(resolved, no_follow, "scandir")?
            .ok_or_else(|| FsError::new(Errno::ENOENT, "scandir").with_path(resolved))?;
        let stats = self.stats_for(&found.node);
        // Candidates keep the path they were reached by; symlinks are
        // expanded for statting only.
        Ok(ScanEntry {
            path: resolved.to_string(),
            stats,
        })
    }
}

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;

use memvfs::{ExternalFs, ExternalStat, MemFs};

static INIT: Once = Once::new();

/// Install a tracing subscriber once for the whole test binary. Honors
/// `RUST_LOG`; output is captured per test.
pub fn init_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A fresh case-sensitive file system with logging wired up.
pub fn fs() -> MemFs {
    init_logging();
    MemFs::new()
}

/// In-memory external tree with per-call counters, for pinning down how
/// lazily mounts consult their resolver.
#[derive(Default)]
pub struct FakeTree {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    special: BTreeMap<String, u32>,
    stat_calls: AtomicUsize,
    readdir_calls: AtomicUsize,
    read_calls: AtomicUsize,
}

impl FakeTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dir(mut self, path: &str) -> Self {
        self.dirs.insert(path.to_string());
        self
    }

    pub fn file(mut self, path: &str, data: &str) -> Self {
        self.files.insert(path.to_string(), data.as_bytes().to_vec());
        self
    }

    /// An entry with arbitrary mode bits (e.g. a symlink) that a mount
    /// must refuse to materialize.
    pub fn special(mut self, path: &str, mode: u32) -> Self {
        self.special.insert(path.to_string(), mode);
        self
    }

    pub fn stat_count(&self) -> usize {
        self.stat_calls.load(Ordering::Relaxed)
    }

    pub fn readdir_count(&self) -> usize {
        self.readdir_calls.load(Ordering::Relaxed)
    }

    pub fn read_count(&self) -> usize {
        self.read_calls.load(Ordering::Relaxed)
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut names = BTreeSet::new();
        for key in self
            .dirs
            .iter()
            .chain(self.files.keys())
            .chain(self.special.keys())
        {
            if let Some(rest) = key.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    names.insert(rest.to_string());
                }
            }
        }
        names.into_iter().collect()
    }
}

impl ExternalFs for FakeTree {
    fn stat_sync(&self, path: &str) -> io::Result<ExternalStat> {
        self.stat_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(mode) = self.special.get(path) {
            return Ok(ExternalStat {
                mode: *mode,
                size: 0,
            });
        }
        if self.dirs.contains(path) {
            return Ok(ExternalStat {
                mode: 0o040755,
                size: 0,
            });
        }
        if let Some(data) = self.files.get(path) {
            return Ok(ExternalStat {
                mode: 0o100644,
                size: data.len() as u64,
            });
        }
        Err(io::Error::new(io::ErrorKind::NotFound, path.to_string()))
    }

    fn readdir_sync(&self, path: &str) -> io::Result<Vec<String>> {
        self.readdir_calls.fetch_add(1, Ordering::Relaxed);
        if !self.dirs.contains(path) {
            return Err(io::Error::new(io::ErrorKind::NotFound, path.to_string()));
        }
        Ok(self.children(path))
    }

    fn read_file_sync(&self, path: &str) -> io::Result<Vec<u8>> {
        self.read_calls.fetch_add(1, Ordering::Relaxed);
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))
    }
}

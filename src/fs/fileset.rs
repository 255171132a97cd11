//! Declarative file sets for bulk population.
//!
//! A file set maps names to entries; plain strings and byte buffers stand
//! in for files, nested maps for directories. `apply` installs the set in
//! two passes so hard links, symlinks, and mounts may reference entries
//! created in the first.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use super::external::ExternalFs;

pub type FileSet = BTreeMap<String, FileSetEntry>;

#[derive(Clone)]
pub enum FileSetEntry {
    Dir {
        files: FileSet,
        mode: Option<u32>,
        metadata: Option<Value>,
    },
    File {
        data: Vec<u8>,
        mode: Option<u32>,
        metadata: Option<Value>,
    },
    /// Hard link to an existing path (applied in the deferred pass).
    HardLink { path: String },
    Symlink {
        target: String,
        mode: Option<u32>,
        metadata: Option<Value>,
    },
    Mount {
        source: String,
        resolver: Arc<dyn ExternalFs>,
        mode: Option<u32>,
        metadata: Option<Value>,
    },
    /// Remove the named entry (`rimraf`).
    Remove,
}

impl FileSetEntry {
    pub fn dir(files: FileSet) -> Self {
        FileSetEntry::Dir {
            files,
            mode: None,
            metadata: None,
        }
    }

    pub fn file(data: impl Into<Vec<u8>>) -> Self {
        FileSetEntry::File {
            data: data.into(),
            mode: None,
            metadata: None,
        }
    }

    pub fn symlink(target: impl Into<String>) -> Self {
        FileSetEntry::Symlink {
            target: target.into(),
            mode: None,
            metadata: None,
        }
    }

    pub fn hard_link(path: impl Into<String>) -> Self {
        FileSetEntry::HardLink { path: path.into() }
    }

    pub fn mount(source: impl Into<String>, resolver: Arc<dyn ExternalFs>) -> Self {
        FileSetEntry::Mount {
            source: source.into(),
            resolver,
            mode: None,
            metadata: None,
        }
    }

    pub fn with_mode(mut self, new_mode: u32) -> Self {
        match &mut self {
            FileSetEntry::Dir { mode, .. }
            | FileSetEntry::File { mode, .. }
            | FileSetEntry::Symlink { mode, .. }
            | FileSetEntry::Mount { mode, .. } => *mode = Some(new_mode),
            FileSetEntry::HardLink { .. } | FileSetEntry::Remove => {}
        }
        self
    }

    pub fn with_metadata(mut self, value: Value) -> Self {
        match &mut self {
            FileSetEntry::Dir { metadata, .. }
            | FileSetEntry::File { metadata, .. }
            | FileSetEntry::Symlink { metadata, .. }
            | FileSetEntry::Mount { metadata, .. } => *metadata = Some(value),
            FileSetEntry::HardLink { .. } | FileSetEntry::Remove => {}
        }
        self
    }
}

impl std::fmt::Debug for FileSetEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileSetEntry::Dir { files, mode, .. } => f
                .debug_struct("Dir")
                .field("entries", &files.len())
                .field("mode", mode)
                .finish(),
            FileSetEntry::File { data, mode, .. } => f
                .debug_struct("File")
                .field("len", &data.len())
                .field("mode", mode)
                .finish(),
            FileSetEntry::HardLink { path } => f.debug_tuple("HardLink").field(path).finish(),
            FileSetEntry::Symlink { target, .. } => f.debug_tuple("Symlink").field(target).finish(),
            FileSetEntry::Mount { source, .. } => f.debug_tuple("Mount").field(source).finish(),
            FileSetEntry::Remove => f.write_str("Remove"),
        }
    }
}

impl From<&str> for FileSetEntry {
    fn from(data: &str) -> Self {
        FileSetEntry::file(data.as_bytes().to_vec())
    }
}

impl From<String> for FileSetEntry {
    fn from(data: String) -> Self {
        FileSetEntry::file(data.into_bytes())
    }
}

impl From<Vec<u8>> for FileSetEntry {
    fn from(data: Vec<u8>) -> Self {
        FileSetEntry::file(data)
    }
}

impl From<&[u8]> for FileSetEntry {
    fn from(data: &[u8]) -> Self {
        FileSetEntry::file(data.to_vec())
    }
}

impl From<FileSet> for FileSetEntry {
    fn from(files: FileSet) -> Self {
        FileSetEntry::dir(files)
    }
}

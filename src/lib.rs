//! memvfs: a deterministic in-memory POSIX-like virtual file system.
//!
//! Built as a test harness: inodes with multi-parent hard-link accounting,
//! symlink resolution with loop budgets, lazily mounted external trees,
//! copy-on-read shadowing of a frozen parent file system, and a buffered
//! open-file table. Single-threaded by construction; every operation runs
//! to completion before returning.
//!
//! ```
//! use memvfs::MemFs;
//!
//! let fs = MemFs::new();
//! fs.mkdirp("/a/b").unwrap();
//! fs.write_file("/a/b/hello.txt", "hi").unwrap();
//! assert_eq!(fs.read_file("/a/b/hello.txt").unwrap(), b"hi");
//! ```

pub mod clock;
pub mod error;
pub mod fs;
pub mod vpath;

pub use clock::Clock;
pub use error::{Errno, FsError, Result};
pub use fs::external::{ExternalFs, ExternalStat, HostFs};
pub use fs::fileset::{FileSet, FileSetEntry};
pub use fs::handles::{DescriptorInfo, OpenFlags};
pub use fs::scan::{ScanAxis, ScanEntry, Traversal};
pub use fs::stat::Stats;
pub use fs::{MemFs, MemFsOptions};

use thiserror::Error;

/// The closed set of POSIX-style error codes raised by the file system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Errno {
    EACCES,
    EIO,
    ENOENT,
    EEXIST,
    ELOOP,
    ENOTDIR,
    EISDIR,
    EBADF,
    EINVAL,
    ENOTEMPTY,
    EPERM,
    EROFS,
}

impl Errno {
    /// The symbolic code name, e.g. `"ENOENT"`.
    pub fn code(self) -> &'static str {
        match self {
            Errno::EACCES => "EACCES",
            Errno::EIO => "EIO",
            Errno::ENOENT => "ENOENT",
            Errno::EEXIST => "EEXIST",
            Errno::ELOOP => "ELOOP",
            Errno::ENOTDIR => "ENOTDIR",
            Errno::EISDIR => "EISDIR",
            Errno::EBADF => "EBADF",
            Errno::EINVAL => "EINVAL",
            Errno::ENOTEMPTY => "ENOTEMPTY",
            Errno::EPERM => "EPERM",
            Errno::EROFS => "EROFS",
        }
    }

    /// The fixed human-readable description for the code.
    pub fn description(self) -> &'static str {
        match self {
            Errno::EACCES => "access denied",
            Errno::EIO => "input/output error",
            Errno::ENOENT => "no such file or directory",
            Errno::EEXIST => "file already exists",
            Errno::ELOOP => "too many levels of symbolic links",
            Errno::ENOTDIR => "not a directory",
            Errno::EISDIR => "illegal operation on a directory",
            Errno::EBADF => "bad file descriptor",
            Errno::EINVAL => "invalid argument",
            Errno::ENOTEMPTY => "directory not empty",
            Errno::EPERM => "operation not permitted",
            Errno::EROFS => "read-only file system",
        }
    }
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Error value carried out of every failed operation.
///
/// Renders as `CODE: description, syscall 'path' -> 'dest'` with the
/// optional suffixes elided when absent.
#[derive(Debug, Clone, Error)]
#[error("{}", self.render())]
pub struct FsError {
    pub code: Errno,
    pub syscall: Option<&'static str>,
    pub path: Option<String>,
    pub dest: Option<String>,
}

impl FsError {
    pub fn new(code: Errno, syscall: &'static str) -> Self {
        Self {
            code,
            syscall: Some(syscall),
            path: None,
            dest: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_dest(mut self, dest: impl Into<String>) -> Self {
        self.dest = Some(dest.into());
        self
    }

    fn render(&self) -> String {
        let mut out = format!("{}: {}", self.code.code(), self.code.description());
        if let Some(syscall) = self.syscall {
            out.push_str(", ");
            out.push_str(syscall);
        }
        if let Some(path) = &self.path {
            out.push_str(&format!(" '{}'", path));
        }
        if let Some(dest) = &self.dest {
            out.push_str(&format!(" -> '{}'", dest));
        }
        out
    }
}

pub type Result<T> = std::result::Result<T, FsError>;

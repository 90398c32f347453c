//! Purpose: Single error type shared by the generator, resolver, and package builder.
//! Exports: `Error`, `ErrorKind`, `to_exit_code`, `io_error`.
//! Role: Carry enough context (path, role, library) to diagnose a failure without internals.
//! Invariants: Kinds are never downgraded; callers decide recovery.
//! Invariants: Exit codes are stable once published.
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use libc::{EACCES, EPERM};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    Io,
    Permission,
    MissingFile,
    LibraryLoad,
    DependencyOrder,
    PackageIncomplete,
    Corrupt,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    path: Option<PathBuf>,
    role: Option<String>,
    library: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            path: None,
            role: None,
            library: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    pub fn library(&self) -> Option<&str> {
        self.library.as_deref()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_library(mut self, library: impl Into<String>) -> Self {
        self.library = Some(library.into());
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(role) = &self.role {
            write!(f, " (role: {role})")?;
        }
        if let Some(library) = &self.library {
            write!(f, " (library: {library})")?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

/// Wraps an `io::Error`, promoting `EACCES`/`EPERM` to `Permission`.
pub fn io_error(err: io::Error, path: impl Into<PathBuf>) -> Error {
    let kind = match err.raw_os_error() {
        Some(code) if code == EACCES || code == EPERM => ErrorKind::Permission,
        _ if err.kind() == io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    };
    Error::new(kind).with_path(path).with_source(err)
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::Io => 3,
        ErrorKind::Permission => 4,
        ErrorKind::MissingFile => 5,
        ErrorKind::LibraryLoad => 6,
        ErrorKind::DependencyOrder => 7,
        ErrorKind::PackageIncomplete => 8,
        ErrorKind::Corrupt => 9,
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind, io_error, to_exit_code};
    use std::error::Error as StdError;
    use std::io;

    #[test]
    fn exit_code_mapping_is_stable() {
        let cases = [
            (ErrorKind::Internal, 1),
            (ErrorKind::Usage, 2),
            (ErrorKind::Io, 3),
            (ErrorKind::Permission, 4),
            (ErrorKind::MissingFile, 5),
            (ErrorKind::LibraryLoad, 6),
            (ErrorKind::DependencyOrder, 7),
            (ErrorKind::PackageIncomplete, 8),
            (ErrorKind::Corrupt, 9),
        ];

        for (kind, code) in cases {
            assert_eq!(to_exit_code(kind), code);
        }
    }

    #[test]
    fn display_includes_context() {
        let err = Error::new(ErrorKind::LibraryLoad)
            .with_message("dlopen failed")
            .with_role("dependency")
            .with_library("libhost.so.1")
            .with_path("/opt/host/libhost.so.1");
        let text = err.to_string();
        assert!(text.starts_with("LibraryLoad: dlopen failed"));
        assert!(text.contains("(role: dependency)"));
        assert!(text.contains("(library: libhost.so.1)"));
        assert!(text.contains("(path: /opt/host/libhost.so.1)"));
    }

    #[test]
    fn io_error_promotes_permission_denied() {
        let err = io_error(io::Error::from_raw_os_error(libc::EACCES), "/x");
        assert_eq!(err.kind(), ErrorKind::Permission);
        assert!(err.source().is_some());

        let err = io_error(io::Error::from_raw_os_error(libc::ENOSPC), "/x");
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.path().map(|p| p.to_string_lossy().into_owned()), Some("/x".into()));
    }
}

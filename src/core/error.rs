use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use libc::{EACCES, EPERM, EROFS};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    ArtifactNotFound,
    SourceRead,
    DestinationWrite,
    Spawn,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    path: Option<PathBuf>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            path: None,
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

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// True when the underlying cause is an OS permission refusal
    /// (including a read-only filesystem).
    pub fn is_permission_denied(&self) -> bool {
        self.source
            .as_ref()
            .and_then(|source| source.downcast_ref::<io::Error>())
            .is_some_and(is_permission_error)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
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

pub(crate) fn is_permission_error(err: &io::Error) -> bool {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM || errno == EROFS {
        return true;
    }
    err.kind() == io::ErrorKind::PermissionDenied
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::ArtifactNotFound => 3,
        ErrorKind::SourceRead => 4,
        ErrorKind::DestinationWrite => 5,
        ErrorKind::Spawn => 6,
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind, is_permission_error, to_exit_code};
    use std::error::Error as _;

    #[test]
    fn exit_code_mapping_is_stable() {
        let cases = [
            (ErrorKind::Internal, 1),
            (ErrorKind::Usage, 2),
            (ErrorKind::ArtifactNotFound, 3),
            (ErrorKind::SourceRead, 4),
            (ErrorKind::DestinationWrite, 5),
            (ErrorKind::Spawn, 6),
        ];

        for (kind, code) in cases {
            assert_eq!(to_exit_code(kind), code);
        }
    }

    #[test]
    fn permission_errors_are_classified() {
        let err = std::io::Error::from_raw_os_error(libc::EACCES);
        assert!(is_permission_error(&err));

        let err = std::io::Error::from_raw_os_error(libc::EROFS);
        assert!(is_permission_error(&err));

        let err = std::io::Error::from_raw_os_error(libc::ENOSPC);
        assert!(!is_permission_error(&err));
    }

    #[test]
    fn display_includes_message_and_path_and_keeps_source() {
        let err = Error::new(ErrorKind::DestinationWrite)
            .with_message("failed to write staged artifact")
            .with_path("/data/libpayload.so")
            .with_source(std::io::Error::from_raw_os_error(libc::EPERM));

        let text = err.to_string();
        assert!(text.starts_with("DestinationWrite: failed to write staged artifact"));
        assert!(text.contains("(path: /data/libpayload.so)"));
        assert!(err.source().is_some());
        assert!(err.is_permission_denied());
    }
}

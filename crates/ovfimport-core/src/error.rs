//! Error types for the ovfimport core library.

use std::path::PathBuf;

/// The main error type for import and transfer operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// Malformed or unusable package descriptor.
    #[error("OVF descriptor error: {message}")]
    Descriptor { message: String },

    /// A package member could not be found.
    ///
    /// This is an expected condition while probing for optional members
    /// such as the manifest; callers decide whether it is fatal.
    #[error("package member not found: {name}")]
    MemberNotFound { name: String },

    /// An inventory lookup found nothing at the given path.
    #[error("{kind} '{path}' not found")]
    NotFound { kind: String, path: String },

    /// The platform refused to synthesize an import spec.
    #[error("{message}{}", hint.as_ref().map(|h| format!(" (hint: {h})")).unwrap_or_default())]
    ImportSpecRejected {
        message: String,
        hint: Option<String>,
    },

    /// Manifest missing, unreadable, or lacking an entry.
    #[error("manifest error: {message}")]
    Manifest { message: String },

    /// Server-computed checksum disagrees with the manifest.
    #[error("manifest checksum {expected} mismatch with uploaded checksum {actual} for file {file}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    /// A single file transfer failed; the session has been aborted.
    #[error("transfer of {file} failed: {source}")]
    Transfer {
        file: String,
        #[source]
        source: Box<Error>,
    },

    /// Transfer session negotiation or state error.
    #[error("session error: {message}")]
    Session { message: String },

    /// Error reported by the remote platform.
    #[error("platform error: {message}")]
    Platform { message: String },

    /// Deployment options document could not be decoded or encoded.
    #[error("options error: {source}")]
    Options {
        #[from]
        source: serde_json::Error,
    },

    /// The operation was cancelled by the operator.
    #[error("operation cancelled")]
    Cancelled,
}

/// A specialized Result type for ovfimport operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create a descriptor error.
    pub fn descriptor(message: impl Into<String>) -> Self {
        Self::Descriptor {
            message: message.into(),
        }
    }

    /// Create a member-not-found error.
    pub fn member_not_found(name: impl Into<String>) -> Self {
        Self::MemberNotFound { name: name.into() }
    }

    /// Create an inventory not-found error.
    pub fn not_found(kind: impl Into<String>, path: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            path: path.into(),
        }
    }

    /// Create a manifest error.
    pub fn manifest(message: impl Into<String>) -> Self {
        Self::Manifest {
            message: message.into(),
        }
    }

    /// Create a session error.
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session {
            message: message.into(),
        }
    }

    /// Create a platform error.
    pub fn platform(message: impl Into<String>) -> Self {
        Self::Platform {
            message: message.into(),
        }
    }

    /// Wrap an error as a failed transfer of `file`.
    ///
    /// Already-wrapped transfer errors are returned unchanged so the
    /// innermost file name is kept.
    pub fn transfer(file: impl Into<String>, source: Error) -> Self {
        match source {
            Self::Transfer { .. } => source,
            other => Self::Transfer {
                file: file.into(),
                source: Box::new(other),
            },
        }
    }

    /// Returns true for errors caused by a missing package member.
    pub fn is_member_not_found(&self) -> bool {
        matches!(self, Self::MemberNotFound { .. })
    }

    /// Returns true if this error (or the error it wraps) is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Transfer { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        if source.get_ref().is_some_and(|inner| inner.is::<CancelledIo>()) {
            return Self::Cancelled;
        }
        Self::io_simple(source)
    }
}

/// Marker carried inside an `io::Error` when a read was stopped by a
/// cancellation token.
///
/// Uses `ErrorKind::Other`: `Interrupted` would be retried by `io::copy`.
#[derive(Debug)]
pub(crate) struct CancelledIo;

impl std::fmt::Display for CancelledIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "operation cancelled")
    }
}

impl std::error::Error for CancelledIo {}

impl CancelledIo {
    pub(crate) fn into_io() -> std::io::Error {
        std::io::Error::other(CancelledIo)
    }
}

//! Error taxonomy shared by every layer of the crate.
//!
//! Backend-specific failures (`reqwest`, `sqlx`, `io`) are converted into
//! [`Error`] at the connection boundary. Callers branch on [`Error::kind`] or
//! on [`is_not_found`] and never need to know which backend produced the
//! failure.

use std::io;
use thiserror::Error;

/// Coarse classification of an [`Error`], stable across context wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Config,
    Auth,
    CreateFailed,
    Read,
    Backend,
    Canceled,
    DeadlineExceeded,
    Other,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("object `{name}` not found in container `{container}`")]
    ObjectNotFound { container: String, name: String },
    #[error("container `{0}` not found")]
    ContainerNotFound(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("create container `{container}`: {reason}")]
    CreateFailed { container: String, reason: String },
    #[error("read upload source: {0}")]
    Read(#[source] io::Error),
    #[error(
        "backend request failed{}: {message}",
        .status.map(|s| format!(" with status {s}")).unwrap_or_default()
    )]
    Backend { status: Option<u16>, message: String },
    #[error("operation canceled")]
    Canceled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("{context}: {source}")]
    Visit {
        context: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn object_not_found(container: impl Into<String>, name: impl Into<String>) -> Self {
        Self::ObjectNotFound {
            container: container.into(),
            name: name.into(),
        }
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend {
            status: None,
            message: msg.into(),
        }
    }

    pub fn backend_status(status: u16, msg: impl Into<String>) -> Self {
        Self::Backend {
            status: Some(status),
            message: msg.into(),
        }
    }

    /// Wrap this error with the operation that produced it.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::ObjectNotFound { .. } | Self::ContainerNotFound(_) => ErrorKind::NotFound,
            Self::Config(_) => ErrorKind::Config,
            Self::Auth(_) => ErrorKind::Auth,
            Self::CreateFailed { .. } => ErrorKind::CreateFailed,
            Self::Read(_) => ErrorKind::Read,
            Self::Backend { .. } => ErrorKind::Backend,
            Self::Canceled => ErrorKind::Canceled,
            Self::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Self::Visit { source, .. } => source
                .downcast_ref::<Error>()
                .map(Error::kind)
                .unwrap_or(ErrorKind::Other),
            Self::Context { source, .. } => source.kind(),
        }
    }

    /// HTTP status reported by the backend, looking through context wraps.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Backend { status, .. } => *status,
            Self::Context { source, .. } => source.status(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// Returns true when `err` means the object (or its container) is absent.
pub fn is_not_found(err: &Error) -> bool {
    err.is_not_found()
}

/// Attach operation context to the error side of a [`Result`].
pub trait WrapErr<T> {
    fn wrap_err(self, context: impl Into<String>) -> Result<T>;

    fn wrap_err_with<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> WrapErr<T> for Result<T> {
    fn wrap_err(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|err| err.context(context))
    }

    fn wrap_err_with<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|err| err.context(f()))
    }
}

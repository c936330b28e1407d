use thiserror::Error;

/// Failure kinds the cache distinguishes; each has its own recovery policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Connection refused/reset, auth hiccups, server errors. Retried with backoff.
    #[error("transient: {0}")]
    Transient(String),
    /// The watch cursor fell out of the remote history window. Relist at once.
    #[error("cursor expired: {0}")]
    CursorExpired(String),
    /// A single stream item could not be decoded. Skipped.
    #[error("malformed object: {0}")]
    Malformed(String),
    /// A registered handler returned an error or panicked.
    #[error("handler failed: {0}")]
    Handler(String),
    /// Invalid construction input; reported once, before anything runs.
    #[error("configuration: {0}")]
    Configuration(String),
}

impl Error {
    pub fn is_transient(&self) -> bool { matches!(self, Error::Transient(_)) }
    pub fn is_cursor_expired(&self) -> bool { matches!(self, Error::CursorExpired(_)) }
    pub fn is_malformed(&self) -> bool { matches!(self, Error::Malformed(_)) }
    pub fn is_configuration(&self) -> bool { matches!(self, Error::Configuration(_)) }

    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Transient(_) => "transient",
            Error::CursorExpired(_) => "cursor_expired",
            Error::Malformed(_) => "malformed",
            Error::Handler(_) => "handler",
            Error::Configuration(_) => "configuration",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

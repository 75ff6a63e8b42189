use serde_derive::{Deserialize, Serialize};

/// A DKV result returning Error.
pub type CResult<T> = Result<T, Error>;

/// A DKV error. Errors are serializable so they can be stored in the journal
/// and shipped across the wire inside RPC responses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Underlying engine I/O failure or corruption. Surfaced to the caller
    /// and never retried by background loops.
    Storage(String),

    /// The requested change number is below the journal's retention floor.
    /// The slave must bootstrap from a snapshot.
    ChangesUnavailable { from: u64, floor: u64 },

    /// SaveChanges received a range that does not extend the local history.
    NonContiguous { expected: u64, got: u64 },

    /// A write or membership call hit a non-leader. Carries the leader id as
    /// a redirect hint (0 if unknown).
    NotLeader { leader: u64 },

    /// A heartbeat carried a timestamp older than the stored one. Dropped
    /// silently by the discovery service; never surfaced to callers.
    StaleUpdate,

    /// Transport failure. Retried with backoff.
    Unreachable(String),

    /// Malformed request parameters. Terminal; do not retry.
    InvalidRequest(String),

    /// Data parsing or serialization failure.
    Parse(String),

    /// A value error, e.g. an unexpected on-disk entry.
    Value(String),

    /// An internal error, e.g. filesystem failures.
    Internal(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Storage(s) => write!(f, "storage failure: {}", s),
            Error::ChangesUnavailable { from, floor } => {
                write!(f, "changes from {} unavailable, retained floor is {}", from, floor)
            }
            Error::NonContiguous { expected, got } => {
                write!(f, "non-contiguous changes: expected {}, got {}", expected, got)
            }
            Error::NotLeader { leader } => write!(f, "not leader, current leader is {}", leader),
            Error::StaleUpdate => write!(f, "stale status update"),
            Error::Unreachable(s) => write!(f, "unreachable: {}", s),
            Error::InvalidRequest(s) => write!(f, "invalid request: {}", s),
            Error::Parse(s) => write!(f, "parse error: {}", s),
            Error::Value(s) => write!(f, "value error: {}", s),
            Error::Internal(s) => write!(f, "internal error: {}", s),
        }
    }
}

impl Error {
    /// The numeric code used in the RPC status envelope. 0 is reserved for OK.
    pub fn code(&self) -> i32 {
        match self {
            Error::Storage(_) => 1,
            Error::ChangesUnavailable { .. } => 2,
            Error::NonContiguous { .. } => 3,
            Error::NotLeader { .. } => 4,
            Error::StaleUpdate => 5,
            Error::Unreachable(_) => 6,
            Error::InvalidRequest(_) => 7,
            Error::Parse(_) => 8,
            Error::Value(_) => 9,
            Error::Internal(_) => 10,
        }
    }

    /// Whether a background loop may retry the failed call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Unreachable(_) | Error::NotLeader { .. } | Error::NonContiguous { .. }
        )
    }
}

/// The RPC status envelope. Code 0 is OK; non-zero codes map to the error
/// taxonomy above.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub code: i32,
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Status { code: 0, message: String::new() }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

impl From<&Error> for Status {
    fn from(err: &Error) -> Self {
        Status { code: err.code(), message: err.to_string() }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<fs_extra::error::Error> for Error {
    fn from(err: fs_extra::error::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Unreachable("request deadline exceeded".to_string())
    }
}

/// Raft core errors.
///
/// Stale-term messages and failed sends are part of normal protocol operation
/// and never surface as errors. Everything here is either a construction
/// failure or fatal to the local node's participation in consensus.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Invalid configuration, rejected at construction.
    Config(String),
    /// A storage or persistence failure. Fatal to the local node.
    IO(String),
    /// Persisted data is corrupt or was written by an incompatible version.
    InvalidData(String),
    /// A broken internal invariant.
    Internal(String),
    /// No leader became known within the wait timeout.
    NoLeader,
    /// The Raft machine has panicked and no longer handles messages.
    Stopped,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Config(s) => write!(f, "configuration error: {s}"),
            Error::IO(s) => write!(f, "io error: {s}"),
            Error::InvalidData(s) => write!(f, "invalid data: {s}"),
            Error::Internal(s) => write!(f, "internal error: {s}"),
            Error::NoLeader => write!(f, "no leader found"),
            Error::Stopped => write!(f, "raft machine stopped"),
        }
    }
}

/// A Raft core result.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::Config(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(err: crossbeam::channel::SendError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}

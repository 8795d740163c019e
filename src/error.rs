use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    /// Malformed on-disk bytes: key suffix, value encoding, block or metadata record.
    Corruption(String),
    NotFound(String),
    InvalidArgument(String),
    /// The tablet is not in a state that accepts the operation (e.g. not yet open).
    IllegalState(String),
    /// Shutdown was requested; new operations fail fast.
    ShutdownInProgress(String),
    /// Background work abandoned, either by a fault hook or by a lost race.
    Aborted(String),
    MutexPoisoned,
}

impl Error {
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }

    pub fn is_shutdown_in_progress(&self) -> bool {
        matches!(self, Error::ShutdownInProgress(_))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Corruption(format!("bincode: {}", err))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::Corruption(msg) => write!(f, "Corruption: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::IllegalState(msg) => write!(f, "Illegal state: {}", msg),
            Error::ShutdownInProgress(msg) => write!(f, "Shutdown in progress: {}", msg),
            Error::Aborted(msg) => write!(f, "Aborted: {}", msg),
            Error::MutexPoisoned => write!(f, "Mutex was poisoned"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) => Some(err),
            _ => None,
        }
    }
}

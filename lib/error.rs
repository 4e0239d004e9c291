use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}: not found")]
    NotFound(PathBuf),

    #[error("{0}: already loaded")]
    Exists(PathBuf),

    #[error("capacity exceeded: requested {requested} bytes, {available} available")]
    CapacityExceeded { requested: u64, available: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("range lock [{start}, {end}) timed out")]
    RangeTimeout { start: u64, end: u64 },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("{0}: no longer cached")]
    Stale(PathBuf),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// errno the fuse relay replies with
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::Exists(_) => libc::EEXIST,
            Error::CapacityExceeded { .. } => libc::ENOSPC,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::RangeTimeout { .. } => libc::ETIMEDOUT,
            Error::MalformedFrame(_) => libc::EPROTO,
            Error::Config(_) => libc::EINVAL,
            Error::Unsupported(_) => libc::EOPNOTSUPP,
            Error::Stale(_) => libc::ESTALE,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::MalformedFrame(e.to_string())
    }
}

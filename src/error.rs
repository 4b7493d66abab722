use std::fmt;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// Short read or write against a segment file. Fatal to the engine.
    DiskIo(&'static str),
    /// The allocator could not reserve enough segments for a bundle.
    ResourceExhausted,
    /// Chain or header inconsistency observed while reading a stored bundle.
    Corrupt(&'static str),
    /// The disk image could not be reconciled at startup. No partial restore.
    RestoreInconsistency(&'static str),
    InvalidConfig(&'static str),
    Unsupported(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::DiskIo(msg) => write!(f, "disk io error: {msg}"),
            Error::ResourceExhausted => write!(f, "storage capacity exhausted"),
            Error::Corrupt(msg) => write!(f, "corrupt data: {msg}"),
            Error::RestoreInconsistency(msg) => write!(f, "restore inconsistency: {msg}"),
            Error::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Error::Unsupported(msg) => write!(f, "unsupported: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

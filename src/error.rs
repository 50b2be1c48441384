use std::fmt::{self, Display};
use std::{io, result};
use std::net::AddrParseError;
use std::sync::PoisonError;

/// Boxed to keep `Result<T>` small regardless of which variant is in play.
#[derive(Debug)]
pub struct Error {
    err: Box<ErrorKind>,
}

#[derive(Debug)]
pub enum ErrorKind {
    /// The connection slot table is full.
    SlotsExhausted,
    /// The id's generation no longer matches the slot's current generation.
    StaleConnection,
    /// A bounded internal queue rejected an enqueue (caller should treat as backpressure).
    QueueFull,
    /// A read cursor was asked to discard more bytes than are available.
    BufferUnderflow,
    /// The socket (or TLS session) is already closed.
    Closed,
    StringError(String),
    IoError(io::Error),
    TlsError(rustls::Error),
    YamlError(serde_yaml::Error),
    PoisonError,
}

pub type Result<T> = result::Result<T, Error>;

impl Error {
    pub fn new<S: ToString>(s: S) -> Self {
        Error { err: Box::new(ErrorKind::StringError(s.to_string())) }
    }

    pub fn slots_exhausted() -> Self {
        Error { err: Box::new(ErrorKind::SlotsExhausted) }
    }

    pub fn stale() -> Self {
        Error { err: Box::new(ErrorKind::StaleConnection) }
    }

    pub fn queue_full() -> Self {
        Error { err: Box::new(ErrorKind::QueueFull) }
    }

    pub fn closed() -> Self {
        Error { err: Box::new(ErrorKind::Closed) }
    }

    pub fn buffer_underflow() -> Self {
        Error { err: Box::new(ErrorKind::BufferUnderflow) }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.err
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error { err: Box::new(ErrorKind::StringError(err.to_string())) }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error { err: Box::new(ErrorKind::IoError(err)) }
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Error { err: Box::new(ErrorKind::TlsError(err)) }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error { err: Box::new(ErrorKind::YamlError(err)) }
    }
}

impl From<AddrParseError> for Error {
    fn from(err: AddrParseError) -> Self {
        Error::new(err)
    }
}

impl<Guard> From<PoisonError<Guard>> for Error {
    fn from(_err: PoisonError<Guard>) -> Self {
        Error { err: Box::new(ErrorKind::PoisonError) }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.err.as_ref() {
            ErrorKind::SlotsExhausted => f.write_str("connection slot table is full"),
            ErrorKind::StaleConnection => f.write_str("connection id is stale"),
            ErrorKind::QueueFull => f.write_str("queue is full"),
            ErrorKind::BufferUnderflow => f.write_str("buffer underflow"),
            ErrorKind::Closed => f.write_str("socket is closed"),
            ErrorKind::StringError(s) => f.write_str(s),
            ErrorKind::IoError(e) => Display::fmt(e, f),
            ErrorKind::TlsError(e) => Display::fmt(e, f),
            ErrorKind::YamlError(e) => Display::fmt(e, f),
            ErrorKind::PoisonError => f.write_str("another thread panicked while holding the mutex"),
        }
    }
}

impl std::error::Error for Error {}

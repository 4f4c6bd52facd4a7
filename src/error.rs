/*!
Errors produced while configuring and writing.

All errors on the write path are [`io::Error`]s so [`crate::Rollout`] can be used anywhere an [`io::Write`] is expected.
*/

use std::{error, fmt, io, sync::Arc};

/**
An error attempting to parse a destination [`crate::Template`] or [`crate::TimeFormat`].
*/
pub struct Error(Box<dyn error::Error + Send + Sync>);

impl Error {
    pub(crate) fn new(e: impl Into<Box<dyn error::Error + Send + Sync>>) -> Self {
        Error(e.into())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.0.source()
    }
}

/**
The error returned when writing to a [`crate::Rollout`] after it has been closed.

It's carried as the inner error of an [`io::Error`]. Use [`is_closed`] to detect it.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closed;

impl fmt::Display for Closed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("write stream closed")
    }
}

impl error::Error for Closed {}

/**
Whether `err` was produced by writing to a closed [`crate::Rollout`].
*/
pub fn is_closed(err: &io::Error) -> bool {
    err.get_ref()
        .map(|inner| inner.is::<Closed>())
        .unwrap_or(false)
}

pub(crate) fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::Other, Closed)
}

pub(crate) fn short_write() -> io::Error {
    io::Error::new(io::ErrorKind::WriteZero, "short write")
}

/**
A sink error that has been latched by a [`crate::BufferWriter`].

The first failure is kept and handed back, wrapped in a fresh [`io::Error`] of the same kind, on every later attempt.
*/
#[derive(Debug, Clone)]
pub(crate) struct Latched(Arc<io::Error>);

impl Latched {
    pub(crate) fn new(err: io::Error) -> Self {
        Latched(Arc::new(err))
    }

    pub(crate) fn to_io_error(&self) -> io::Error {
        io::Error::new(self.0.kind(), self.clone())
    }
}

impl fmt::Display for Latched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl error::Error for Latched {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&*self.0)
    }
}

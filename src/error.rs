//! Crate-wide error type.
//!
//! Reactor and scheduler internals never propagate errors into a running
//! fiber: those are logged and the affected registration is treated as
//! failed. This type is for what a fiber observes when it calls a [hooked
//! I/O wrapper](crate::hook) or a [configuration](crate::config) loader.

use std::fmt;
use std::os::unix::io::RawFd;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all error cases surfaced by the crate's public API.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation timed out")]
    TimedOut,

    #[error("bad file descriptor: {fd}")]
    BadDescriptor { fd: RawFd },

    #[error("reactor {op} failed for fd {fd}: {source}")]
    ReactorProgramming {
        fd: RawFd,
        op: &'static str,
        source: std::io::Error,
    },

    #[error("fd {fd} already has a waiter registered for {event}")]
    AlreadyRegistered { fd: RawFd, event: &'static str },

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    /// This should only be used if the error doesn't fall into one of the
    /// above categories.
    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

const _: () = {
    /// Assert Error implements Send + Sync
    const fn if_this_compiles_the_type_implements_send_and_sync<T: Send + Sync>() {}
    if_this_compiles_the_type_implements_send_and_sync::<Error>();
};

impl Error {
    #[inline(always)]
    pub fn other<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Other(error.into())
    }

    /// Returns the name of the variant as it is spelled in the source code.
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::Io(_) => "Io",
            Self::TimedOut => "TimedOut",
            Self::BadDescriptor { .. } => "BadDescriptor",
            Self::ReactorProgramming { .. } => "ReactorProgramming",
            Self::AlreadyRegistered { .. } => "AlreadyRegistered",
            Self::Config(_) => "Config",
            Self::Other(_) => "Other",
        }
    }

    /// True for errors that originated as [`std::io::ErrorKind::WouldBlock`].
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::WouldBlock)
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            Error::TimedOut => std::io::Error::new(std::io::ErrorKind::TimedOut, e_to_string(&e)),
            other => std::io::Error::new(std::io::ErrorKind::Other, e_to_string(&other)),
        }
    }
}

fn e_to_string(e: &Error) -> String {
    struct Once<'a>(&'a Error);
    impl fmt::Display for Once<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            fmt::Display::fmt(self.0, f)
        }
    }
    Once(e).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_names_are_distinct() {
        let errs: Vec<Error> = vec![
            Error::TimedOut,
            Error::BadDescriptor { fd: 3 },
            Error::AlreadyRegistered {
                fd: 3,
                event: "read",
            },
        ];
        let names: Vec<_> = errs.iter().map(Error::variant_name).collect();
        assert_eq!(names, ["TimedOut", "BadDescriptor", "AlreadyRegistered"]);
    }

    #[test]
    fn io_roundtrip() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        let err: Error = io_err.into();
        assert_eq!(err.variant_name(), "Io");
    }
}

//! Error classes and error values
//!
//! Two layers exist. An [`ErrorKind`] is the class recorded in the `Status` of a completed
//! request, `ErrorKind::Success` included, and has a stable raw code. An [`Error`] is what an
//! operation returns when it fails synchronously and carries whatever context was available.

use std::os::raw::c_int;

use thiserror::Error;

use crate::{Rank, Tag};

/// Raw code of `ErrorKind::Success`, for easier checking of raw status codes
pub const SUCCESS: c_int = 0;

macro_rules! build_error_kind {
    {
        $(#[$doc:meta])*
        pub enum $name:ident {
            $(
                 #[$err_doc:meta]
                 #[code($code:expr)]
                 $rust_err:ident,
            )*
        }
    } => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $(
            #[$err_doc]
            $rust_err,
            )*
        }

        impl $name {
            /// The raw code of this error class.
            pub fn code(self) -> c_int {
                match self {
                    $(
                    $name::$rust_err => $code,
                    )*
                }
            }

            /// Convert a raw code into an error class, as a Rust enum.
            pub fn from_code(code: c_int) -> Option<$name> {
                $(
                if code == $code {
                    return Some($name::$rust_err)
                }
                )*
                None
            }
        }
    }
}

build_error_kind! {
    /// Set of error classes a request status can report.
    ///
    /// The raw codes follow the numbering of the MPICH error classes where one exists.
    pub enum ErrorKind {
        /// No error
        #[code(SUCCESS)]
        Success,
        /// Invalid buffer descriptor
        #[code(1)]
        Buffer,
        /// Invalid count argument
        #[code(2)]
        Count,
        /// Invalid datatype argument, or a datatype that could not be decoded
        #[code(3)]
        Type,
        /// Invalid tag argument
        #[code(4)]
        Tag,
        /// Invalid rank argument
        #[code(6)]
        Rank,
        /// Message truncated on receive
        #[code(14)]
        Truncate,
        /// Failure reported by a transport
        #[code(15)]
        Transport,
        /// Internal (implementation) error
        #[code(16)]
        Intern,
        /// Queue element or staging buffer allocation failed
        #[code(34)]
        Exhausted,
        /// The request was cancelled
        #[code(64)]
        Cancelled,
    }
}

impl ErrorKind {
    /// `true` for `ErrorKind::Success`
    pub fn is_success(self) -> bool {
        self == ErrorKind::Success
    }
}

/// Errors returned by matching engine operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The buffer descriptor is not usable, e.g. no storage but a positive count.
    #[error("invalid buffer: {0}")]
    Buffer(&'static str),
    /// An element count does not fit the buffer or the datatype.
    #[error("invalid count: {0}")]
    Count(&'static str),
    /// The datatype cannot be used for this operation.
    #[error("invalid datatype: {0}")]
    Type(&'static str),
    /// A tag that is neither non-negative nor a permitted wildcard.
    #[error("invalid tag {0}")]
    Tag(Tag),
    /// A rank that is neither a known endpoint nor a permitted wildcard.
    #[error("invalid rank {0}")]
    Rank(Rank),
    /// More bytes arrived than the receive buffer could hold.
    #[error("message truncated: {received} bytes arrived for a buffer of {capacity} bytes")]
    Truncate {
        /// Number of bytes that arrived
        received: usize,
        /// Number of bytes the receive could accept
        capacity: usize,
    },
    /// A transport failed.
    #[error("transport failure: {0}")]
    Transport(String),
    /// An invariant of the engine was violated.
    #[error("internal error: {0}")]
    Intern(String),
    /// No queue element or staging buffer could be allocated.
    #[error("queue element or staging buffer allocation exhausted")]
    Exhausted,
    /// The request was cancelled.
    #[error("request was cancelled")]
    Cancelled,
}

impl Error {
    /// The status class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Buffer(_) => ErrorKind::Buffer,
            Error::Count(_) => ErrorKind::Count,
            Error::Type(_) => ErrorKind::Type,
            Error::Tag(_) => ErrorKind::Tag,
            Error::Rank(_) => ErrorKind::Rank,
            Error::Truncate { .. } => ErrorKind::Truncate,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Intern(_) => ErrorKind::Intern,
            Error::Exhausted => ErrorKind::Exhausted,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub(crate) fn intern(msg: impl Into<String>) -> Error {
        Error::Intern(msg.into())
    }
}

/// Result type of matching engine operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Allocate a zero filled byte buffer, reporting `Exhausted` instead of aborting.
pub(crate) fn try_alloc_bytes(len: usize) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    bytes.try_reserve_exact(len).map_err(|_| Error::Exhausted)?;
    bytes.resize(len, 0);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for kind in [
            ErrorKind::Success,
            ErrorKind::Buffer,
            ErrorKind::Truncate,
            ErrorKind::Intern,
            ErrorKind::Exhausted,
            ErrorKind::Cancelled,
        ] {
            assert_eq!(ErrorKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(ErrorKind::from_code(9999), None);
        assert_eq!(ErrorKind::Success.code(), SUCCESS);
    }

    #[test]
    fn errors_map_to_kinds() {
        let truncate = Error::Truncate {
            received: 12,
            capacity: 8,
        };
        assert_eq!(truncate.kind(), ErrorKind::Truncate);
        assert_eq!(
            truncate.to_string(),
            "message truncated: 12 bytes arrived for a buffer of 8 bytes"
        );
        assert_eq!(Error::intern("lost").kind(), ErrorKind::Intern);
        assert!(!Error::Cancelled.kind().is_success());
    }
}

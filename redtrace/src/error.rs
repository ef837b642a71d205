// Copyright 2019 Authors of Red Sift
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::TryReserveError;
use std::io;

/// Base of the session's own error codes, above any errno value.
pub const EDT_BASE: i32 = 1000;
pub const EDT_NOMEM: i32 = EDT_BASE + 1;
pub const EDT_COMPILER: i32 = EDT_BASE + 2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("memory allocation failure")]
    NoMem,
    #[error("kernel query failed (errno {0})")]
    Query(i32),
    #[error("failed to create format: {0}")]
    Format(String),
}

impl Error {
    /// The value stored in the session's error state for this error.
    pub fn code(&self) -> i32 {
        match self {
            Error::NoMem => EDT_NOMEM,
            Error::Query(errno) => *errno,
            Error::Format(_) => EDT_COMPILER,
        }
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

impl From<TryReserveError> for Error {
    fn from(_e: TryReserveError) -> Error {
        Error::NoMem
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        match e.raw_os_error() {
            Some(libc::ENOMEM) => Error::NoMem,
            Some(errno) => Error::Query(errno),
            None => Error::Query(libc::EIO),
        }
    }
}

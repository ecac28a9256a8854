// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::libc::{
    c_int,
    EIO,
    ETIMEDOUT,
};
use ::std::{
    error,
    fmt,
    io,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Failure of a runtime, socket, or TLS operation. Carries the OS error
/// code (or a synthetic one such as [`ETIMEDOUT`]) and a cause string.
#[derive(Clone)]
pub struct Fail {
    /// Error code.
    pub errno: c_int,
    /// Cause.
    pub cause: String,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Fail {
    /// Creates a new failure with the given error code and cause.
    pub fn new(errno: c_int, cause: &str) -> Self {
        Self {
            errno,
            cause: cause.to_string(),
        }
    }

    /// Creates a failure that represents an expired deadline.
    pub fn timed_out(cause: &str) -> Self {
        Self::new(ETIMEDOUT, cause)
    }

    /// Whether this failure represents an expired deadline.
    pub fn is_timed_out(&self) -> bool {
        self.errno == ETIMEDOUT
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Display for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error {:?}: {:?}", self.errno, self.cause)
    }
}

impl fmt::Debug for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error {:?}: {:?}", self.errno, self.cause)
    }
}

impl error::Error for Fail {}

impl From<io::Error> for Fail {
    fn from(e: io::Error) -> Self {
        Self {
            errno: e.raw_os_error().unwrap_or(EIO),
            cause: e.to_string(),
        }
    }
}

// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Shuffle read error types

use std::{
    error::Error,
    fmt::{Display, Formatter},
    io, result,
    sync::Arc,
};

/// Result type alias for shuffle read operations.
pub type Result<T> = result::Result<T, ShuffleReadError>;

/// Failure cause shared between the read scheduler and every subpartition
/// reader it fails with the same error.
pub type FailureCause = Arc<ShuffleReadError>;

/// Errors raised while scheduling and serving sort-merge shuffle reads.
#[derive(Debug)]
pub enum ShuffleReadError {
    /// The partition or reader was released before the operation ran.
    AlreadyReleased(String),
    /// No read buffer could be obtained from the pool in time while this
    /// scheduler held none.
    BufferRequestTimeout(String),
    /// A single subpartition reader failed while reading its data.
    ConsumerReadFailure(String),
    /// Returning buffers to the pool failed. Not locally recoverable.
    RecycleFailure(String),
    /// I/O operation error.
    IoError(io::Error),
    /// Configuration error with invalid settings.
    Configuration(String),
    /// Internal error indicating a bug or unexpected state.
    Internal(String),
    /// General error with a descriptive message.
    General(String),
}

impl ShuffleReadError {
    /// Returns true if this error was caused by a release of the partition.
    pub fn is_already_released(&self) -> bool {
        matches!(self, ShuffleReadError::AlreadyReleased(_))
    }
}

impl From<io::Error> for ShuffleReadError {
    fn from(e: io::Error) -> Self {
        ShuffleReadError::IoError(e)
    }
}

impl Display for ShuffleReadError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            ShuffleReadError::AlreadyReleased(desc) => {
                write!(f, "Already released: {desc}")
            }
            ShuffleReadError::BufferRequestTimeout(desc) => {
                write!(f, "Buffer request timeout: {desc}")
            }
            ShuffleReadError::ConsumerReadFailure(desc) => {
                write!(f, "Subpartition read failure: {desc}")
            }
            ShuffleReadError::RecycleFailure(desc) => {
                write!(f, "Buffer recycle failure: {desc}")
            }
            ShuffleReadError::IoError(desc) => write!(f, "IO error: {desc}"),
            ShuffleReadError::Configuration(desc) => {
                write!(f, "Configuration error: {desc}")
            }
            ShuffleReadError::Internal(desc) => {
                write!(f, "Internal shuffle read error: {desc}")
            }
            ShuffleReadError::General(desc) => write!(f, "General error: {desc}"),
        }
    }
}

impl Error for ShuffleReadError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ShuffleReadError::IoError(e) => Some(e),
            _ => None,
        }
    }
}

/// Renders the payload of a caught panic for error messages.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handles an error that leaves shared accounting in an unknown state by
/// logging it and terminating the process.
pub(crate) fn fatal_error(error: ShuffleReadError) -> ! {
    log::error!("Fatal error in shuffle read path, aborting the process: {error}");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = ShuffleReadError::AlreadyReleased("partition p-1".to_string());
        assert_eq!(err.to_string(), "Already released: partition p-1");

        let err = ShuffleReadError::from(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "short read",
        ));
        assert_eq!(err.to_string(), "IO error: short read");
        assert!(err.source().is_some());
    }

    #[test]
    fn test_is_already_released() {
        assert!(ShuffleReadError::AlreadyReleased(String::new()).is_already_released());
        assert!(
            !ShuffleReadError::BufferRequestTimeout(String::new()).is_already_released()
        );
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(format!("code {}", 7));
        assert_eq!(panic_message(payload.as_ref()), "code 7");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}

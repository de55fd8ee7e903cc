// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]

//! A Fuse file system presenting one virtual namespace backed by two storage
//! tiers.
//!
//! daifs joins a slow, authoritative "remote" directory tree and a fast
//! "local" cache tree into a single mount. The first access to a path
//! mirrors its remote object into the local tier: regular files are copied
//! by an external helper process, directory nodes are created in place.
//! Every later access is served from the local copy; everything else is
//! passed through to the corresponding host file system calls.
//!
//! The crate is split into a few pieces:
//! * Path resolution. A virtual path deterministically maps to one absolute
//!   path per tier; resolution is pure and rejects traversal and over-long
//!   paths before anything touches the disk.
//! * Materialization. Cache entries are populated out-of-process via the
//!   host copy utilities, bounded by a timeout, with at-most-once semantics
//!   per path under concurrency.
//! * The file system driver. A [`mirror::MirrorFs`] implements the
//!   `fuse-backend-rs` filesystem traits and plugs into its fusedev
//!   transport; the `daifsd` binary wires the two together.

#[macro_use]
extern crate log;

use std::error;
use std::fmt;
use std::io;
use std::path::PathBuf;

pub use mirror::MaterializeError;

/// Error codes for mirror file system operations.
#[derive(Debug)]
pub enum Error {
    /// Tier root configuration is missing or invalid.
    BadConfig(String),
    /// A resolved path would exceed the supported maximum length.
    PathTooLong(PathBuf),
    /// A virtual path carries `.` or `..` components and could escape its
    /// tier root.
    UnsafePath(PathBuf),
    /// Populating the local tier failed.
    Materialize(MaterializeError),
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Materialize(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;
        match self {
            BadConfig(msg) => write!(f, "invalid configuration: {}", msg),
            PathTooLong(path) => write!(f, "resolved path too long for {:?}", path),
            UnsafePath(path) => write!(f, "unsafe virtual path {:?}", path),
            Materialize(err) => write!(f, "failed to populate local tier: {}", err),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        let errno = match &e {
            Error::BadConfig(_) => libc::EINVAL,
            Error::PathTooLong(_) => libc::ENAMETOOLONG,
            Error::UnsafePath(_) => libc::EINVAL,
            Error::Materialize(_) => libc::EIO,
        };
        io::Error::from_raw_os_error(errno)
    }
}

/// Result for mirror file system operations.
pub type Result<T> = std::result::Result<T, Error>;

pub mod mirror;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_to_errno() {
        let e: io::Error = Error::PathTooLong(PathBuf::from("/x")).into();
        assert_eq!(e.raw_os_error(), Some(libc::ENAMETOOLONG));

        let e: io::Error = Error::UnsafePath(PathBuf::from("/..")).into();
        assert_eq!(e.raw_os_error(), Some(libc::EINVAL));

        let e: io::Error = Error::BadConfig("missing".to_string()).into();
        assert_eq!(e.raw_os_error(), Some(libc::EINVAL));
    }
}

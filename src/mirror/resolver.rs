// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::path::{Component, Path, PathBuf};

use crate::{Error, Result};

/// Longest supported resolved path in bytes, tier-root prefix included.
pub const MAX_PATH_LEN: usize = 4096;

/// The two physical locations corresponding to one virtual path.
///
/// A pair is computed for the duration of a single operation and dropped at
/// its end; it is never cached or shared across operations.
#[derive(Clone, Debug)]
pub struct ResolvedPaths {
    virtual_path: PathBuf,
    remote: PathBuf,
    local: PathBuf,
}

impl ResolvedPaths {
    /// The path in the unified namespace this pair was resolved for.
    pub fn virtual_path(&self) -> &Path {
        &self.virtual_path
    }

    /// The absolute path of the object in the remote tier.
    pub fn remote(&self) -> &Path {
        &self.remote
    }

    /// The absolute path of the object in the local cache tier.
    pub fn local(&self) -> &Path {
        &self.local
    }
}

/// Derives remote and local tier paths from virtual paths.
pub struct PathResolver {
    remote_root: PathBuf,
    local_root: PathBuf,
}

impl PathResolver {
    pub fn new(remote_root: PathBuf, local_root: PathBuf) -> Self {
        PathResolver {
            remote_root,
            local_root,
        }
    }

    /// Resolve `virtual_path` against both tier roots.
    ///
    /// The virtual path must be `/`-rooted and made of plain components:
    /// `.` and `..` are rejected before any concatenation happens, so a
    /// crafted name can never escape a tier root. Resolved paths of
    /// [`MAX_PATH_LEN`] bytes or more are rejected rather than truncated.
    pub fn resolve(&self, virtual_path: &Path) -> Result<ResolvedPaths> {
        for component in virtual_path.components() {
            match component {
                Component::RootDir | Component::Normal(_) => {}
                _ => return Err(Error::UnsafePath(virtual_path.to_path_buf())),
            }
        }

        let rel = virtual_path.strip_prefix("/").unwrap_or(virtual_path);
        let remote = self.remote_root.join(rel);
        let local = self.local_root.join(rel);

        if remote.as_os_str().len() >= MAX_PATH_LEN || local.as_os_str().len() >= MAX_PATH_LEN {
            return Err(Error::PathTooLong(virtual_path.to_path_buf()));
        }

        Ok(ResolvedPaths {
            virtual_path: virtual_path.to_path_buf(),
            remote,
            local,
        })
    }
}

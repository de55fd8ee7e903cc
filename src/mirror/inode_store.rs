// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{Inode, InodeData};

/// Bidirectional table mapping inode numbers to virtual paths.
#[derive(Default)]
pub struct InodeStore {
    data: BTreeMap<Inode, Arc<InodeData>>,
    by_path: BTreeMap<PathBuf, Inode>,
}

impl InodeStore {
    /// Insert an inode into the store.
    ///
    /// The caller needs to ensure that no other inode is registered for the
    /// same virtual path, otherwise the old mapping gets lost.
    pub fn insert(&mut self, data: Arc<InodeData>) {
        self.by_path.insert(data.path(), data.inode);
        self.data.insert(data.inode, data);
    }

    pub fn remove(&mut self, inode: &Inode) -> Option<Arc<InodeData>> {
        let data = self.data.remove(inode);
        if let Some(data) = data.as_ref() {
            // Only drop the path mapping while it still points at this inode;
            // a racing lookup may have re-registered the path already.
            let path = data.path();
            if self.by_path.get(&path) == Some(&data.inode) {
                self.by_path.remove(&path);
            }
        }
        data
    }

    /// Move the mapping for `old` over to `new`, keeping inode number and
    /// reference count intact.
    pub fn rename(&mut self, old: &Path, new: &Path) {
        if let Some(inode) = self.by_path.remove(old) {
            if let Some(data) = self.data.get(&inode) {
                data.set_path(new.to_path_buf());
            }
            self.by_path.insert(new.to_path_buf(), inode);
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.by_path.clear();
    }

    pub fn get(&self, inode: &Inode) -> Option<&Arc<InodeData>> {
        self.data.get(inode)
    }

    pub fn get_by_path(&self, path: &Path) -> Option<&Arc<InodeData>> {
        let inode = self.by_path.get(path)?;
        self.get(inode)
    }
}

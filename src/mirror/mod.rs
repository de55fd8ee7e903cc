// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fuse file system mirroring a remote directory tree into a local cache.
//!
//! The file system presents one virtual namespace backed by two physical
//! tiers: a slow, authoritative "remote" tree and a fast "local" cache tree.
//! The first access to a path mirrors its remote object into the local tier
//! (files are copied, directory nodes created); every later access is served
//! from the local copy. Apart from that the requests are passed through to
//! the underlying file system.
#![allow(missing_docs)]

use std::collections::{btree_map, BTreeMap, HashMap};
use std::ffi::CStr;
use std::fs::File;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};

use fuse_backend_rs::api::filesystem::{Entry, ROOT_ID};
use fuse_backend_rs::api::VFS_MAX_INO;

pub use self::config::{Config, COPY_TIMEOUT_ENV, LOCAL_ROOT_ENV, REMOTE_ROOT_ENV};
pub use self::materializer::{MaterializeError, Materializer};
pub use self::resolver::{PathResolver, ResolvedPaths, MAX_PATH_LEN};

use self::inode_store::InodeStore;
use self::util::ebadf;
use crate::Error;

mod config;
mod inode_store;
mod materializer;
mod resolver;
mod sync_io;
mod util;

type Inode = u64;
type Handle = u64;

/// Represents an inode in `MirrorFs`: one node of the virtual namespace.
///
/// Only the virtual path is recorded; the physical tier paths are recomputed
/// for every operation so each access takes its own mirror decision.
#[derive(Debug)]
pub struct InodeData {
    inode: Inode,
    path: RwLock<PathBuf>,
    refcount: AtomicU64,
}

impl InodeData {
    fn new(inode: Inode, path: PathBuf, refcount: u64) -> Self {
        InodeData {
            inode,
            path: RwLock::new(path),
            refcount: AtomicU64::new(refcount),
        }
    }

    fn path(&self) -> PathBuf {
        // Do not expect poisoned lock here, so safe to unwrap().
        self.path.read().unwrap().clone()
    }

    fn set_path(&self, path: PathBuf) {
        *self.path.write().unwrap() = path;
    }
}

/// Data structures to manage accessed inodes.
struct InodeMap {
    inodes: RwLock<InodeStore>,
}

impl InodeMap {
    fn new() -> Self {
        InodeMap {
            inodes: RwLock::new(Default::default()),
        }
    }

    fn clear(&self) {
        // Do not expect poisoned lock here, so safe to unwrap().
        self.inodes.write().unwrap().clear();
    }

    fn get(&self, inode: Inode) -> io::Result<Arc<InodeData>> {
        // Do not expect poisoned lock here, so safe to unwrap().
        self.inodes
            .read()
            .unwrap()
            .get(&inode)
            .map(Arc::clone)
            .ok_or_else(ebadf)
    }

    fn get_by_path(&self, path: &Path) -> Option<Arc<InodeData>> {
        self.inodes
            .read()
            .unwrap()
            .get_by_path(path)
            .map(Arc::clone)
    }

    fn get_map_mut(&self) -> RwLockWriteGuard<InodeStore> {
        // Do not expect poisoned lock here, so safe to unwrap().
        self.inodes.write().unwrap()
    }

    fn insert(&self, data: Arc<InodeData>) {
        self.get_map_mut().insert(data);
    }
}

enum HandleSource {
    File(File),
    Dir(PathBuf),
}

pub struct HandleData {
    inode: Inode,
    source: HandleSource,
}

impl HandleData {
    fn new_file(inode: Inode, file: File) -> Self {
        HandleData {
            inode,
            source: HandleSource::File(file),
        }
    }

    fn new_dir(inode: Inode, path: PathBuf) -> Self {
        HandleData {
            inode,
            source: HandleSource::Dir(path),
        }
    }

    fn get_file(&self) -> io::Result<&File> {
        match &self.source {
            HandleSource::File(file) => Ok(file),
            HandleSource::Dir(_) => Err(ebadf()),
        }
    }

    fn dir_path(&self) -> io::Result<&Path> {
        match &self.source {
            HandleSource::Dir(path) => Ok(path),
            HandleSource::File(_) => Err(ebadf()),
        }
    }
}

struct HandleMap {
    handles: RwLock<BTreeMap<Handle, Arc<HandleData>>>,
}

impl HandleMap {
    fn new() -> Self {
        HandleMap {
            handles: RwLock::new(BTreeMap::new()),
        }
    }

    fn clear(&self) {
        // Do not expect poisoned lock here, so safe to unwrap().
        self.handles.write().unwrap().clear();
    }

    fn insert(&self, handle: Handle, data: HandleData) {
        // Do not expect poisoned lock here, so safe to unwrap().
        self.handles.write().unwrap().insert(handle, Arc::new(data));
    }

    fn release(&self, handle: Handle, inode: Inode) -> io::Result<()> {
        // Do not expect poisoned lock here, so safe to unwrap().
        let mut handles = self.handles.write().unwrap();

        if let btree_map::Entry::Occupied(e) = handles.entry(handle) {
            if e.get().inode == inode {
                // The file is closed automatically when the last `Arc` is
                // dropped.
                e.remove();
                return Ok(());
            }
        }

        Err(ebadf())
    }

    fn get(&self, handle: Handle, inode: Inode) -> io::Result<Arc<HandleData>> {
        // Do not expect poisoned lock here, so safe to unwrap().
        self.handles
            .read()
            .unwrap()
            .get(&handle)
            .filter(|hd| hd.inode == inode)
            .map(Arc::clone)
            .ok_or_else(ebadf)
    }
}

/// Single-flight table serializing materialization per resolved local path.
///
/// Concurrent accesses to one not-yet-cached path either wait for the
/// in-flight materialization or trigger exactly one; a token stays in the
/// table once created, marking the materialization as in progress or done.
struct MirrorLocks {
    tokens: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl MirrorLocks {
    fn new() -> Self {
        MirrorLocks {
            tokens: Mutex::new(HashMap::new()),
        }
    }

    fn token(&self, path: &Path) -> Arc<Mutex<()>> {
        // Do not expect poisoned lock here, so safe to unwrap().
        let mut tokens = self.tokens.lock().unwrap();
        tokens.entry(path.to_path_buf()).or_default().clone()
    }
}

/// A file system that lazily mirrors a remote tree into a local cache tree.
///
/// Reads are served from whichever tier owns the object: mirrored regular
/// files from the local copy, everything else from the remote side. Writes
/// land in the local tier only; content is never propagated back.
pub struct MirrorFs {
    inode_map: InodeMap,
    next_inode: AtomicU64,

    // Handles for open files and directories handed out to the kernel.
    handle_map: HandleMap,
    next_handle: AtomicU64,

    resolver: PathResolver,
    materializer: Materializer,
    mirror_locks: MirrorLocks,

    cfg: Config,
}

impl MirrorFs {
    /// Create a mirror file system instance.
    pub fn new(cfg: Config) -> io::Result<MirrorFs> {
        cfg.validate().map_err(io::Error::from)?;

        Ok(MirrorFs {
            inode_map: InodeMap::new(),
            next_inode: AtomicU64::new(ROOT_ID + 1),

            handle_map: HandleMap::new(),
            next_handle: AtomicU64::new(1),

            resolver: PathResolver::new(cfg.remote_root.clone(), cfg.local_root.clone()),
            materializer: Materializer::new(&cfg),
            mirror_locks: MirrorLocks::new(),

            cfg,
        })
    }

    /// Initialize the mirror file system.
    ///
    /// Both tier roots must exist as directories before anything is mounted.
    pub fn import(&self) -> io::Result<()> {
        for root in [&self.cfg.remote_root, &self.cfg.local_root] {
            let st = util::lstat(root).map_err(|e| {
                error!("mirror: import: cannot stat tier root {:?}: {}", root, e);
                e
            })?;
            if !util::is_dir(&st) {
                error!("mirror: import: tier root {:?} is not a directory", root);
                return Err(io::Error::from_raw_os_error(libc::ENOTDIR));
            }
        }

        // Clear the umask so the client can set all the bits in the mode.
        // Safe because this doesn't modify any memory and always succeeds.
        unsafe { libc::umask(0o000) };

        // Not sure why the root inode gets a refcount of 2 but that's what
        // libfuse does.
        self.inode_map
            .insert(Arc::new(InodeData::new(ROOT_ID, PathBuf::from("/"), 2)));

        Ok(())
    }

    /// The mirror step: make sure the local tier holds whatever the remote
    /// tier has for `virtual_path`, then hand both resolved paths back.
    ///
    /// Present local objects win without looking at the remote side. A
    /// missing remote counterpart is not an error here; later stages fall
    /// back to the remote path and report their own failures. A failed
    /// materialization is reported as `EIO`, distinguishable from the
    /// not-found of a genuinely absent file.
    fn ensure_local(&self, virtual_path: &Path) -> io::Result<ResolvedPaths> {
        let paths = self
            .resolver
            .resolve(virtual_path)
            .map_err(io::Error::from)?;

        if util::lstat_opt(paths.local())?.is_some() {
            return Ok(paths);
        }

        let token = self.mirror_locks.token(paths.local());
        // Do not expect poisoned lock here, so safe to unwrap().
        let _guard = token.lock().unwrap();

        // Somebody else may have finished the copy while we waited for the
        // token.
        if util::lstat_opt(paths.local())?.is_some() {
            return Ok(paths);
        }

        let st = match util::lstat_opt(paths.remote())? {
            Some(st) => st,
            None => return Ok(paths),
        };

        if util::is_regular(&st) {
            debug!(
                "mirror: caching file {:?} -> {:?}",
                paths.remote(),
                paths.local()
            );
            self.materializer
                .copy_file(paths.remote(), paths.local())
                .map_err(|e| self.materialize_failed(&paths, e))?;
        } else if util::is_dir(&st) {
            debug!("mirror: caching directory node {:?}", paths.local());
            self.materializer
                .make_directory(paths.local())
                .map_err(|e| self.materialize_failed(&paths, e))?;
        } else {
            // Symlinks and special files stay remote-only.
            debug!(
                "mirror: not caching {:?}, mode {:o}",
                paths.virtual_path(),
                st.st_mode
            );
        }

        Ok(paths)
    }

    fn materialize_failed(&self, paths: &ResolvedPaths, e: MaterializeError) -> io::Error {
        error!("mirror: caching {:?} failed: {}", paths.virtual_path(), e);
        io::Error::from(Error::Materialize(e))
    }

    /// Pick the tier that owns the attributes of this object: mirrored
    /// regular files are served from the local copy, everything else from
    /// the remote side. Objects without a remote counterpart were created
    /// through this mount and live in the local tier only.
    fn tier_stat(&self, paths: &ResolvedPaths) -> io::Result<libc::stat64> {
        match util::lstat_opt(paths.remote())? {
            Some(st) if util::is_regular(&st) => util::lstat(paths.local()),
            Some(st) => Ok(st),
            None => util::lstat(paths.local()),
        }
    }

    /// The physical path single-path read-side operations act on: the local
    /// copy when one exists, the remote object otherwise.
    fn pick_existing(&self, paths: &ResolvedPaths) -> io::Result<PathBuf> {
        if util::lstat_opt(paths.local())?.is_some() {
            Ok(paths.local().to_path_buf())
        } else {
            Ok(paths.remote().to_path_buf())
        }
    }

    fn do_lookup(&self, parent: Inode, name: &CStr) -> io::Result<Entry> {
        util::validate_name(name)?;

        let data = self.inode_map.get(parent)?;
        let path = data
            .path()
            .join(std::ffi::OsStr::from_bytes(name.to_bytes()));

        let paths = self.ensure_local(&path)?;
        let st = self.tier_stat(&paths)?;
        let inode = self.allocate_inode(&path)?;

        Ok(Entry {
            inode,
            generation: 0,
            attr: st,
            attr_flags: 0,
            attr_timeout: self.cfg.attr_timeout,
            entry_timeout: self.cfg.entry_timeout,
        })
    }

    fn root_entry(&self) -> io::Result<Entry> {
        let paths = self.ensure_local(Path::new("/"))?;
        let st = self.tier_stat(&paths)?;

        Ok(Entry {
            inode: ROOT_ID,
            generation: 0,
            attr: st,
            attr_flags: 0,
            attr_timeout: self.cfg.attr_timeout,
            entry_timeout: self.cfg.entry_timeout,
        })
    }

    fn allocate_inode(&self, path: &Path) -> io::Result<Inode> {
        let mut found = None;
        'search: loop {
            match self.inode_map.get_by_path(path) {
                // No existing entry found
                None => break 'search,
                Some(data) => {
                    let curr = data.refcount.load(Ordering::Acquire);
                    // forget_one() has just destroyed the entry, retry...
                    if curr == 0 {
                        continue 'search;
                    }

                    // Saturating add to avoid integer overflow, it's not
                    // realistic to saturate u64.
                    let new = curr.saturating_add(1);

                    // Synchronizes with the forget_one()
                    if data
                        .refcount
                        .compare_exchange(curr, new, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        found = Some(data.inode);
                        break;
                    }
                }
            }
        }

        if let Some(inode) = found {
            return Ok(inode);
        }

        let mut inodes = self.inode_map.get_map_mut();

        // Look up the path again after acquiring the write lock, as a racing
        // thread may have registered it while we were not holding the lock.
        match inodes.get_by_path(path) {
            Some(data) => {
                data.refcount.fetch_add(1, Ordering::Relaxed);
                Ok(data.inode)
            }
            None => {
                let inode = self.next_inode.fetch_add(1, Ordering::Relaxed);
                if inode > VFS_MAX_INO {
                    error!("mirror: max inode number reached: {}", VFS_MAX_INO);
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        format!("max inode number reached: {VFS_MAX_INO}"),
                    ));
                }
                inodes.insert(Arc::new(InodeData::new(inode, path.to_path_buf(), 1)));
                Ok(inode)
            }
        }
    }

    fn forget_one(&self, inodes: &mut InodeStore, inode: Inode, count: u64) {
        // ROOT_ID should not be forgotten, or we're not able to access to
        // files any more.
        if inode == ROOT_ID {
            return;
        }

        if let Some(data) = inodes.get(&inode) {
            // A previous lookup may have acquired a reference to the inode
            // data and be in the process of updating the refcount, so loop
            // until we can decrement successfully.
            loop {
                let curr = data.refcount.load(Ordering::Acquire);

                // Saturating sub because it doesn't make sense for a refcount
                // to go below zero and we don't want misbehaving clients to
                // cause integer overflow.
                let new = curr.saturating_sub(count);

                // Synchronizes with the acquire load in `allocate_inode`.
                if data
                    .refcount
                    .compare_exchange(curr, new, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    if new == 0 {
                        // We just removed the last refcount for this inode.
                        inodes.remove(&inode);
                    }
                    break;
                }
            }
        }
    }

    fn allocate_handle(&self, data: HandleData) -> Handle {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handle_map.insert(handle, data);
        handle
    }

    fn do_release(&self, inode: Inode, handle: Handle) -> io::Result<()> {
        self.handle_map.release(handle, inode)
    }
}

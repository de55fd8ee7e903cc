// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::any::Any;
use std::ffi::{CStr, OsStr};
use std::fs::{self, File};
use std::io;
use std::mem::{ManuallyDrop, MaybeUninit};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::DirEntryExt;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::Path;
use std::time::Duration;

use fuse_backend_rs::abi::fuse_abi::CreateIn;
use fuse_backend_rs::api::filesystem::{
    Context, DirEntry, Entry, FileSystem, FsOptions, GetxattrReply, ListxattrReply, OpenOptions,
    SetattrValid, ZeroCopyReader, ZeroCopyWriter,
};
use fuse_backend_rs::api::{BackendFileSystem, VFS_MAX_INO};

use super::util::{self, einval};
use super::{Handle, HandleData, Inode, MirrorFs, ResolvedPaths};

impl MirrorFs {
    fn child_path(&self, parent: Inode, name: &CStr) -> io::Result<std::path::PathBuf> {
        util::validate_name(name)?;
        let data = self.inode_map.get(parent)?;
        Ok(data.path().join(OsStr::from_bytes(name.to_bytes())))
    }

    fn do_open(&self, inode: Inode, flags: u32) -> io::Result<Handle> {
        let data = self.inode_map.get(inode)?;
        let paths = self.ensure_local(&data.path())?;

        // The local path is opened unconditionally; when nothing could be
        // mirrored this fails with the not-found the caller expects.
        let file = util::open_path(paths.local(), flags as i32, 0)?;

        Ok(self.allocate_handle(HandleData::new_file(inode, file)))
    }

    fn do_readdir(
        &self,
        inode: Inode,
        handle: Handle,
        size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(DirEntry) -> io::Result<usize>,
    ) -> io::Result<()> {
        if size == 0 {
            return Ok(());
        }

        let data = self.handle_map.get(handle, inode)?;
        let dir = data.dir_path()?;

        // The directory is re-read on every call; entries carry the host
        // inode number and type bits straight from the underlying entries.
        let mut added = 0;
        for (index, dent) in fs::read_dir(dir)?.enumerate().skip(offset as usize) {
            let res = dent.and_then(|dent| {
                let name = dent.file_name();
                let file_type = dent.file_type()?;
                add_entry(DirEntry {
                    ino: dent.ino(),
                    offset: (index + 1) as u64,
                    type_: util::dirent_type(&file_type),
                    name: name.as_bytes(),
                })
            });

            match res {
                Ok(0) => break,
                Ok(_) => added += 1,
                // An error can only be signalled before any entry was stored,
                // otherwise the lookup counts of the stored entries would be
                // wrong. Return what was collected up to this point.
                Err(e) if added == 0 => return Err(e),
                Err(_) => return Ok(()),
            }
        }

        Ok(())
    }

    fn do_setattr(
        &self,
        inode: Inode,
        attr: libc::stat64,
        handle: Option<Handle>,
        valid: SetattrValid,
    ) -> io::Result<(libc::stat64, Duration)> {
        let data = self.inode_map.get(inode)?;
        let paths = self.ensure_local(&data.path())?;
        let target = self.pick_existing(&paths)?;
        let cpath = util::to_cstring(&target)?;

        if valid.contains(SetattrValid::MODE) {
            // Safe because this doesn't modify any memory and we check the
            // return value.
            let res = unsafe { libc::chmod(cpath.as_ptr(), attr.st_mode & 0o7777) };
            if res < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        if valid.intersects(SetattrValid::UID | SetattrValid::GID) {
            let uid = if valid.contains(SetattrValid::UID) {
                attr.st_uid
            } else {
                // Cannot use -1 here because these are unsigned values.
                u32::MAX
            };
            let gid = if valid.contains(SetattrValid::GID) {
                attr.st_gid
            } else {
                u32::MAX
            };

            // Safe because this doesn't modify any memory and we check the
            // return value.
            let res = unsafe { libc::lchown(cpath.as_ptr(), uid, gid) };
            if res < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        if valid.contains(SetattrValid::SIZE) {
            let res = match handle.and_then(|h| self.handle_map.get(h, inode).ok()) {
                Some(hd) => {
                    let file = hd.get_file()?;
                    // Safe because this doesn't modify any memory and we
                    // check the return value.
                    unsafe { libc::ftruncate64(file.as_raw_fd(), attr.st_size) }
                }
                // There is no guarantee the kernel sends the file handle
                // along, so fall back to the path.
                None => unsafe { libc::truncate64(cpath.as_ptr(), attr.st_size) },
            };
            if res < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        if valid.intersects(
            SetattrValid::ATIME
                | SetattrValid::ATIME_NOW
                | SetattrValid::MTIME
                | SetattrValid::MTIME_NOW,
        ) {
            let mut tvs = [
                libc::timespec {
                    tv_sec: 0,
                    tv_nsec: libc::UTIME_OMIT,
                },
                libc::timespec {
                    tv_sec: 0,
                    tv_nsec: libc::UTIME_OMIT,
                },
            ];

            if valid.contains(SetattrValid::ATIME_NOW) {
                tvs[0].tv_nsec = libc::UTIME_NOW;
            } else if valid.contains(SetattrValid::ATIME) {
                tvs[0].tv_sec = attr.st_atime;
                tvs[0].tv_nsec = attr.st_atime_nsec;
            }

            if valid.contains(SetattrValid::MTIME_NOW) {
                tvs[1].tv_nsec = libc::UTIME_NOW;
            } else if valid.contains(SetattrValid::MTIME) {
                tvs[1].tv_sec = attr.st_mtime;
                tvs[1].tv_nsec = attr.st_mtime_nsec;
            }

            // Don't use utimes() since it follows symlinks.
            // Safe because this doesn't modify any memory and we check the
            // return value.
            let res = unsafe {
                libc::utimensat(
                    libc::AT_FDCWD,
                    cpath.as_ptr(),
                    tvs.as_ptr(),
                    libc::AT_SYMLINK_NOFOLLOW,
                )
            };
            if res < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        let st = self.tier_stat(&paths)?;
        Ok((st, self.cfg.attr_timeout))
    }

    /// Apply `op` to the object in every tier it exists in.
    ///
    /// Removing only one tier would make the object reappear on the next
    /// access, so namespace mutations hit both sides.
    fn remove_both(
        &self,
        paths: &ResolvedPaths,
        op: impl Fn(&Path) -> io::Result<()>,
    ) -> io::Result<()> {
        let mut removed = false;
        for path in [paths.local(), paths.remote()] {
            match op(path) {
                Ok(()) => removed = true,
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
                Err(e) => return Err(e),
            }
        }
        if removed {
            Ok(())
        } else {
            Err(util::enoent())
        }
    }
}

impl FileSystem for MirrorFs {
    type Inode = Inode;
    type Handle = Handle;

    fn init(&self, _capable: FsOptions) -> io::Result<FsOptions> {
        Ok(FsOptions::empty())
    }

    fn destroy(&self) {
        self.handle_map.clear();
        self.inode_map.clear();
    }

    fn statfs(&self, _ctx: &Context, inode: Inode) -> io::Result<libc::statvfs64> {
        let data = self.inode_map.get(inode)?;
        let paths = self
            .resolver
            .resolve(&data.path())
            .map_err(io::Error::from)?;
        let cpath = util::to_cstring(&self.pick_existing(&paths)?)?;

        let mut out = MaybeUninit::<libc::statvfs64>::zeroed();
        // Safe because this will only modify `out` and we check the return
        // value.
        match unsafe { libc::statvfs64(cpath.as_ptr(), out.as_mut_ptr()) } {
            // Safe because the kernel guarantees that `out` has been
            // initialized.
            0 => Ok(unsafe { out.assume_init() }),
            _ => Err(io::Error::last_os_error()),
        }
    }

    fn lookup(&self, _ctx: &Context, parent: Inode, name: &CStr) -> io::Result<Entry> {
        self.do_lookup(parent, name)
    }

    fn forget(&self, _ctx: &Context, inode: Inode, count: u64) {
        let mut inodes = self.inode_map.get_map_mut();

        self.forget_one(&mut inodes, inode, count)
    }

    fn batch_forget(&self, _ctx: &Context, requests: Vec<(Inode, u64)>) {
        let mut inodes = self.inode_map.get_map_mut();

        for (inode, count) in requests {
            self.forget_one(&mut inodes, inode, count)
        }
    }

    fn getattr(
        &self,
        _ctx: &Context,
        inode: Inode,
        _handle: Option<Handle>,
    ) -> io::Result<(libc::stat64, Duration)> {
        let data = self.inode_map.get(inode)?;
        let paths = self.ensure_local(&data.path())?;
        let st = self.tier_stat(&paths)?;

        Ok((st, self.cfg.attr_timeout))
    }

    fn setattr(
        &self,
        _ctx: &Context,
        inode: Inode,
        attr: libc::stat64,
        handle: Option<Handle>,
        valid: SetattrValid,
    ) -> io::Result<(libc::stat64, Duration)> {
        self.do_setattr(inode, attr, handle, valid)
    }

    fn readlink(&self, _ctx: &Context, inode: Inode) -> io::Result<Vec<u8>> {
        let data = self.inode_map.get(inode)?;
        let paths = self
            .resolver
            .resolve(&data.path())
            .map_err(io::Error::from)?;

        // Link targets are read from the remote tree and never mirrored;
        // only links created through this mount live in the local tier.
        let target = match fs::read_link(paths.remote()) {
            Ok(target) => target,
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => fs::read_link(paths.local())?,
            Err(e) => return Err(e),
        };

        Ok(target.into_os_string().into_vec())
    }

    fn symlink(
        &self,
        _ctx: &Context,
        linkname: &CStr,
        parent: Inode,
        name: &CStr,
    ) -> io::Result<Entry> {
        let path = self.child_path(parent, name)?;
        let paths = self.resolver.resolve(&path).map_err(io::Error::from)?;
        let cpath = util::to_cstring(paths.local())?;

        // New objects are born in the local tier.
        // Safe because this doesn't modify any memory and we check the return
        // value.
        let res = unsafe { libc::symlink(linkname.as_ptr(), cpath.as_ptr()) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }

        self.do_lookup(parent, name)
    }

    fn mknod(
        &self,
        _ctx: &Context,
        parent: Inode,
        name: &CStr,
        mode: u32,
        rdev: u32,
        umask: u32,
    ) -> io::Result<Entry> {
        let path = self.child_path(parent, name)?;
        let paths = self.resolver.resolve(&path).map_err(io::Error::from)?;
        let mode = mode & !umask;

        if mode & libc::S_IFMT == libc::S_IFREG {
            // This is more portable than calling mknod for plain files.
            let file = util::open_path(
                paths.local(),
                libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY,
                mode & 0o7777,
            )?;
            drop(file);
        } else {
            let cpath = util::to_cstring(paths.local())?;
            // Safe because this doesn't modify any memory and we check the
            // return value.
            let res = if mode & libc::S_IFMT == libc::S_IFIFO {
                unsafe { libc::mkfifo(cpath.as_ptr(), mode & 0o7777) }
            } else {
                unsafe { libc::mknod(cpath.as_ptr(), mode, u64::from(rdev)) }
            };
            if res < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        self.do_lookup(parent, name)
    }

    fn mkdir(
        &self,
        _ctx: &Context,
        parent: Inode,
        name: &CStr,
        mode: u32,
        umask: u32,
    ) -> io::Result<Entry> {
        let path = self.child_path(parent, name)?;
        let paths = self.resolver.resolve(&path).map_err(io::Error::from)?;
        let cpath = util::to_cstring(paths.local())?;

        // Safe because this doesn't modify any memory and we check the return
        // value.
        let res = unsafe { libc::mkdir(cpath.as_ptr(), mode & !umask) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }

        self.do_lookup(parent, name)
    }

    fn unlink(&self, _ctx: &Context, parent: Inode, name: &CStr) -> io::Result<()> {
        let path = self.child_path(parent, name)?;
        let paths = self.resolver.resolve(&path).map_err(io::Error::from)?;

        self.remove_both(&paths, |p| fs::remove_file(p))
    }

    fn rmdir(&self, _ctx: &Context, parent: Inode, name: &CStr) -> io::Result<()> {
        let path = self.child_path(parent, name)?;
        let paths = self.resolver.resolve(&path).map_err(io::Error::from)?;

        self.remove_both(&paths, |p| fs::remove_dir(p))
    }

    fn rename(
        &self,
        _ctx: &Context,
        olddir: Inode,
        oldname: &CStr,
        newdir: Inode,
        newname: &CStr,
        flags: u32,
    ) -> io::Result<()> {
        if flags != 0 {
            return Err(einval());
        }

        let old_path = self.child_path(olddir, oldname)?;
        let new_path = self.child_path(newdir, newname)?;
        let old = self.resolver.resolve(&old_path).map_err(io::Error::from)?;
        let new = self.resolver.resolve(&new_path).map_err(io::Error::from)?;

        let mut renamed = false;
        for (from, to) in [
            (old.local(), new.local()),
            (old.remote(), new.remote()),
        ] {
            match fs::rename(from, to) {
                Ok(()) => renamed = true,
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
                Err(e) => return Err(e),
            }
        }
        if !renamed {
            return Err(util::enoent());
        }

        // Keep the nodeid the kernel holds for the moved object usable. The
        // paths of entries below a moved directory are refreshed lazily by
        // the kernel's re-lookups.
        self.inode_map.get_map_mut().rename(&old_path, &new_path);

        Ok(())
    }

    fn link(
        &self,
        _ctx: &Context,
        inode: Inode,
        newparent: Inode,
        newname: &CStr,
    ) -> io::Result<Entry> {
        let data = self.inode_map.get(inode)?;
        // Hard links need a local link target, so mirror it first.
        let paths = self.ensure_local(&data.path())?;

        let new_path = self.child_path(newparent, newname)?;
        let new = self.resolver.resolve(&new_path).map_err(io::Error::from)?;
        let scpath = util::to_cstring(paths.local())?;
        let dcpath = util::to_cstring(new.local())?;

        // Safe because this doesn't modify any memory and we check the return
        // value.
        let res = unsafe { libc::link(scpath.as_ptr(), dcpath.as_ptr()) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }

        self.do_lookup(newparent, newname)
    }

    fn open(
        &self,
        _ctx: &Context,
        inode: Inode,
        flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<(Option<Handle>, OpenOptions, Option<u32>)> {
        let handle = self.do_open(inode, flags)?;

        Ok((Some(handle), OpenOptions::empty(), None))
    }

    fn create(
        &self,
        _ctx: &Context,
        parent: Inode,
        name: &CStr,
        args: CreateIn,
    ) -> io::Result<(Entry, Option<Handle>, OpenOptions, Option<u32>)> {
        let path = self.child_path(parent, name)?;
        let paths = self.resolver.resolve(&path).map_err(io::Error::from)?;

        // New files are born in the local tier; content is never written
        // back to the remote side.
        let file = util::open_path(
            paths.local(),
            args.flags as i32 | libc::O_CREAT,
            args.mode & !args.umask & 0o7777,
        )?;

        let entry = self.do_lookup(parent, name)?;
        let handle = self.allocate_handle(HandleData::new_file(entry.inode, file));

        Ok((entry, Some(handle), OpenOptions::empty(), None))
    }

    fn read(
        &self,
        _ctx: &Context,
        inode: Inode,
        handle: Handle,
        w: &mut dyn ZeroCopyWriter,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _flags: u32,
    ) -> io::Result<usize> {
        match self.handle_map.get(handle, inode) {
            Ok(data) => {
                let file = data.get_file()?;
                // Manually implement File::try_clone() by borrowing the fd of
                // `file` instead of dup(). Safe because `data` lives for the
                // whole function, so the fd won't be closed under us.
                let f = unsafe { File::from_raw_fd(file.as_raw_fd()) };
                let mut f = ManuallyDrop::new(f);

                w.write_from(&mut *f, size as usize, offset)
            }
            // Reads arriving without a usable handle are served by opening
            // the local copy directly.
            Err(_) => {
                let data = self.inode_map.get(inode)?;
                let paths = self.ensure_local(&data.path())?;
                let mut file = util::open_path(paths.local(), libc::O_RDONLY, 0)?;

                w.write_from(&mut file, size as usize, offset)
            }
        }
    }

    fn write(
        &self,
        _ctx: &Context,
        inode: Inode,
        handle: Handle,
        r: &mut dyn ZeroCopyReader,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _delayed_write: bool,
        _flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<usize> {
        let data = self.handle_map.get(handle, inode)?;
        let file = data.get_file()?;
        // See the comment in read().
        let f = unsafe { File::from_raw_fd(file.as_raw_fd()) };
        let mut f = ManuallyDrop::new(f);

        r.read_to(&mut *f, size as usize, offset)
    }

    fn flush(&self, _ctx: &Context, inode: Inode, handle: Handle, _lock_owner: u64) -> io::Result<()> {
        // Writes go straight to the local file, nothing is buffered here;
        // just make sure the handle is valid.
        self.handle_map.get(handle, inode).map(|_| ())
    }

    fn fsync(&self, _ctx: &Context, inode: Inode, datasync: bool, handle: Handle) -> io::Result<()> {
        let data = self.handle_map.get(handle, inode)?;
        let fd = data.get_file()?.as_raw_fd();

        // Safe because this doesn't modify any memory and we check the return
        // value.
        let res = if datasync {
            unsafe { libc::fdatasync(fd) }
        } else {
            unsafe { libc::fsync(fd) }
        };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn fsyncdir(
        &self,
        _ctx: &Context,
        inode: Inode,
        _datasync: bool,
        handle: Handle,
    ) -> io::Result<()> {
        // Directory handles only carry a path; listings are re-read per
        // request, so there is nothing to sync.
        self.handle_map.get(handle, inode).map(|_| ())
    }

    fn fallocate(
        &self,
        _ctx: &Context,
        inode: Inode,
        handle: Handle,
        mode: u32,
        offset: u64,
        length: u64,
    ) -> io::Result<()> {
        if mode != 0 {
            return Err(io::Error::from_raw_os_error(libc::EOPNOTSUPP));
        }

        let data = self.handle_map.get(handle, inode)?;
        let fd = data.get_file()?.as_raw_fd();

        // posix_fallocate returns the error number instead of setting errno.
        // Safe because this doesn't modify any memory.
        let res = unsafe {
            libc::posix_fallocate64(fd, offset as libc::off64_t, length as libc::off64_t)
        };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(res))
        }
    }

    fn release(
        &self,
        _ctx: &Context,
        inode: Inode,
        _flags: u32,
        handle: Handle,
        _flush: bool,
        _flock_release: bool,
        _lock_owner: Option<u64>,
    ) -> io::Result<()> {
        self.do_release(inode, handle)
    }

    fn setxattr(
        &self,
        _ctx: &Context,
        inode: Inode,
        name: &CStr,
        value: &[u8],
        flags: u32,
    ) -> io::Result<()> {
        let data = self.inode_map.get(inode)?;
        let paths = self.ensure_local(&data.path())?;
        let cpath = util::to_cstring(paths.local())?;

        // Safe because this doesn't modify any memory and we check the return
        // value.
        let res = unsafe {
            libc::lsetxattr(
                cpath.as_ptr(),
                name.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                flags as libc::c_int,
            )
        };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn getxattr(
        &self,
        _ctx: &Context,
        inode: Inode,
        name: &CStr,
        size: u32,
    ) -> io::Result<GetxattrReply> {
        let data = self.inode_map.get(inode)?;
        let paths = self
            .resolver
            .resolve(&data.path())
            .map_err(io::Error::from)?;
        let cpath = util::to_cstring(&self.pick_existing(&paths)?)?;

        let mut buf = vec![0u8; size as usize];
        // Safe because this will only modify the contents of `buf` and we
        // check the return value.
        let res = unsafe {
            libc::lgetxattr(
                cpath.as_ptr(),
                name.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_void,
                size as usize,
            )
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }

        if size == 0 {
            Ok(GetxattrReply::Count(res as u32))
        } else {
            buf.truncate(res as usize);
            Ok(GetxattrReply::Value(buf))
        }
    }

    fn listxattr(&self, _ctx: &Context, inode: Inode, size: u32) -> io::Result<ListxattrReply> {
        let data = self.inode_map.get(inode)?;
        let paths = self
            .resolver
            .resolve(&data.path())
            .map_err(io::Error::from)?;
        let cpath = util::to_cstring(&self.pick_existing(&paths)?)?;

        let mut buf = vec![0u8; size as usize];
        // Safe because this will only modify the contents of `buf` and we
        // check the return value.
        let res = unsafe {
            libc::llistxattr(
                cpath.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_char,
                size as usize,
            )
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }

        if size == 0 {
            Ok(ListxattrReply::Count(res as u32))
        } else {
            buf.truncate(res as usize);
            Ok(ListxattrReply::Names(buf))
        }
    }

    fn removexattr(&self, _ctx: &Context, inode: Inode, name: &CStr) -> io::Result<()> {
        let data = self.inode_map.get(inode)?;
        let paths = self.ensure_local(&data.path())?;
        let cpath = util::to_cstring(paths.local())?;

        // Safe because this doesn't modify any memory and we check the return
        // value.
        let res = unsafe { libc::lremovexattr(cpath.as_ptr(), name.as_ptr()) };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn opendir(
        &self,
        _ctx: &Context,
        inode: Inode,
        _flags: u32,
    ) -> io::Result<(Option<Handle>, OpenOptions)> {
        let data = self.inode_map.get(inode)?;
        let paths = self.ensure_local(&data.path())?;

        // Listings always come from the remote tree; only directories created
        // through this mount are listed from the local side.
        let dir = if util::lstat_opt(paths.remote())?.is_some() {
            paths.remote().to_path_buf()
        } else {
            paths.local().to_path_buf()
        };

        // Probe the directory now so open errors surface at opendir time.
        fs::read_dir(&dir)?;

        let handle = self.allocate_handle(HandleData::new_dir(inode, dir));

        Ok((Some(handle), OpenOptions::empty()))
    }

    fn readdir(
        &self,
        _ctx: &Context,
        inode: Inode,
        handle: Handle,
        size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(DirEntry) -> io::Result<usize>,
    ) -> io::Result<()> {
        self.do_readdir(inode, handle, size, offset, add_entry)
    }

    fn releasedir(
        &self,
        _ctx: &Context,
        inode: Inode,
        _flags: u32,
        handle: Handle,
    ) -> io::Result<()> {
        self.do_release(inode, handle)
    }

    fn access(&self, _ctx: &Context, inode: Inode, mask: u32) -> io::Result<()> {
        let data = self.inode_map.get(inode)?;
        let paths = self.ensure_local(&data.path())?;

        // Permissions are evaluated against the authoritative remote copy;
        // the local one only rules for objects that never had a remote
        // counterpart.
        let target = if util::lstat_opt(paths.remote())?.is_some() {
            paths.remote().to_path_buf()
        } else {
            paths.local().to_path_buf()
        };
        let cpath = util::to_cstring(&target)?;

        // Safe because this doesn't modify any memory and we check the return
        // value.
        let res = unsafe { libc::access(cpath.as_ptr(), mask as libc::c_int) };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

impl MirrorFs {
    fn copy_file_range(
        &self,
        _ctx: &Context,
        inode_in: Inode,
        handle_in: Handle,
        offset_in: u64,
        inode_out: Inode,
        handle_out: Handle,
        offset_out: u64,
        len: u64,
        flags: u64,
    ) -> io::Result<usize> {
        let data_in = self.handle_map.get(handle_in, inode_in)?;
        let data_out = self.handle_map.get(handle_out, inode_out)?;
        let fd_in = data_in.get_file()?.as_raw_fd();
        let fd_out = data_out.get_file()?.as_raw_fd();

        let mut off_in = offset_in as libc::loff_t;
        let mut off_out = offset_out as libc::loff_t;

        // Safe because this will only modify `off_in` and `off_out` and we
        // check the return value.
        let res = unsafe {
            libc::copy_file_range(
                fd_in,
                &mut off_in,
                fd_out,
                &mut off_out,
                len as usize,
                flags as libc::c_uint,
            )
        };
        if res >= 0 {
            Ok(res as usize)
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

impl BackendFileSystem for MirrorFs {
    fn mount(&self) -> io::Result<(Entry, u64)> {
        let entry = self.root_entry()?;
        Ok((entry, VFS_MAX_INO))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::tests::prepare_mirrorfs;
    use fuse_backend_rs::api::filesystem::ROOT_ID;
    use std::ffi::CString;
    use std::os::unix::fs::{FileExt, PermissionsExt};

    fn name(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    #[test]
    fn test_lookup_and_getattr_remote_only_file() {
        let t = prepare_mirrorfs();
        fs::write(t.remote_path("hello.txt"), b"hello, tier").unwrap();

        let ctx = Context::default();
        let entry = t.fs.lookup(&ctx, ROOT_ID, &name("hello.txt")).unwrap();
        assert_eq!(entry.attr.st_size, 12);
        assert_eq!(t.copies(), 1);

        let (st, duration) = t.fs.getattr(&ctx, entry.inode, None).unwrap();
        assert_eq!(st.st_size, 12);
        assert_eq!(duration, t.fs.cfg.attr_timeout);
        // Still exactly one materialization.
        assert_eq!(t.copies(), 1);
    }

    #[test]
    fn test_lookup_absent_path() {
        let t = prepare_mirrorfs();

        let ctx = Context::default();
        let err = t.fs.lookup(&ctx, ROOT_ID, &name("missing")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
        assert_eq!(t.copies(), 0);
    }

    #[test]
    fn test_lookup_rejects_unsafe_names() {
        let t = prepare_mirrorfs();

        let ctx = Context::default();
        for bad in [".", "..", "a/b"] {
            let err = t.fs.lookup(&ctx, ROOT_ID, &name(bad)).unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::EINVAL), "{}", bad);
        }
    }

    #[test]
    fn test_open_read_round_trip() {
        let t = prepare_mirrorfs();
        let content = b"round trip through the local tier".to_vec();
        fs::write(t.remote_path("data.bin"), &content).unwrap();

        let ctx = Context::default();
        let entry = t.fs.lookup(&ctx, ROOT_ID, &name("data.bin")).unwrap();
        let (handle, _, _) = t
            .fs
            .open(&ctx, entry.inode, libc::O_RDONLY as u32, 0)
            .unwrap();

        let data = t.fs.handle_map.get(handle.unwrap(), entry.inode).unwrap();
        let file = data.get_file().unwrap();
        let mut buf = vec![0u8; content.len()];
        file.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(buf, content);

        // The bytes really came from the local copy.
        assert_eq!(fs::read(t.local_path("data.bin")).unwrap(), content);
        assert_eq!(t.copies(), 1);

        t.fs.release(&ctx, entry.inode, 0, handle.unwrap(), false, false, None)
            .unwrap();
        assert!(t.fs.handle_map.get(handle.unwrap(), entry.inode).is_err());
    }

    #[test]
    fn test_open_absent_file() {
        let t = prepare_mirrorfs();
        fs::write(t.remote_path("f"), b"x").unwrap();

        let ctx = Context::default();
        let entry = t.fs.lookup(&ctx, ROOT_ID, &name("f")).unwrap();
        // Remove both tiers behind the kernel's back; open falls through to
        // the local path and reports not-found.
        fs::remove_file(t.remote_path("f")).unwrap();
        fs::remove_file(t.local_path("f")).unwrap();

        let err = t
            .fs
            .open(&ctx, entry.inode, libc::O_RDONLY as u32, 0)
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn test_readdir_lists_remote_only() {
        let t = prepare_mirrorfs();
        fs::write(t.remote_path("a.txt"), b"a").unwrap();
        fs::create_dir(t.remote_path("subdir")).unwrap();
        // A file that exists only in the local tier is not part of listings.
        fs::write(t.local_path("local-only"), b"x").unwrap();

        let ctx = Context::default();
        let (handle, _) = t.fs.opendir(&ctx, ROOT_ID, 0).unwrap();

        let mut seen = Vec::new();
        t.fs.readdir(&ctx, ROOT_ID, handle.unwrap(), 4096, 0, &mut |d| {
            seen.push((String::from_utf8(d.name.to_vec()).unwrap(), d.type_));
            Ok(1)
        })
        .unwrap();
        seen.sort();

        assert_eq!(
            seen,
            vec![
                ("a.txt".to_string(), u32::from(libc::DT_REG)),
                ("subdir".to_string(), u32::from(libc::DT_DIR)),
            ]
        );
    }

    #[test]
    fn test_readdir_offset_resumes() {
        let t = prepare_mirrorfs();
        for n in ["a", "b", "c"] {
            fs::write(t.remote_path(n), b"x").unwrap();
        }

        let ctx = Context::default();
        let (handle, _) = t.fs.opendir(&ctx, ROOT_ID, 0).unwrap();

        // Pretend the reply buffer only holds two entries per request.
        let mut first = Vec::new();
        let mut last_offset = 0;
        t.fs.readdir(&ctx, ROOT_ID, handle.unwrap(), 4096, 0, &mut |d| {
            if first.len() == 2 {
                return Ok(0);
            }
            first.push(String::from_utf8(d.name.to_vec()).unwrap());
            last_offset = d.offset;
            Ok(1)
        })
        .unwrap();
        assert_eq!(first.len(), 2);

        let mut rest = Vec::new();
        t.fs.readdir(&ctx, ROOT_ID, handle.unwrap(), 4096, last_offset, &mut |d| {
            rest.push(String::from_utf8(d.name.to_vec()).unwrap());
            Ok(1)
        })
        .unwrap();

        let mut all: Vec<_> = first.into_iter().chain(rest).collect();
        all.sort();
        assert_eq!(all, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_create_write_stays_local() {
        let t = prepare_mirrorfs();

        let ctx = Context::default();
        let args = CreateIn {
            flags: libc::O_RDWR as u32,
            mode: 0o644,
            umask: 0,
            fuse_flags: 0,
        };
        let (entry, handle, _, _) = t.fs.create(&ctx, ROOT_ID, &name("new.txt"), args).unwrap();

        let data = t.fs.handle_map.get(handle.unwrap(), entry.inode).unwrap();
        data.get_file().unwrap().write_all_at(b"fresh", 0).unwrap();

        assert_eq!(fs::read(t.local_path("new.txt")).unwrap(), b"fresh");
        assert!(!t.remote_path("new.txt").exists());

        // Attribute lookups find the local-only object.
        let (st, _) = t.fs.getattr(&ctx, entry.inode, None).unwrap();
        assert_eq!(st.st_size, 5);
        assert_eq!(t.copies(), 0);
    }

    #[test]
    fn test_unlink_removes_both_tiers() {
        let t = prepare_mirrorfs();
        fs::write(t.remote_path("gone.txt"), b"bye").unwrap();

        let ctx = Context::default();
        // Mirror it first so both tiers hold a copy.
        t.fs.lookup(&ctx, ROOT_ID, &name("gone.txt")).unwrap();
        assert!(t.local_path("gone.txt").exists());

        t.fs.unlink(&ctx, ROOT_ID, &name("gone.txt")).unwrap();
        assert!(!t.local_path("gone.txt").exists());
        assert!(!t.remote_path("gone.txt").exists());

        let err = t.fs.unlink(&ctx, ROOT_ID, &name("gone.txt")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn test_mkdir_rmdir_local_tier() {
        let t = prepare_mirrorfs();

        let ctx = Context::default();
        let entry = t.fs.mkdir(&ctx, ROOT_ID, &name("fresh"), 0o755, 0).unwrap();
        assert!(t.local_path("fresh").is_dir());
        assert!(!t.remote_path("fresh").exists());

        let (st, _) = t.fs.getattr(&ctx, entry.inode, None).unwrap();
        assert!(st.st_mode & libc::S_IFMT == libc::S_IFDIR);

        t.fs.rmdir(&ctx, ROOT_ID, &name("fresh")).unwrap();
        assert!(!t.local_path("fresh").exists());
    }

    #[test]
    fn test_rename_moves_both_tiers() {
        let t = prepare_mirrorfs();
        fs::write(t.remote_path("old"), b"content").unwrap();

        let ctx = Context::default();
        let entry = t.fs.lookup(&ctx, ROOT_ID, &name("old")).unwrap();

        t.fs.rename(&ctx, ROOT_ID, &name("old"), ROOT_ID, &name("new"), 0)
            .unwrap();

        assert!(!t.remote_path("old").exists());
        assert!(!t.local_path("old").exists());
        assert!(t.remote_path("new").exists());
        assert!(t.local_path("new").exists());

        // The kernel's nodeid survives the move.
        let (st, _) = t.fs.getattr(&ctx, entry.inode, None).unwrap();
        assert_eq!(st.st_size, 7);

        let err = t
            .fs
            .rename(&ctx, ROOT_ID, &name("old"), ROOT_ID, &name("other"), 0)
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn test_readlink_remote_symlink() {
        let t = prepare_mirrorfs();
        std::os::unix::fs::symlink("target/file", t.remote_path("link")).unwrap();

        let ctx = Context::default();
        let entry = t.fs.lookup(&ctx, ROOT_ID, &name("link")).unwrap();
        assert!(entry.attr.st_mode & libc::S_IFMT == libc::S_IFLNK);
        // Symlinks are never mirrored.
        assert!(!t.local_path("link").exists());

        let target = t.fs.readlink(&ctx, entry.inode).unwrap();
        assert_eq!(target, b"target/file");
    }

    #[test]
    fn test_symlink_created_locally() {
        let t = prepare_mirrorfs();

        let ctx = Context::default();
        let entry = t
            .fs
            .symlink(&ctx, &name("somewhere"), ROOT_ID, &name("l"))
            .unwrap();

        assert!(t.local_path("l").symlink_metadata().unwrap().is_symlink());
        assert!(!t.remote_path("l").exists());

        let target = t.fs.readlink(&ctx, entry.inode).unwrap();
        assert_eq!(target, b"somewhere");
    }

    #[test]
    fn test_access_checks_remote_tier() {
        let t = prepare_mirrorfs();
        fs::write(t.remote_path("plain"), b"x").unwrap();
        fs::set_permissions(t.remote_path("plain"), fs::Permissions::from_mode(0o644)).unwrap();

        let ctx = Context::default();
        let entry = t.fs.lookup(&ctx, ROOT_ID, &name("plain")).unwrap();

        t.fs.access(&ctx, entry.inode, libc::R_OK as u32).unwrap();

        // Execute is denied by the remote mode bits even though the check
        // runs with this process's credentials.
        let err = t
            .fs
            .access(&ctx, entry.inode, libc::X_OK as u32)
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EACCES));
    }

    #[test]
    fn test_setattr_truncate_and_chmod() {
        let t = prepare_mirrorfs();
        fs::write(t.remote_path("t"), b"0123456789").unwrap();

        let ctx = Context::default();
        let entry = t.fs.lookup(&ctx, ROOT_ID, &name("t")).unwrap();

        let mut attr: libc::stat64 = unsafe { std::mem::zeroed() };
        attr.st_size = 4;
        let (st, _) = t
            .fs
            .setattr(&ctx, entry.inode, attr, None, SetattrValid::SIZE)
            .unwrap();
        assert_eq!(st.st_size, 4);
        // The truncation happened on the local copy; remote is untouched.
        assert_eq!(fs::read(t.local_path("t")).unwrap(), b"0123");
        assert_eq!(fs::read(t.remote_path("t")).unwrap(), b"0123456789");

        let mut attr: libc::stat64 = unsafe { std::mem::zeroed() };
        attr.st_mode = 0o600;
        t.fs.setattr(&ctx, entry.inode, attr, None, SetattrValid::MODE)
            .unwrap();
        let mode = t
            .local_path("t")
            .symlink_metadata()
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o7777, 0o600);
    }

    #[test]
    fn test_statfs_smoke() {
        let t = prepare_mirrorfs();

        let ctx = Context::default();
        let st = t.fs.statfs(&ctx, ROOT_ID).unwrap();
        assert!(st.f_bsize > 0);
    }

    #[test]
    fn test_mount_returns_root_entry() {
        let t = prepare_mirrorfs();

        let (entry, max_ino) = t.fs.mount().unwrap();
        assert_eq!(entry.inode, ROOT_ID);
        assert!(entry.attr.st_mode & libc::S_IFMT == libc::S_IFDIR);
        assert_eq!(max_ino, VFS_MAX_INO);
    }
}

// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::ffi::{CStr, CString};
use std::fs::File;
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::FromRawFd;
use std::path::Path;

pub fn ebadf() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADF)
}

pub fn einval() -> io::Error {
    io::Error::from_raw_os_error(libc::EINVAL)
}

pub fn enoent() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOENT)
}

/// Convert a path into a NUL-terminated C string for raw libc calls.
pub fn to_cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| einval())
}

/// Symbolic-link aware stat, never following the final component.
pub fn lstat(path: &Path) -> io::Result<libc::stat64> {
    let cpath = to_cstring(path)?;
    let mut st = MaybeUninit::<libc::stat64>::zeroed();

    // Safe because the kernel only writes to `st` and we check the return value.
    let res = unsafe { libc::lstat64(cpath.as_ptr(), st.as_mut_ptr()) };
    if res >= 0 {
        // Safe because the kernel guarantees that the struct is now fully initialized.
        Ok(unsafe { st.assume_init() })
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Like `lstat()` but folding "the object is not there" into `None`.
///
/// A missing intermediate component (`ENOTDIR`) counts as absent too, so a
/// probe below a not-yet-mirrored directory behaves like a plain miss.
pub fn lstat_opt(path: &Path) -> io::Result<Option<libc::stat64>> {
    match lstat(path) {
        Ok(st) => Ok(Some(st)),
        Err(e) => match e.raw_os_error() {
            Some(libc::ENOENT) | Some(libc::ENOTDIR) => Ok(None),
            _ => Err(e),
        },
    }
}

/// Safe wrapper around libc::open() for absolute paths.
pub fn open_path(path: &Path, flags: i32, mode: u32) -> io::Result<File> {
    let cpath = to_cstring(path)?;

    // Safe because:
    // - `cpath` is guaranteed to be a valid NUL-terminated string
    // - this does not modify any memory
    // - we check the return value
    let fd = unsafe {
        libc::open(
            cpath.as_ptr(),
            flags | libc::O_CLOEXEC,
            mode as libc::c_uint,
        )
    };
    if fd >= 0 {
        // Safe because we just opened this fd.
        Ok(unsafe { File::from_raw_fd(fd) })
    } else {
        Err(io::Error::last_os_error())
    }
}

pub fn is_regular(st: &libc::stat64) -> bool {
    st.st_mode & libc::S_IFMT == libc::S_IFREG
}

pub fn is_dir(st: &libc::stat64) -> bool {
    st.st_mode & libc::S_IFMT == libc::S_IFDIR
}

/// Validate a single path component received from the request dispatcher.
///
/// Names with a '/' or a leading NUL would escape the parent directory once
/// appended to the virtual path, and "."/".." never reach a file system that
/// does not advertise export support.
pub fn validate_name(name: &CStr) -> io::Result<()> {
    let bytes = name.to_bytes();
    if bytes.is_empty() || bytes == b"." || bytes == b".." || bytes.contains(&b'/') {
        return Err(einval());
    }
    Ok(())
}

/// Map a directory entry's file type to the d_type value reported to the
/// kernel.
pub fn dirent_type(ft: &std::fs::FileType) -> u32 {
    let dt = if ft.is_dir() {
        libc::DT_DIR
    } else if ft.is_file() {
        libc::DT_REG
    } else if ft.is_symlink() {
        libc::DT_LNK
    } else if ft.is_fifo() {
        libc::DT_FIFO
    } else if ft.is_char_device() {
        libc::DT_CHR
    } else if ft.is_block_device() {
        libc::DT_BLK
    } else if ft.is_socket() {
        libc::DT_SOCK
    } else {
        libc::DT_UNKNOWN
    };

    u32::from(dt)
}

// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::error;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::Config;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Reasons the out-of-process materialization of a cache entry can fail.
#[derive(Debug)]
pub enum MaterializeError {
    /// The helper process could not be launched.
    Spawn(io::Error),
    /// Waiting for the helper process failed.
    Wait(io::Error),
    /// The helper exited with a non-zero status or was killed by a signal.
    Failed(ExitStatus),
    /// The helper did not finish within the configured timeout.
    TimedOut(Duration),
    /// The finished copy could not be renamed into its final place.
    Commit(io::Error),
}

impl fmt::Display for MaterializeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use MaterializeError::*;
        match self {
            Spawn(err) => write!(f, "failed to launch copy helper: {}", err),
            Wait(err) => write!(f, "failed to wait for copy helper: {}", err),
            Failed(status) => write!(f, "copy helper failed: {}", status),
            TimedOut(limit) => write!(f, "copy helper timed out after {:?}", limit),
            Commit(err) => write!(f, "failed to move copy into place: {}", err),
        }
    }
}

impl error::Error for MaterializeError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        use MaterializeError::*;
        match self {
            Spawn(err) | Wait(err) | Commit(err) => Some(err),
            Failed(_) | TimedOut(_) => None,
        }
    }
}

pub type MaterializeResult<T> = std::result::Result<T, MaterializeError>;

/// Populates local-tier objects by driving the host copy utilities
/// out-of-process and waiting for them synchronously.
pub struct Materializer {
    cp_program: PathBuf,
    mkdir_program: PathBuf,
    timeout: Option<Duration>,
    staging_seq: AtomicU64,
}

impl Materializer {
    pub fn new(cfg: &Config) -> Self {
        Materializer {
            cp_program: cfg.cp_program.clone(),
            mkdir_program: cfg.mkdir_program.clone(),
            timeout: cfg.copy_timeout,
            staging_seq: AtomicU64::new(0),
        }
    }

    /// Mirror one regular file from `source` to `dest`.
    ///
    /// The helper writes to a staging name in the destination directory and
    /// the finished copy is renamed over `dest`, so a concurrent reader sees
    /// either nothing or the complete file, never a partial one.
    pub fn copy_file(&self, source: &Path, dest: &Path) -> MaterializeResult<()> {
        let staging = self.staging_path(dest);

        let mut cmd = Command::new(&self.cp_program);
        cmd.arg(source).arg(&staging);

        match self.run(cmd) {
            Ok(()) => fs::rename(&staging, dest).map_err(MaterializeError::Commit),
            Err(e) => {
                let _ = fs::remove_file(&staging);
                Err(e)
            }
        }
    }

    /// Mirror a directory node at `dest`, creating intermediate components.
    ///
    /// Only the directory itself is created; its remote content stays
    /// unmirrored until accessed.
    pub fn make_directory(&self, dest: &Path) -> MaterializeResult<()> {
        let mut cmd = Command::new(&self.mkdir_program);
        cmd.arg("-p").arg(dest);

        self.run(cmd)
    }

    fn staging_path(&self, dest: &Path) -> PathBuf {
        let seq = self.staging_seq.fetch_add(1, Ordering::Relaxed);
        let mut staging = OsString::from(".");
        if let Some(name) = dest.file_name() {
            staging.push(name);
        }
        staging.push(format!(".mirror.{}.{}", std::process::id(), seq));
        dest.with_file_name(staging)
    }

    fn run(&self, mut cmd: Command) -> MaterializeResult<()> {
        debug!("mirror: executing {:?}", cmd);

        let mut child = cmd
            .stdin(Stdio::null())
            .spawn()
            .map_err(MaterializeError::Spawn)?;

        let status = match self.timeout {
            None => child.wait().map_err(MaterializeError::Wait)?,
            Some(limit) => {
                let deadline = Instant::now() + limit;
                loop {
                    match child.try_wait().map_err(MaterializeError::Wait)? {
                        Some(status) => break status,
                        None if Instant::now() >= deadline => {
                            warn!("mirror: killing copy helper after {:?}", limit);
                            let _ = child.kill();
                            let _ = child.wait();
                            return Err(MaterializeError::TimedOut(limit));
                        }
                        None => std::thread::sleep(WAIT_POLL_INTERVAL),
                    }
                }
            }
        };

        if status.success() {
            Ok(())
        } else {
            Err(MaterializeError::Failed(status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use vmm_sys_util::tempdir::TempDir;

    fn materializer(timeout: Option<Duration>) -> Materializer {
        let cfg = Config {
            remote_root: PathBuf::from("/remote"),
            local_root: PathBuf::from("/local"),
            copy_timeout: timeout,
            ..Default::default()
        };
        Materializer::new(&cfg)
    }

    // A helper script standing in for cp so tests can stall or fail it.
    fn fake_cp(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-cp");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\n{}", body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_copy_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let source = dir.as_path().join("source");
        let dest = dir.as_path().join("dest");
        fs::write(&source, b"mirrored bytes").unwrap();

        materializer(None).copy_file(&source, &dest).unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"mirrored bytes");
        // No staging leftovers.
        let names: Vec<_> = fs::read_dir(dir.as_path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 2, "{:?}", names);
    }

    #[test]
    fn test_copy_missing_source_fails() {
        let dir = TempDir::new().unwrap();
        let source = dir.as_path().join("missing");
        let dest = dir.as_path().join("dest");

        let err = materializer(None).copy_file(&source, &dest).unwrap_err();
        assert!(matches!(err, MaterializeError::Failed(_)), "{}", err);
        assert!(!dest.exists());
    }

    #[test]
    fn test_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let source = dir.as_path().join("source");
        fs::write(&source, b"x").unwrap();

        let mut m = materializer(None);
        m.cp_program = dir.as_path().join("no-such-helper");
        let err = m
            .copy_file(&source, &dir.as_path().join("dest"))
            .unwrap_err();
        assert!(matches!(err, MaterializeError::Spawn(_)), "{}", err);
    }

    #[test]
    fn test_copy_timeout_kills_helper() {
        let dir = TempDir::new().unwrap();
        let source = dir.as_path().join("source");
        fs::write(&source, b"x").unwrap();

        let mut m = materializer(Some(Duration::from_millis(50)));
        m.cp_program = fake_cp(dir.as_path(), "sleep 10");

        let start = Instant::now();
        let err = m
            .copy_file(&source, &dir.as_path().join("dest"))
            .unwrap_err();
        assert!(matches!(err, MaterializeError::TimedOut(_)), "{}", err);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_make_directory_recursive() {
        let dir = TempDir::new().unwrap();
        let dest = dir.as_path().join("a/b/c");

        materializer(None).make_directory(&dest).unwrap();

        assert!(dest.is_dir());
    }
}

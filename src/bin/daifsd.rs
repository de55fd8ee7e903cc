// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! A fusedev daemon serving the daifs mirror file system.
//!
//! The two tier roots come from the environment (`DAIFS_REMOTE` and
//! `DAIFS_LOCAL`); the mountpoint is the single positional argument.

use std::env;
use std::fs;
use std::io::{Error, ErrorKind, Result};
use std::path::Path;
use std::sync::Arc;
use std::thread;

use log::{error, info, warn, LevelFilter};
use signal_hook::{consts::TERM_SIGNALS, iterator::Signals};
use simple_logger::SimpleLogger;

use fuse_backend_rs::api::{server::Server, Vfs, VfsOptions};
use fuse_backend_rs::transport::{FuseChannel, FuseSession};

use daifs::mirror::{Config, MirrorFs};

const SERVICE_THREADS: u32 = 4;

/// A fusedev daemon mounting one mirror file system.
pub struct Daemon {
    mountpoint: String,
    server: Arc<Server<Arc<Vfs>>>,
    thread_cnt: u32,
    session: Option<FuseSession>,
}

impl Daemon {
    /// Creates a fusedev daemon instance from the process environment.
    pub fn new(cfg: Config, mountpoint: &str, thread_cnt: u32) -> Result<Self> {
        let vfs = Vfs::new(VfsOptions::default());

        let fs = MirrorFs::new(cfg)?;
        fs.import()?;

        // Attach the mirror fs to the vfs root.
        vfs.mount(Box::new(fs), "/")
            .map_err(|e| Error::new(ErrorKind::Other, format!("vfs mount: {:?}", e)))?;

        Ok(Daemon {
            mountpoint: mountpoint.to_string(),
            server: Arc::new(Server::new(Arc::new(vfs))),
            thread_cnt,
            session: None,
        })
    }

    /// Mounts the daemon on the mountpoint, then starts the service threads
    /// handling FUSE requests.
    pub fn mount(&mut self) -> Result<()> {
        let mut se = FuseSession::new(Path::new(&self.mountpoint), "daifs", "", false)
            .map_err(|e| Error::new(ErrorKind::Other, format!("session: {:?}", e)))?;
        se.mount()
            .map_err(|e| Error::new(ErrorKind::Other, format!("mount: {:?}", e)))?;

        for _ in 0..self.thread_cnt {
            let mut server = FuseServer {
                server: self.server.clone(),
                ch: se
                    .new_channel()
                    .map_err(|e| Error::new(ErrorKind::Other, format!("channel: {:?}", e)))?,
            };
            let _thread = thread::Builder::new()
                .name("fuse_server".to_string())
                .spawn(move || {
                    info!("new fuse thread");
                    let _ = server.svc_loop();
                    warn!("fuse service thread exits");
                })?;
        }
        self.session = Some(se);
        Ok(())
    }

    /// Umounts and destroys the fusedev daemon.
    pub fn umount(&mut self) -> Result<()> {
        if let Some(mut se) = self.session.take() {
            se.umount()
                .map_err(|e| Error::new(ErrorKind::Other, format!("umount: {:?}", e)))?;
            se.wake()
                .map_err(|e| Error::new(ErrorKind::Other, format!("wake: {:?}", e)))?;
        }
        Ok(())
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.umount();
    }
}

struct FuseServer {
    server: Arc<Server<Arc<Vfs>>>,
    ch: FuseChannel,
}

impl FuseServer {
    fn svc_loop(&mut self) -> Result<()> {
        // Given error EBADF, it means kernel has shut down this session.
        let _ebadf = Error::from_raw_os_error(libc::EBADF);
        loop {
            if let Some((reader, writer)) = self
                .ch
                .get_request()
                .map_err(|_| Error::from_raw_os_error(libc::EINVAL))?
            {
                if let Err(e) = self
                    .server
                    .handle_message(reader, writer.into(), None, None)
                {
                    match e {
                        fuse_backend_rs::Error::EncodeMessage(_ebadf) => {
                            break;
                        }
                        _ => {
                            error!("handling fuse message failed");
                            continue;
                        }
                    }
                }
            } else {
                info!("fuse server exits");
                break;
            }
        }
        Ok(())
    }
}

fn help() {
    println!("Usage:\n    daifsd <mountpoint>\n");
    println!("Tier roots are read from the environment:");
    println!("    DAIFS_REMOTE  root of the slow, authoritative tree");
    println!("    DAIFS_LOCAL   root of the local cache tree");
}

fn main() -> Result<()> {
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .init()
        .unwrap();

    let args = env::args().collect::<Vec<String>>();
    if args.len() != 2 {
        help();
        return Err(Error::from_raw_os_error(libc::EINVAL));
    }
    let mountpoint = args[1].as_str();

    let cfg = Config::from_env().map_err(|e| {
        error!("daifsd: {}", e);
        Error::new(ErrorKind::InvalidInput, e.to_string())
    })?;

    // The remote tree must already exist; the cache tree is created on
    // demand.
    if !cfg.remote_root.is_dir() {
        error!("daifsd: remote root {:?} is not a directory", cfg.remote_root);
        return Err(Error::from_raw_os_error(libc::ENOTDIR));
    }
    if !cfg.local_root.exists() {
        fs::create_dir_all(&cfg.local_root)?;
    }

    info!(
        "daifsd: mirroring {:?} into {:?}, mountpoint {}",
        cfg.remote_root, cfg.local_root, mountpoint
    );

    let mut daemon = Daemon::new(cfg, mountpoint, SERVICE_THREADS)?;
    daemon.mount()?;

    // Wait until the daemon is told to quit.
    let mut signals = Signals::new(TERM_SIGNALS)?;
    for _sig in signals.forever() {
        break;
    }

    daemon.umount()?;

    Ok(())
}

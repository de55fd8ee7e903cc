// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

/// Environment variable naming the root of the remote (authoritative) tier.
pub const REMOTE_ROOT_ENV: &str = "DAIFS_REMOTE";

/// Environment variable naming the root of the local (cache) tier.
pub const LOCAL_ROOT_ENV: &str = "DAIFS_LOCAL";

/// Optional override for the copy helper timeout, in seconds. `0` disables
/// the timeout entirely.
pub const COPY_TIMEOUT_ENV: &str = "DAIFS_COPY_TIMEOUT_SECS";

const DEFAULT_COPY_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration of the mirror file system, fixed at startup.
#[derive(Clone, Debug)]
pub struct Config {
    /// Root directory of the slow, authoritative remote tier.
    pub remote_root: PathBuf,

    /// Root directory of the fast local cache tier.
    pub local_root: PathBuf,

    /// How long to wait for one copy/mkdir helper process before killing it.
    /// `None` waits forever.
    pub copy_timeout: Option<Duration>,

    /// Program invoked to mirror one regular file.
    pub cp_program: PathBuf,

    /// Program invoked to mirror a directory node.
    pub mkdir_program: PathBuf,

    /// How long the kernel may cache dentries for this file system.
    ///
    /// Kept at zero so changes in the remote tree are picked up right away,
    /// and so stale nodeids do not outlive a rename or unlink.
    pub entry_timeout: Duration,

    /// How long the kernel may cache file attributes for this file system.
    pub attr_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            remote_root: PathBuf::new(),
            local_root: PathBuf::new(),
            copy_timeout: Some(DEFAULT_COPY_TIMEOUT),
            cp_program: PathBuf::from("/bin/cp"),
            mkdir_program: PathBuf::from("/bin/mkdir"),
            entry_timeout: Duration::from_secs(0),
            attr_timeout: Duration::from_secs(0),
        }
    }
}

impl Config {
    /// Build a configuration from the process environment.
    ///
    /// Both tier roots are required; a missing or empty variable is a fatal
    /// configuration error, reported before anything gets mounted.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Config {
            remote_root: required_root(REMOTE_ROOT_ENV)?,
            local_root: required_root(LOCAL_ROOT_ENV)?,
            ..Default::default()
        };

        if let Some(val) = env::var_os(COPY_TIMEOUT_ENV) {
            let secs: u64 = val
                .to_str()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    Error::BadConfig(format!("{} must be a number of seconds", COPY_TIMEOUT_ENV))
                })?;
            cfg.copy_timeout = if secs == 0 {
                None
            } else {
                Some(Duration::from_secs(secs))
            };
        }

        cfg.validate()?;

        Ok(cfg)
    }

    /// Check the invariants that hold for every valid configuration.
    pub fn validate(&self) -> Result<()> {
        for (name, root) in [
            (REMOTE_ROOT_ENV, &self.remote_root),
            (LOCAL_ROOT_ENV, &self.local_root),
        ] {
            if root.as_os_str().is_empty() {
                return Err(Error::BadConfig(format!("{} must not be empty", name)));
            }
            if !root.is_absolute() {
                return Err(Error::BadConfig(format!(
                    "{} must be an absolute path, got {:?}",
                    name, root
                )));
            }
        }
        if self.remote_root == self.local_root {
            return Err(Error::BadConfig(
                "remote and local tier roots must differ".to_string(),
            ));
        }
        Ok(())
    }
}

fn required_root(name: &str) -> Result<PathBuf> {
    match env::var_os(name) {
        Some(val) if !val.is_empty() => Ok(PathBuf::from(val)),
        _ => Err(Error::BadConfig(format!(
            "{} must be set to an absolute path",
            name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        let cfg = Config {
            remote_root: PathBuf::from("/remote"),
            local_root: PathBuf::from("/local"),
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());

        let cfg = Config {
            remote_root: PathBuf::from("relative/remote"),
            local_root: PathBuf::from("/local"),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            remote_root: PathBuf::from("/same"),
            local_root: PathBuf::from("/same"),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        assert!(Config::default().validate().is_err());
    }

    // One test body for everything touching the process environment, since
    // the variables are process-global and tests run concurrently.
    #[test]
    fn test_from_env() {
        env::remove_var(REMOTE_ROOT_ENV);
        env::remove_var(LOCAL_ROOT_ENV);
        env::remove_var(COPY_TIMEOUT_ENV);
        assert!(Config::from_env().is_err());

        env::set_var(REMOTE_ROOT_ENV, "/tmp/daifs-remote");
        assert!(Config::from_env().is_err());

        env::set_var(LOCAL_ROOT_ENV, "/tmp/daifs-local");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.remote_root, PathBuf::from("/tmp/daifs-remote"));
        assert_eq!(cfg.local_root, PathBuf::from("/tmp/daifs-local"));
        assert_eq!(cfg.copy_timeout, Some(DEFAULT_COPY_TIMEOUT));

        env::set_var(COPY_TIMEOUT_ENV, "0");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.copy_timeout, None);

        env::set_var(COPY_TIMEOUT_ENV, "5");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.copy_timeout, Some(Duration::from_secs(5)));

        env::set_var(COPY_TIMEOUT_ENV, "not-a-number");
        assert!(Config::from_env().is_err());

        env::remove_var(REMOTE_ROOT_ENV);
        env::remove_var(LOCAL_ROOT_ENV);
        env::remove_var(COPY_TIMEOUT_ENV);
    }
}

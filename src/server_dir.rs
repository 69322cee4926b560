//! Server directory bootstrap
//!
//! The configuration root comes from `$USERKD_PREFIX` (or `$HOME/.userkd`);
//! it must be an absolute path owned by the real uid. The server socket
//! lives in `/tmp/.userkd-<uid>/server-<dev>-<ino>/`, where dev and ino
//! identify the configuration root, so independent prefixes get independent
//! servers.

use std::os::unix::fs::DirBuilderExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::path::PathBuf;

use nix::unistd::getuid;
use thiserror::Error;

/// Environment variable naming the configuration root.
pub const PREFIX_ENV: &str = "USERKD_PREFIX";

const SOCKET_NAME: &str = "socket";
const LOCK_NAME: &str = "lock";

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("could not determine the configuration directory; set ${PREFIX_ENV} or $HOME")]
    NoConfigDir,
    #[error("configuration path {0:?} is not absolute")]
    NotAbsolute(PathBuf),
    #[error("{0:?} is not owned by you")]
    NotOwned(PathBuf),
    #[error("creating {path:?}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("inspecting {path:?}: {source}")]
    Stat {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// The directories a running daemon works out of.
#[derive(Debug, Clone)]
pub struct ServerDirs {
    pub config_dir: PathBuf,
    pub server_dir: PathBuf,
}

impl ServerDirs {
    /// The path of the master socket.
    pub fn socket_path(&self) -> PathBuf {
        self.server_dir.join(SOCKET_NAME)
    }

    /// The path of the daemon lock file.
    pub fn lock_path(&self) -> PathBuf {
        self.server_dir.join(LOCK_NAME)
    }
}

fn config_dir_from_env() -> Result<PathBuf, BootstrapError> {
    if let Some(prefix) = std::env::var_os(PREFIX_ENV) {
        return Ok(PathBuf::from(prefix));
    }
    match std::env::var_os("HOME") {
        Some(home) => Ok(PathBuf::from(home).join(".userkd")),
        None => Err(BootstrapError::NoConfigDir),
    }
}

fn create_owned_dir(path: &Path, mode: u32) -> Result<(), BootstrapError> {
    let mut builder = std::fs::DirBuilder::new();
    builder.mode(mode);
    match builder.create(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(source) => Err(BootstrapError::Create { path: path.to_path_buf(), source }),
    }
}

fn check_ownership(path: &Path) -> Result<std::fs::Metadata, BootstrapError> {
    let meta = std::fs::metadata(path)
        .map_err(|source| BootstrapError::Stat { path: path.to_path_buf(), source })?;
    if meta.uid() != getuid().as_raw() {
        return Err(BootstrapError::NotOwned(path.to_path_buf()));
    }
    Ok(meta)
}

/// Resolve and create the config and server directories.
pub fn setup_server_dirs() -> Result<ServerDirs, BootstrapError> {
    let config_dir = config_dir_from_env()?;
    if !config_dir.is_absolute() {
        return Err(BootstrapError::NotAbsolute(config_dir));
    }
    create_owned_dir(&config_dir, 0o755)?;
    let meta = check_ownership(&config_dir)?;

    // the server dir is keyed by the config root's identity, so each
    // prefix gets its own server instance
    let base = std::env::temp_dir().join(format!(".userkd-{}", getuid().as_raw()));
    create_owned_dir(&base, 0o700)?;
    check_ownership(&base)?;

    let server_dir = base.join(format!("server-{:x}-{:x}", meta.dev(), meta.ino()));
    create_owned_dir(&server_dir, 0o700)?;
    check_ownership(&server_dir)?;

    Ok(ServerDirs { config_dir, server_dir })
}

#[cfg(test)]
mod tests {
    use super::*;

    // env-var driven tests run serially enough under one binary; each uses
    // a private prefix
    #[test]
    fn dirs_are_created_and_keyed_by_prefix() {
        let tmp = tempfile::TempDir::new().unwrap();
        let prefix = tmp.path().join("prefix");
        unsafe { std::env::set_var(PREFIX_ENV, &prefix) };
        let dirs = setup_server_dirs().unwrap();
        assert_eq!(dirs.config_dir, prefix);
        assert!(dirs.config_dir.is_dir());
        assert!(dirs.server_dir.is_dir());
        assert!(dirs
            .server_dir
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("server-"));
        assert_eq!(dirs.socket_path().file_name().unwrap(), "socket");

        // the same prefix resolves to the same server dir
        let again = setup_server_dirs().unwrap();
        assert_eq!(again.server_dir, dirs.server_dir);
        unsafe { std::env::remove_var(PREFIX_ENV) };
    }
}

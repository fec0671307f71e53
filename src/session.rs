//! Deploy session - one authenticated transport to one host.
//!
//! Every operation logs its outcome and returns it. Nothing is retried and
//! a failed operation never closes the session; the caller decides whether
//! to carry on.

use crate::backup::find_backup_name;
use crate::elevation::{Elevation, RemoteCommand};
use crate::error::{DeployError, Result};
use crate::transport::{CommandOutput, Transport};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

#[cfg(feature = "ssh")]
use crate::config::SshConfig;
#[cfg(feature = "ssh")]
use crate::transport::SshTransport;

/// Session over SSH/SFTP
#[cfg(feature = "ssh")]
pub type SshSession<I = ()> = Session<SshTransport, I>;

/// Size of a remote file, or its absence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSize {
    Present(u64),
    Missing,
}

impl FileSize {
    pub fn bytes(&self) -> Option<u64> {
        match self {
            FileSize::Present(n) => Some(*n),
            FileSize::Missing => None,
        }
    }
}

/// Outcome of `create_dir_sftp`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirStatus {
    Created,
    Existed,
}

/// Outcome of `send_file`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Nothing was at the destination
    Created { bytes: u64 },
    /// The previous file was moved to `backup` first
    Replaced { backup: PathBuf, bytes: u64 },
}

impl SendOutcome {
    pub fn bytes(&self) -> u64 {
        match self {
            SendOutcome::Created { bytes } | SendOutcome::Replaced { bytes, .. } => *bytes,
        }
    }

    pub fn backup(&self) -> Option<&Path> {
        match self {
            SendOutcome::Created { .. } => None,
            SendOutcome::Replaced { backup, .. } => Some(backup),
        }
    }
}

/// A deploy session to one host.
///
/// `I` is caller bookkeeping carried alongside the session; it is stored and
/// handed back, never inspected. Dropping the session closes it.
pub struct Session<T: Transport, I = ()> {
    host: String,
    transport: T,
    elevation: Elevation,
    info: Option<I>,
    closed: bool,
}

#[cfg(feature = "ssh")]
impl<I> Session<SshTransport, I> {
    /// Connect to `config.hostname`. Fails if either channel can't be opened.
    ///
    /// Elevated commands use `sudo` with `config.password`.
    pub fn open(config: &SshConfig) -> Result<Self> {
        let transport = SshTransport::connect(config).inspect_err(|e| error!("{}", e))?;
        info!("Connected to {}", config.hostname);

        Ok(Self::with_transport(
            config.hostname.clone(),
            transport,
            Elevation::sudo(config.password.clone()),
        ))
    }
}

impl<T: Transport, I> Session<T, I> {
    /// Wrap an already-open transport.
    pub fn with_transport(host: impl Into<String>, transport: T, elevation: Elevation) -> Self {
        Self {
            host: host.into(),
            transport,
            elevation,
            info: None,
            closed: false,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    // =========================================================================
    // Metadata slot
    // =========================================================================

    pub fn set_info(&mut self, info: I) {
        self.info = Some(info);
    }

    pub fn get_info(&self) -> Option<&I> {
        self.info.as_ref()
    }

    pub fn take_info(&mut self) -> Option<I> {
        self.info.take()
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Upload `local` to `remote`, overwriting whatever is there. No backup.
    pub fn copy_file(&mut self, local: &Path, remote: &Path) -> Result<u64> {
        info!(host = %self.host, "Copying {} to {}", local.display(), remote.display());

        let bytes = self.transport.put(local, remote).inspect_err(|e| {
            error!(
                host = %self.host,
                "Failed to copy {} to {}: {}",
                local.display(),
                remote.display(),
                e
            )
        })?;

        info!(host = %self.host, "Successfully copied {} to {}", local.display(), remote.display());
        Ok(bytes)
    }

    /// Make sure the directory `path` exists, creating it if missing.
    ///
    /// Parents are not created. An existing non-directory is an error.
    pub fn create_dir_sftp(&mut self, path: &Path) -> Result<DirStatus> {
        let result = match self.transport.stat(path) {
            Ok(stat) if stat.is_dir() => {
                debug!(host = %self.host, "Directory already exists: {}", path.display());
                return Ok(DirStatus::Existed);
            }
            Ok(_) => Err(DeployError::NotADirectory(path.to_path_buf())),
            Err(e) if e.is_not_found() => self.transport.mkdir(path).map(|()| DirStatus::Created),
            Err(e) => Err(e),
        };

        match &result {
            Ok(_) => info!(host = %self.host, "Created directory: {}", path.display()),
            Err(e) => error!(host = %self.host, "Failed to create directory {}: {}", path.display(), e),
        }
        result
    }

    /// Size of the remote file at `path`.
    ///
    /// A missing file is `Ok(FileSize::Missing)`; only other failures are `Err`.
    pub fn get_file_size(&mut self, path: &Path) -> Result<FileSize> {
        match self.transport.stat(path) {
            Ok(stat) => Ok(FileSize::Present(stat.size)),
            Err(e) if e.is_not_found() => {
                warn!(host = %self.host, "File does not exist: {}", path.display());
                Ok(FileSize::Missing)
            }
            Err(e) => {
                error!(host = %self.host, "Failed to get file size for {}: {}", path.display(), e);
                Err(e)
            }
        }
    }

    /// Set user and group of `path` to `owner` via sudo.
    pub fn change_owner(&mut self, path: &Path, owner: &str) -> Result<()> {
        info!(host = %self.host, "Changing owner of {} to {}", path.display(), owner);

        RemoteCommand::chown(path, owner)
            .and_then(|cmd| self.run_elevated(cmd))
            .map(|_| ())
            .inspect_err(|e| {
                error!(
                    host = %self.host,
                    "Failed to change owner of {}: {}",
                    path.display(),
                    e
                )
            })
    }

    /// First unused `_old` name for `path` on the remote host.
    pub fn backup_name(&mut self, path: &Path) -> Result<PathBuf> {
        let transport = &mut self.transport;
        find_backup_name(path, |candidate| match transport.stat(candidate) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        })
    }

    /// Deploy `local` to `remote`, keeping any existing file as a backup.
    ///
    /// The existing file is moved (with sudo) to the first free `_old` name
    /// and the move must finish before the upload starts.
    pub fn send_file(&mut self, local: &Path, remote: &Path) -> Result<SendOutcome> {
        self.try_send_file(local, remote).inspect_err(|e| {
            error!(
                host = %self.host,
                "Failed to send file {} to {}: {}",
                local.display(),
                remote.display(),
                e
            )
        })
    }

    fn try_send_file(&mut self, local: &Path, remote: &Path) -> Result<SendOutcome> {
        check_local_file(local)?;

        match self.transport.stat(remote) {
            Ok(_) => {
                let backup = self.backup_name(remote)?;
                info!(host = %self.host, "Backing up {} to {}", remote.display(), backup.display());
                self.run_elevated(RemoteCommand::move_path(remote, &backup))?;

                info!(host = %self.host, "Copying {} to {}", local.display(), remote.display());
                let bytes = self.transport.put(local, remote)?;
                Ok(SendOutcome::Replaced { backup, bytes })
            }
            Err(e) if e.is_not_found() => {
                info!(
                    host = %self.host,
                    "No existing file at {}, copying directly",
                    remote.display()
                );
                let bytes = self.transport.put(local, remote)?;
                Ok(SendOutcome::Created { bytes })
            }
            Err(e) => Err(e),
        }
    }

    /// Run `command` with the session's elevation and require exit status 0.
    fn run_elevated(&mut self, command: RemoteCommand) -> Result<CommandOutput> {
        let command = command.elevated(self.elevation.clone());
        debug!(host = %self.host, "Running {}", command);

        let output = self.transport.exec(&command)?;
        if !output.success() {
            return Err(DeployError::CommandFailed {
                command: command.to_shell(),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Close both channels. The first release failure is returned.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        match self.transport.close() {
            Ok(()) => {
                info!("Closed SSH connection to {}", self.host);
                Ok(())
            }
            Err(e) => {
                warn!("Error while closing connection to {}: {}", self.host, e);
                Err(e)
            }
        }
    }
}

impl<T: Transport, I> Drop for Session<T, I> {
    fn drop(&mut self) {
        // Failures are already logged by release()
        let _ = self.release();
    }
}

fn check_local_file(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path).map_err(|e| DeployError::LocalFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    if metadata.is_file() {
        Ok(())
    } else {
        Err(DeployError::LocalFile {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
        })
    }
}

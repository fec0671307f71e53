//! SSH transport - one `ssh2::Session` for exec, one SFTP channel for files.

use super::{CommandOutput, EntryKind, RemoteStat, Transport};
use crate::config::{expand_tilde, SshConfig};
use crate::elevation::RemoteCommand;
use crate::error::{DeployError, Result};
use ssh2::{ErrorCode, Session, Sftp};
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;

/// SFTP status code for a missing file (LIBSSH2_FX_NO_SUCH_FILE)
const SFTP_NO_SUCH_FILE: i32 = 2;

/// Directory mode used for `mkdir`
const DIR_MODE: i32 = 0o755;

pub struct SshTransport {
    host: String,
    session: Option<Session>,
    sftp: Option<Sftp>,
}

impl SshTransport {
    /// Connect, authenticate, and open the SFTP channel.
    pub fn connect(config: &SshConfig) -> Result<Self> {
        let host = config.hostname.clone();
        let fail = |message: String| DeployError::Connection {
            host: host.clone(),
            message,
        };

        let addr = config
            .address()
            .to_socket_addrs()
            .map_err(|e| fail(format!("cannot resolve {}: {}", config.address(), e)))?
            .next()
            .ok_or_else(|| fail(format!("no address for {}", config.address())))?;

        let tcp = TcpStream::connect_timeout(&addr, config.timeout)
            .map_err(|e| fail(format!("TCP connection to {} failed: {}", addr, e)))?;

        let mut session =
            Session::new().map_err(|e| fail(format!("failed to create SSH session: {}", e)))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(config.timeout.as_millis().min(u32::MAX as u128) as u32);
        session
            .handshake()
            .map_err(|e| fail(format!("SSH handshake failed: {}", e)))?;

        authenticate(&session, config).map_err(fail)?;

        let sftp = session
            .sftp()
            .map_err(|e| fail(format!("failed to open SFTP channel: {}", e)))?;

        Ok(Self {
            host,
            session: Some(session),
            sftp: Some(sftp),
        })
    }

    fn session(&self) -> Result<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| DeployError::transport(&self.host, "SSH session is closed"))
    }

    fn sftp(&self) -> Result<&Sftp> {
        self.sftp
            .as_ref()
            .ok_or_else(|| DeployError::transport(&self.host, "SFTP channel is closed"))
    }

    fn map_sftp_err(&self, path: &Path, err: ssh2::Error) -> DeployError {
        if matches!(err.code(), ErrorCode::SFTP(SFTP_NO_SUCH_FILE)) {
            DeployError::NotFound(path.to_path_buf())
        } else {
            DeployError::transport(&self.host, format!("{}: {}", path.display(), err))
        }
    }
}

/// Try password, then each identity file, then the agent.
fn authenticate(session: &Session, config: &SshConfig) -> std::result::Result<(), String> {
    let mut attempts = Vec::new();

    if let Some(password) = &config.password {
        match session.userauth_password(&config.user, password) {
            Ok(()) if session.authenticated() => return Ok(()),
            Ok(()) => attempts.push("password: not accepted".to_string()),
            Err(e) => attempts.push(format!("password: {}", e)),
        }
    }

    for key in &config.identity_file {
        let key = expand_tilde(key);
        match session.userauth_pubkey_file(&config.user, None, &key, None) {
            Ok(()) if session.authenticated() => return Ok(()),
            Ok(()) => attempts.push(format!("{}: not accepted", key.display())),
            Err(e) => attempts.push(format!("{}: {}", key.display(), e)),
        }
    }

    match session.userauth_agent(&config.user) {
        Ok(()) if session.authenticated() => return Ok(()),
        Ok(()) => attempts.push("agent: not accepted".to_string()),
        Err(e) => attempts.push(format!("agent: {}", e)),
    }

    Err(format!(
        "authentication failed for user {:?} ({})",
        config.user,
        attempts.join("; ")
    ))
}

impl Transport for SshTransport {
    fn exec(&mut self, command: &RemoteCommand) -> Result<CommandOutput> {
        let err = |e: String| DeployError::transport(&self.host, format!("{}: {}", command, e));

        let mut channel = self
            .session()?
            .channel_session()
            .map_err(|e| err(e.to_string()))?;
        channel
            .exec(&command.to_shell())
            .map_err(|e| err(e.to_string()))?;

        if let Some(input) = command.stdin() {
            channel
                .write_all(input.as_bytes())
                .map_err(|e| err(e.to_string()))?;
        }
        channel.send_eof().map_err(|e| err(e.to_string()))?;

        // stderr first: mv, chown and sudo write nothing to stdout
        let mut stderr = String::new();
        channel
            .stderr()
            .read_to_string(&mut stderr)
            .map_err(|e| err(e.to_string()))?;
        let mut stdout = String::new();
        channel
            .read_to_string(&mut stdout)
            .map_err(|e| err(e.to_string()))?;

        channel.wait_close().map_err(|e| err(e.to_string()))?;
        let status = channel.exit_status().map_err(|e| err(e.to_string()))?;

        Ok(CommandOutput {
            status,
            stdout,
            stderr,
        })
    }

    fn stat(&mut self, path: &Path) -> Result<RemoteStat> {
        let stat = self
            .sftp()?
            .stat(path)
            .map_err(|e| self.map_sftp_err(path, e))?;

        let kind = if stat.is_dir() {
            EntryKind::Directory
        } else if stat.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        };

        Ok(RemoteStat {
            size: stat.size.unwrap_or(0),
            kind,
        })
    }

    fn put(&mut self, local: &Path, remote: &Path) -> Result<u64> {
        let mut source = File::open(local).map_err(|e| DeployError::LocalFile {
            path: local.to_path_buf(),
            source: e,
        })?;

        let mut dest = self
            .sftp()?
            .create(remote)
            .map_err(|e| self.map_sftp_err(remote, e))?;

        let io_err =
            |e: io::Error| DeployError::transport(&self.host, format!("{}: {}", remote.display(), e));
        let written = io::copy(&mut source, &mut dest).map_err(io_err)?;
        dest.flush().map_err(io_err)?;

        Ok(written)
    }

    fn mkdir(&mut self, path: &Path) -> Result<()> {
        self.sftp()?
            .mkdir(path, DIR_MODE)
            .map_err(|e| self.map_sftp_err(path, e))
    }

    fn close(&mut self) -> Result<()> {
        // Dropping Sftp closes the subsystem channel
        self.sftp.take();

        match self.session.take() {
            Some(session) => session
                .disconnect(None, "Closing deploy session", None)
                .map_err(|e| DeployError::transport(&self.host, format!("disconnect failed: {}", e))),
            None => Ok(()),
        }
    }
}

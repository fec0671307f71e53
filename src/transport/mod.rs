//! Transport abstraction - command execution plus file transfer to one host.
//!
//! The session only talks to this trait. `SshTransport` is the real thing,
//! `MemoryTransport` keeps the remote filesystem in memory.

pub mod memory;
#[cfg(feature = "ssh")]
pub mod ssh;

use crate::elevation::RemoteCommand;
use crate::error::Result;
use std::path::Path;

pub use memory::MemoryTransport;
#[cfg(feature = "ssh")]
pub use ssh::SshTransport;

/// Kind of remote filesystem entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Other,
}

/// Result of a remote stat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub size: u64,
    pub kind: EntryKind,
}

impl RemoteStat {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Output of a completed remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// An authenticated execution + transfer channel pair to one host.
///
/// `stat` must report a missing path as `DeployError::NotFound` so callers
/// can branch on it.
pub trait Transport {
    /// Run a command and block until it exits.
    fn exec(&mut self, command: &RemoteCommand) -> Result<CommandOutput>;

    fn stat(&mut self, path: &Path) -> Result<RemoteStat>;

    /// Upload a local file, replacing the remote one. Returns bytes written.
    fn put(&mut self, local: &Path, remote: &Path) -> Result<u64>;

    fn mkdir(&mut self, path: &Path) -> Result<()>;

    /// Release the transfer channel, then the execution channel.
    ///
    /// Must tolerate being called more than once.
    fn close(&mut self) -> Result<()>;
}

//! rdeploy - backup-rotating file deployment over SSH/SFTP.
//!
//! A [`Session`] owns one transport to one host and exposes the deploy
//! operations: `send_file` (move the old file to an `_old` backup, then
//! upload), `copy_file`, `create_dir_sftp`, `get_file_size` and
//! `change_owner`. Plans in TOML apply the same steps to many hosts.

pub mod backup;
pub mod config;
pub mod elevation;
pub mod error;
pub mod plan;
pub mod session;
pub mod transport;

pub use config::{Plan, SshConfig};
pub use elevation::{Elevation, RemoteCommand};
pub use error::{DeployError, Result};
pub use session::{DirStatus, FileSize, SendOutcome, Session};
#[cfg(feature = "ssh")]
pub use session::SshSession;
pub use transport::{CommandOutput, EntryKind, MemoryTransport, RemoteStat, Transport};

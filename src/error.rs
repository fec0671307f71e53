use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Failed to connect to {host}: {message}")]
    Connection { host: String, message: String },

    #[error("Transport error on {host}: {message}")]
    Transport { host: String, message: String },

    #[error("Remote path not found: {0}")]
    NotFound(PathBuf),

    #[error("Remote path exists but is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Remote command `{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("Invalid owner name: {0:?}")]
    InvalidOwner(String),

    #[error("Invalid remote path: {0}")]
    InvalidPath(String),

    #[error("No free backup name for {path} after {generations} generations")]
    BackupExhausted { path: PathBuf, generations: usize },

    #[error("Local file {path} is not readable: {source}")]
    LocalFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DeployError {
    pub fn transport(host: impl Into<String>, message: impl ToString) -> Self {
        DeployError::Transport {
            host: host.into(),
            message: message.to_string(),
        }
    }

    /// Whether this error means the remote path is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DeployError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, DeployError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_distinguishable() {
        let missing = DeployError::NotFound(PathBuf::from("/srv/app.cfg"));
        let other = DeployError::transport("10.0.0.5", "channel closed");

        assert!(missing.is_not_found());
        assert!(!other.is_not_found());
    }

    #[test]
    fn test_command_failed_message() {
        let err = DeployError::CommandFailed {
            command: "chown deploy:deploy /srv/app.cfg".to_string(),
            status: 1,
            stderr: "Operation not permitted".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("status 1"));
        assert!(msg.contains("Operation not permitted"));
    }
}

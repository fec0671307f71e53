//! Remote commands and sudo elevation.
//!
//! Commands are kept as argv until they hit the wire so transports that do
//! not go through a shell (see `MemoryTransport`) can inspect them.

use crate::error::{DeployError, Result};
use regex::Regex;
use shell_escape::escape;
use std::borrow::Cow;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

/// How an elevated command obtains root
#[derive(Clone, Default)]
pub enum Elevation {
    /// Run as the session user
    #[default]
    None,
    /// `sudo -n`: fail instead of prompting
    SudoNonInteractive,
    /// `sudo -S` with the password written to stdin
    SudoPassword(String),
}

impl Elevation {
    /// Sudo with the given password, or non-interactive sudo without one.
    pub fn sudo(password: Option<String>) -> Self {
        match password {
            Some(pw) if !pw.is_empty() => Elevation::SudoPassword(pw),
            _ => Elevation::SudoNonInteractive,
        }
    }
}

impl fmt::Debug for Elevation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Elevation::None => write!(f, "None"),
            Elevation::SudoNonInteractive => write!(f, "SudoNonInteractive"),
            Elevation::SudoPassword(_) => write!(f, "SudoPassword(<redacted>)"),
        }
    }
}

/// A command to run on the remote host
#[derive(Clone)]
pub struct RemoteCommand {
    argv: Vec<String>,
    elevation: Elevation,
}

impl RemoteCommand {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            elevation: Elevation::None,
        }
    }

    pub fn elevated(mut self, elevation: Elevation) -> Self {
        self.elevation = elevation;
        self
    }

    /// `mv -- <from> <to>`
    pub fn move_path(from: &Path, to: &Path) -> Self {
        Self::new([
            "mv".to_string(),
            "--".to_string(),
            path_arg(from),
            path_arg(to),
        ])
    }

    /// `chown <owner>:<owner> -- <path>`
    pub fn chown(path: &Path, owner: &str) -> Result<Self> {
        validate_owner(owner)?;
        Ok(Self::new([
            "chown".to_string(),
            format!("{}:{}", owner, owner),
            "--".to_string(),
            path_arg(path),
        ]))
    }

    /// Unelevated argv
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn is_elevated(&self) -> bool {
        !matches!(self.elevation, Elevation::None)
    }

    /// Bytes to feed the remote process on stdin before EOF
    pub fn stdin(&self) -> Option<String> {
        match &self.elevation {
            Elevation::SudoPassword(pw) => Some(format!("{}\n", pw)),
            _ => None,
        }
    }

    /// Shell-quoted command line, including the sudo prefix.
    ///
    /// Never contains the sudo password.
    pub fn to_shell(&self) -> String {
        let prefix: &[&str] = match self.elevation {
            Elevation::None => &[],
            Elevation::SudoNonInteractive => &["sudo", "-n", "--"],
            Elevation::SudoPassword(_) => &["sudo", "-S", "-p", "", "--"],
        };

        prefix
            .iter()
            .map(|s| escape(Cow::Borrowed(*s)))
            .chain(self.argv.iter().map(|s| escape(Cow::Borrowed(s.as_str()))))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell())
    }
}

impl fmt::Debug for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCommand")
            .field("argv", &self.argv)
            .field("elevation", &self.elevation)
            .finish()
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Longest user name `useradd` accepts, trailing `$` included
const MAX_OWNER_LEN: usize = 32;

fn owner_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^[a-z_][a-z0-9_-]{0,31}\$?$").expect("owner pattern is valid")
    })
}

/// Check that `owner` is a plausible POSIX user name.
pub fn validate_owner(owner: &str) -> Result<()> {
    if owner.len() <= MAX_OWNER_LEN && owner_pattern().is_match(owner) {
        Ok(())
    } else {
        Err(DeployError::InvalidOwner(owner.to_string()))
    }
}

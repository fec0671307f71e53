//! Connection settings and deployment plans.

use crate::error::{DeployError, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 22;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything needed to open a session to one host.
///
/// Credentials are explicit: callers resolve defaults (environment, local
/// user name) before building this.
#[derive(Clone)]
pub struct SshConfig {
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub identity_file: Vec<PathBuf>,
    pub timeout: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            port: DEFAULT_PORT,
            user: String::new(),
            password: None,
            identity_file: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConfig")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("identity_file", &self.identity_file)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl SshConfig {
    /// `host:port` as used for the TCP connection
    pub fn address(&self) -> String {
        if self.hostname.contains(':') && !self.hostname.starts_with('[') {
            // Bare IPv6 literal
            format!("[{}]:{}", self.hostname, self.port)
        } else {
            format!("{}:{}", self.hostname, self.port)
        }
    }
}

/// Replace a leading `~` component with the home directory.
///
/// `~user` forms are left alone, as is everything when no home directory is known.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) if rest.as_os_str().is_empty() => home,
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

// =============================================================================
// Deployment plan
// =============================================================================

/// How a file step is transferred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Move any existing remote file to a backup name first
    #[default]
    Send,
    /// Overwrite without a backup
    Copy,
}

/// Connection defaults shared by every host in a plan
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostDefaults {
    pub user: Option<String>,
    pub port: Option<u16>,
    #[serde(default)]
    pub identity_file: Vec<PathBuf>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostEntry {
    pub address: String,
    pub user: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirStep {
    pub path: PathBuf,
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileStep {
    pub local: PathBuf,
    pub remote: PathBuf,
    #[serde(default)]
    pub mode: TransferMode,
    pub owner: Option<String>,
}

/// A deployment plan: the same directories and files pushed to every host.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    #[serde(default)]
    pub defaults: HostDefaults,
    pub hosts: Vec<HostEntry>,
    #[serde(default)]
    pub dirs: Vec<DirStep>,
    #[serde(default)]
    pub files: Vec<FileStep>,
}

impl Plan {
    /// Load and validate a plan from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let path = expand_tilde(path);
        let text = std::fs::read_to_string(&path).map_err(|e| {
            DeployError::Config(format!("Cannot read plan {}: {}", path.display(), e))
        })?;
        text.parse()
    }

    fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(DeployError::Config("Plan has no hosts".to_string()));
        }
        if let Some(host) = self.hosts.iter().find(|h| h.address.trim().is_empty()) {
            return Err(DeployError::Config(format!(
                "Host entry has an empty address: {:?}",
                host
            )));
        }
        if self.defaults.timeout_secs == Some(0) {
            return Err(DeployError::Config(
                "defaults.timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.dirs.iter().any(|d| d.path.as_os_str().is_empty()) {
            return Err(DeployError::Config("Directory step with empty path".to_string()));
        }
        for file in &self.files {
            if file.local.as_os_str().is_empty() || file.remote.as_os_str().is_empty() {
                return Err(DeployError::Config(format!(
                    "File step with empty path: {} -> {}",
                    file.local.display(),
                    file.remote.display()
                )));
            }
        }
        Ok(())
    }

    /// Connection settings for every host, layered host > plan defaults > `base`.
    pub fn host_configs(&self, base: &SshConfig) -> Vec<SshConfig> {
        self.hosts
            .iter()
            .map(|host| {
                let mut config = base.clone();
                config.hostname = host.address.clone();

                if let Some(user) = host.user.as_ref().or(self.defaults.user.as_ref()) {
                    config.user = user.clone();
                }
                if let Some(port) = host.port.or(self.defaults.port) {
                    config.port = port;
                }
                if let Some(secs) = self.defaults.timeout_secs {
                    config.timeout = Duration::from_secs(secs);
                }
                if !self.defaults.identity_file.is_empty() {
                    config.identity_file = self
                        .defaults
                        .identity_file
                        .iter()
                        .map(|p| expand_tilde(p))
                        .collect();
                }
                config
            })
            .collect()
    }
}

impl std::str::FromStr for Plan {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self> {
        let plan: Plan =
            toml::from_str(s).map_err(|e| DeployError::Config(format!("Invalid plan: {}", e)))?;
        plan.validate()?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"
[defaults]
user = "deploy"
port = 2222

[[hosts]]
address = "10.0.0.5"

[[hosts]]
address = "10.0.0.6"
user = "ops"
port = 22

[[dirs]]
path = "/srv/app"

[[files]]
local = "build/app.cfg"
remote = "/srv/app/app.cfg"
owner = "deploy"

[[files]]
local = "build/motd"
remote = "/etc/motd"
mode = "copy"
"#;

    #[test]
    fn test_parse_plan() {
        let plan: Plan = PLAN.parse().unwrap();

        assert_eq!(plan.hosts.len(), 2);
        assert_eq!(plan.dirs[0].path, PathBuf::from("/srv/app"));
        assert_eq!(plan.files[0].mode, TransferMode::Send);
        assert_eq!(plan.files[0].owner.as_deref(), Some("deploy"));
        assert_eq!(plan.files[1].mode, TransferMode::Copy);
    }

    #[test]
    fn test_host_configs_layering() {
        let plan: Plan = PLAN.parse().unwrap();
        let base = SshConfig {
            user: "cli-user".to_string(),
            password: Some("pw".to_string()),
            ..Default::default()
        };

        let configs = plan.host_configs(&base);
        assert_eq!(configs[0].hostname, "10.0.0.5");
        assert_eq!(configs[0].user, "deploy");
        assert_eq!(configs[0].port, 2222);
        assert_eq!(configs[0].password.as_deref(), Some("pw"));

        assert_eq!(configs[1].user, "ops");
        assert_eq!(configs[1].port, 22);
    }

    #[test]
    fn test_plan_without_hosts_is_rejected() {
        let err = "hosts = []".parse::<Plan>().unwrap_err();
        assert!(matches!(err, DeployError::Config(_)));
    }

    #[test]
    fn test_plan_zero_timeout_is_rejected() {
        let err = "[defaults]\ntimeout_secs = 0\n\n[[hosts]]\naddress = \"a\"\n"
            .parse::<Plan>()
            .unwrap_err();
        assert!(matches!(err, DeployError::Config(ref m) if m.contains("timeout_secs")));

        let plan: Plan = "[defaults]\ntimeout_secs = 1\n\n[[hosts]]\naddress = \"a\"\n"
            .parse()
            .unwrap();
        let configs = plan.host_configs(&SshConfig::default());
        assert_eq!(configs[0].timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_plan_unknown_field_is_rejected() {
        let err = "[[hosts]]\naddress = \"a\"\nhostname = \"b\"\n"
            .parse::<Plan>()
            .unwrap_err();
        assert!(err.to_string().contains("Invalid plan"));
    }

    #[test]
    fn test_plan_unknown_mode_is_rejected() {
        let text = r#"
[[hosts]]
address = "a"

[[files]]
local = "x"
remote = "/x"
mode = "rsync"
"#;
        assert!(text.parse::<Plan>().is_err());
    }

    #[test]
    fn test_address_formats() {
        let mut config = SshConfig {
            hostname: "example.com".to_string(),
            ..Default::default()
        };
        assert_eq!(config.address(), "example.com:22");

        config.hostname = "::1".to_string();
        config.port = 2200;
        assert_eq!(config.address(), "[::1]:2200");
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = SshConfig {
            password: Some("hunter2".to_string()),
            ..Default::default()
        };
        assert!(!format!("{:?}", config).contains("hunter2"));
    }

    #[test]
    fn test_expand_tilde() {
        assert_eq!(
            expand_tilde(Path::new("/etc/hosts")),
            PathBuf::from("/etc/hosts")
        );
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/x.cfg")), home.join("x.cfg"));
            assert_eq!(expand_tilde(Path::new("~")), home);
            assert_eq!(
                expand_tilde(Path::new("~/.ssh/id_ed25519")),
                home.join(".ssh/id_ed25519")
            );
        }
        assert_eq!(
            expand_tilde(Path::new("~deploy/x.cfg")),
            PathBuf::from("~deploy/x.cfg")
        );
        assert_eq!(
            expand_tilde(Path::new("dir/~/x.cfg")),
            PathBuf::from("dir/~/x.cfg")
        );
    }
}

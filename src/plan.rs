//! Plan runner - applies a `Plan` to every host in parallel.
//!
//! Each host gets its own session on a blocking task. Inside a host, steps
//! run in order and a failed step does not stop the ones after it.

use crate::config::{expand_tilde, Plan, SshConfig, TransferMode};
use crate::elevation::Elevation;
use crate::error::Result;
use crate::session::{DirStatus, FileSize, SendOutcome, Session};
use crate::transport::Transport;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StepStatus {
    Ok { detail: String },
    Failed { error: String },
}

/// One operation and how it went
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub step: String,
    #[serde(flatten)]
    pub status: StepStatus,
}

impl StepReport {
    pub fn from_result<T>(step: String, result: Result<T>, detail: impl FnOnce(T) -> String) -> Self {
        let status = match result {
            Ok(value) => StepStatus::Ok {
                detail: detail(value),
            },
            Err(e) => StepStatus::Failed {
                error: e.to_string(),
            },
        };
        Self { step, status }
    }

    /// A step that failed outside any session operation (e.g. `close`)
    pub fn failed(step: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            step: step.into(),
            status: StepStatus::Failed {
                error: error.to_string(),
            },
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.status, StepStatus::Ok { .. })
    }
}

impl fmt::Display for StepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            StepStatus::Ok { detail } if detail.is_empty() => write!(f, "{}", self.step),
            StepStatus::Ok { detail } => write!(f, "{} ({})", self.step, detail),
            StepStatus::Failed { error } => write!(f, "{}: {}", self.step, error),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HostReport {
    pub host: String,
    /// SSH user the host was (or would have been) reached as
    pub user: String,
    /// Set when the session could not be opened; no steps ran
    pub connect_error: Option<String>,
    pub steps: Vec<StepReport>,
}

impl HostReport {
    pub fn succeeded(&self) -> bool {
        self.connect_error.is_none() && self.steps.iter().all(StepReport::succeeded)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PlanReport {
    pub hosts: Vec<HostReport>,
}

impl PlanReport {
    pub fn succeeded(&self) -> bool {
        self.hosts.iter().all(HostReport::succeeded)
    }
}

// =============================================================================
// Step descriptions and details
// =============================================================================

pub fn describe_send(outcome: SendOutcome) -> String {
    match outcome {
        SendOutcome::Created { bytes } => format!("{} bytes, new file", bytes),
        SendOutcome::Replaced { backup, bytes } => {
            format!("{} bytes, previous kept at {}", bytes, backup.display())
        }
    }
}

pub fn describe_dir(status: DirStatus) -> String {
    match status {
        DirStatus::Created => "created".to_string(),
        DirStatus::Existed => "already present".to_string(),
    }
}

pub fn describe_size(size: FileSize) -> String {
    match size {
        FileSize::Present(bytes) => format!("{} bytes", bytes),
        FileSize::Missing => "does not exist".to_string(),
    }
}

/// Resolve a plan's local path: `~` expansion, then relative to `base_dir`.
fn resolve_local(base_dir: &Path, path: &Path) -> PathBuf {
    let path = expand_tilde(path);
    if path.is_relative() {
        base_dir.join(path)
    } else {
        path
    }
}

/// Run every step of `plan` through an open session.
pub fn apply_to_session<T: Transport, I>(
    session: &mut Session<T, I>,
    plan: &Plan,
    base_dir: &Path,
) -> Vec<StepReport> {
    let mut steps = Vec::new();

    for dir in &plan.dirs {
        steps.push(StepReport::from_result(
            format!("mkdir {}", dir.path.display()),
            session.create_dir_sftp(&dir.path),
            describe_dir,
        ));
        if let Some(owner) = &dir.owner {
            steps.push(StepReport::from_result(
                format!("chown {} {}", owner, dir.path.display()),
                session.change_owner(&dir.path, owner),
                |()| String::new(),
            ));
        }
    }

    for file in &plan.files {
        let local = resolve_local(base_dir, &file.local);
        let transferred = match file.mode {
            TransferMode::Send => StepReport::from_result(
                format!("send {} -> {}", local.display(), file.remote.display()),
                session.send_file(&local, &file.remote),
                describe_send,
            ),
            TransferMode::Copy => StepReport::from_result(
                format!("copy {} -> {}", local.display(), file.remote.display()),
                session.copy_file(&local, &file.remote),
                |bytes| format!("{} bytes", bytes),
            ),
        };
        let transferred_ok = transferred.succeeded();
        steps.push(transferred);

        if let (Some(owner), true) = (&file.owner, transferred_ok) {
            steps.push(StepReport::from_result(
                format!("chown {} {}", owner, file.remote.display()),
                session.change_owner(&file.remote, owner),
                |()| String::new(),
            ));
        }
    }

    steps
}

fn apply_to_host<T, F>(config: SshConfig, plan: &Plan, base_dir: &Path, connect: &F) -> HostReport
where
    T: Transport,
    F: Fn(&SshConfig) -> Result<T>,
{
    let host = config.hostname.clone();
    let user = config.user.clone();

    let transport = match connect(&config) {
        Ok(t) => t,
        Err(e) => {
            error!("Failed to connect to {}: {}", host, e);
            return HostReport {
                host,
                user,
                connect_error: Some(e.to_string()),
                steps: Vec::new(),
            };
        }
    };
    info!("Connected to {}", host);

    let mut session: Session<T> =
        Session::with_transport(host.clone(), transport, Elevation::sudo(config.password));
    let mut steps = apply_to_session(&mut session, plan, base_dir);

    if let Err(e) = session.close() {
        steps.push(StepReport::failed("close", &e));
    }

    HostReport {
        host,
        user,
        connect_error: None,
        steps,
    }
}

/// Apply `plan` to every host in `configs`, one blocking task per host.
///
/// `connect` opens the transport for one host. Reports keep the order of
/// `configs`.
pub async fn apply_plan<T, F>(
    plan: Arc<Plan>,
    configs: Vec<SshConfig>,
    base_dir: PathBuf,
    connect: F,
) -> PlanReport
where
    T: Transport + 'static,
    F: Fn(&SshConfig) -> Result<T> + Send + Sync + 'static,
{
    let connect = Arc::new(connect);
    let base_dir = Arc::new(base_dir);

    let handles: Vec<_> = configs
        .into_iter()
        .map(|config| {
            let host = config.hostname.clone();
            let user = config.user.clone();
            let plan = Arc::clone(&plan);
            let connect = Arc::clone(&connect);
            let base_dir = Arc::clone(&base_dir);
            let handle = tokio::task::spawn_blocking(move || {
                apply_to_host(config, &plan, &base_dir, connect.as_ref())
            });
            (host, user, handle)
        })
        .collect();

    let mut report = PlanReport::default();
    for (host, user, handle) in handles {
        let host_report = match handle.await {
            Ok(r) => r,
            Err(e) => {
                error!("Deploy task for {} failed: {}", host, e);
                HostReport {
                    host,
                    user,
                    connect_error: Some(format!("deploy task failed: {}", e)),
                    steps: Vec::new(),
                }
            }
        };
        report.hosts.push(host_report);
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeployError;
    use crate::transport::MemoryTransport;
    use std::collections::HashMap;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn plan(text: &str) -> Plan {
        text.parse().unwrap()
    }

    #[test]
    fn test_apply_to_session_order_and_owner() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("app.cfg"), "v2").unwrap();

        let remote = MemoryTransport::new()
            .with_dir("/srv")
            .with_file("/srv/app/app.cfg", "v1");
        let mut session: Session<MemoryTransport> =
            Session::with_transport("h", remote.clone(), Elevation::sudo(None));

        let plan = plan(
            r#"
[[hosts]]
address = "h"

[[dirs]]
path = "/srv/app"

[[files]]
local = "app.cfg"
remote = "/srv/app/app.cfg"
owner = "deploy"
"#,
        );

        let steps = apply_to_session(&mut session, &plan, temp.path());

        assert_eq!(steps.len(), 3);
        assert!(steps.iter().all(StepReport::succeeded), "{:?}", steps);
        assert_eq!(steps[0].step, "mkdir /srv/app");
        assert_eq!(
            steps[0].status,
            StepStatus::Ok {
                detail: "already present".to_string()
            }
        );
        assert!(steps[1].step.starts_with("send "));
        assert_eq!(steps[2].step, "chown deploy /srv/app/app.cfg");

        assert_eq!(remote.file("/srv/app/app.cfg").unwrap(), b"v2");
        assert_eq!(remote.file("/srv/app/app_old.cfg").unwrap(), b"v1");
        assert_eq!(remote.owner("/srv/app/app.cfg").as_deref(), Some("deploy"));
    }

    #[test]
    fn test_failed_transfer_skips_chown_but_continues() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("b.cfg"), "b").unwrap();

        let remote = MemoryTransport::new().with_dir("/srv");
        let mut session: Session<MemoryTransport> =
            Session::with_transport("h", remote.clone(), Elevation::sudo(None));

        let plan = plan(
            r#"
[[hosts]]
address = "h"

[[files]]
local = "missing.cfg"
remote = "/srv/a.cfg"
owner = "deploy"

[[files]]
local = "b.cfg"
remote = "/srv/b.cfg"
mode = "copy"
"#,
        );

        let steps = apply_to_session(&mut session, &plan, temp.path());

        assert_eq!(steps.len(), 2);
        assert!(!steps[0].succeeded());
        assert!(steps[1].succeeded());
        assert!(remote.commands().is_empty());
        assert_eq!(remote.file("/srv/b.cfg").unwrap(), b"b");
    }

    #[tokio::test]
    async fn test_apply_plan_reports_per_host() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("app.cfg"), "cfg").unwrap();

        let plan = Arc::new(plan(
            r#"
[[hosts]]
address = "good"

[[hosts]]
address = "unreachable"

[[files]]
local = "app.cfg"
remote = "/srv/app.cfg"
"#,
        ));
        let configs = plan.host_configs(&SshConfig::default());

        let remotes: Arc<Mutex<HashMap<String, MemoryTransport>>> = Default::default();
        let seen = Arc::clone(&remotes);
        let report = apply_plan(plan, configs, temp.path().to_path_buf(), move |config| {
            if config.hostname == "unreachable" {
                return Err(DeployError::Connection {
                    host: config.hostname.clone(),
                    message: "connection refused".to_string(),
                });
            }
            let remote = MemoryTransport::new().with_dir("/srv");
            seen.lock()
                .unwrap()
                .insert(config.hostname.clone(), remote.clone());
            Ok(remote)
        })
        .await;

        assert_eq!(report.hosts.len(), 2);
        assert_eq!(report.hosts[0].host, "good");
        assert!(report.hosts[0].succeeded());
        assert_eq!(report.hosts[1].host, "unreachable");
        assert!(report.hosts[1].connect_error.is_some());
        assert!(report.hosts[1].steps.is_empty());
        assert!(!report.succeeded());

        let remotes = remotes.lock().unwrap();
        let good = &remotes["good"];
        assert_eq!(good.file("/srv/app.cfg").unwrap(), b"cfg");
        assert!(good.is_closed());
    }

    #[test]
    fn test_report_json_shape() {
        let report = StepReport::from_result(
            "size /srv/app.cfg".to_string(),
            Ok(FileSize::Missing),
            describe_size,
        );
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["step"], "size /srv/app.cfg");
        assert_eq!(json["status"], "ok");
        assert_eq!(json["detail"], "does not exist");
    }

    #[test]
    fn test_failed_close_step() {
        let err = DeployError::transport("h", "disconnect: broken pipe");
        let step = StepReport::failed("close", &err);

        assert!(!step.succeeded());
        assert_eq!(step.to_string(), format!("close: {}", err));

        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["step"], "close");
        assert_eq!(json["status"], "failed");
    }

    #[test]
    fn test_resolve_local() {
        let base = Path::new("/plans");
        assert_eq!(resolve_local(base, Path::new("a.cfg")), PathBuf::from("/plans/a.cfg"));
        assert_eq!(resolve_local(base, Path::new("/abs.cfg")), PathBuf::from("/abs.cfg"));
    }
}

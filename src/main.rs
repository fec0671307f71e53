use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use rdeploy::config::{expand_tilde, Plan, SshConfig};
use rdeploy::plan::{self, HostReport, PlanReport, StepReport};
use rdeploy::transport::MemoryTransport;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rdeploy", version, about = "Deploy files over SSH, keeping backups of what they replace")]
struct Cli {
    /// Remote host (not needed for `apply`)
    #[arg(long, global = true)]
    host: Option<String>,

    #[arg(short, long, default_value_t = 22, global = true)]
    port: u16,

    /// SSH user (defaults to the local user name)
    #[arg(short, long, env = "VM_USER", global = true)]
    user: Option<String>,

    /// SSH password, also used for sudo
    #[arg(long, env = "VM_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,

    /// Private key file (repeatable)
    #[arg(short, long = "identity", global = true)]
    identity: Vec<PathBuf>,

    /// Connect and I/O timeout in seconds
    #[arg(long, default_value_t = 30, global = true, value_parser = clap::value_parser!(u64).range(1..))]
    timeout: u64,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file, moving any existing one to an `_old` backup first
    Send { local: PathBuf, remote: PathBuf },
    /// Upload a file, overwriting without a backup
    Copy { local: PathBuf, remote: PathBuf },
    /// Create a remote directory if it does not exist
    Mkdir { path: PathBuf },
    /// Print the size of a remote file
    Size { path: PathBuf },
    /// Set user and group of a remote path (via sudo)
    Chown { path: PathBuf, owner: String },
    /// Apply a TOML deployment plan to every host it lists
    Apply {
        plan: PathBuf,
        /// Rehearse against an empty in-memory remote instead of connecting
        #[arg(long)]
        dry_run: bool,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "rdeploy=info",
        1 => "rdeploy=debug",
        _ => "rdeploy=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

impl Cli {
    /// Connection settings with credential defaults resolved
    fn base_config(&self) -> SshConfig {
        SshConfig {
            hostname: self.host.clone().unwrap_or_default(),
            port: self.port,
            user: self.user.clone().unwrap_or_else(default_user),
            password: self.password.clone(),
            identity_file: self.identity.iter().map(|p| expand_tilde(p)).collect(),
            timeout: Duration::from_secs(self.timeout),
        }
    }
}

#[cfg(feature = "ssh")]
fn default_user() -> String {
    whoami::username()
}

#[cfg(not(feature = "ssh"))]
fn default_user() -> String {
    String::new()
}

#[cfg(feature = "ssh")]
fn run_single(config: SshConfig, command: Command) -> Result<Vec<StepReport>> {
    use rdeploy::SshSession;

    let mut session: SshSession = SshSession::open(&config)?;

    let report = match command {
        Command::Send { local, remote } => {
            let local = expand_tilde(&local);
            StepReport::from_result(
                format!("send {} -> {}", local.display(), remote.display()),
                session.send_file(&local, &remote),
                plan::describe_send,
            )
        }
        Command::Copy { local, remote } => {
            let local = expand_tilde(&local);
            StepReport::from_result(
                format!("copy {} -> {}", local.display(), remote.display()),
                session.copy_file(&local, &remote),
                |bytes| format!("{} bytes", bytes),
            )
        }
        Command::Mkdir { path } => StepReport::from_result(
            format!("mkdir {}", path.display()),
            session.create_dir_sftp(&path),
            plan::describe_dir,
        ),
        Command::Size { path } => StepReport::from_result(
            format!("size {}", path.display()),
            session.get_file_size(&path),
            plan::describe_size,
        ),
        Command::Chown { path, owner } => StepReport::from_result(
            format!("chown {} {}", owner, path.display()),
            session.change_owner(&path, &owner),
            |()| String::new(),
        ),
        Command::Apply { .. } => anyhow::bail!("`apply` does not take --host"),
    };

    let mut steps = vec![report];
    if let Err(e) = session.close() {
        steps.push(StepReport::failed("close", &e));
    }
    Ok(steps)
}

#[cfg(not(feature = "ssh"))]
fn run_single(_config: SshConfig, _command: Command) -> Result<Vec<StepReport>> {
    anyhow::bail!("rdeploy was built without SSH support; only `apply --dry-run` is available")
}

async fn run_apply(base: SshConfig, plan_path: &Path, dry_run: bool) -> Result<PlanReport> {
    let plan_path = expand_tilde(plan_path);
    let plan = Plan::load(&plan_path)?;
    let base_dir = plan_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let configs = plan.host_configs(&base);
    let plan = Arc::new(plan);

    if dry_run {
        return Ok(plan::apply_plan(plan, configs, base_dir, |_| {
            Ok(MemoryTransport::new().assume_parents(true))
        })
        .await);
    }

    apply_over_ssh(plan, configs, base_dir).await
}

#[cfg(feature = "ssh")]
async fn apply_over_ssh(
    plan: Arc<Plan>,
    configs: Vec<SshConfig>,
    base_dir: PathBuf,
) -> Result<PlanReport> {
    use rdeploy::transport::SshTransport;

    Ok(plan::apply_plan(plan, configs, base_dir, SshTransport::connect).await)
}

#[cfg(not(feature = "ssh"))]
async fn apply_over_ssh(
    _plan: Arc<Plan>,
    _configs: Vec<SshConfig>,
    _base_dir: PathBuf,
) -> Result<PlanReport> {
    anyhow::bail!("rdeploy was built without SSH support; use --dry-run")
}

fn print_host(report: &HostReport) {
    let header = if report.succeeded() {
        report.host.green().bold()
    } else {
        report.host.red().bold()
    };
    println!("{}", header);

    if let Some(error) = &report.connect_error {
        println!("  {} {}", "✗".red(), error);
    }
    for step in &report.steps {
        print_step(step);
    }
}

fn print_step(step: &StepReport) {
    if step.succeeded() {
        println!("  {} {}", "✓".green(), step);
    } else {
        println!("  {} {}", "✗".red(), step);
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // VM_USER / VM_PASSWORD may live in a project .env
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let base = cli.base_config();
    let json = cli.json;

    let succeeded = match cli.command {
        Command::Apply { plan, dry_run } => {
            let report = run_apply(base, &plan, dry_run)
                .await
                .with_context(|| format!("Failed to apply plan {}", plan.display()))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                report.hosts.iter().for_each(print_host);
            }
            report.succeeded()
        }
        command => {
            if base.hostname.is_empty() {
                anyhow::bail!("--host is required for this command");
            }
            let host = base.hostname.clone();
            let steps = tokio::task::spawn_blocking(move || run_single(base, command))
                .await
                .context("Deploy task failed")?
                .with_context(|| format!("Operation on {} failed", host))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&steps)?);
            } else {
                steps.iter().for_each(print_step);
            }
            steps.iter().all(StepReport::succeeded)
        }
    };

    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

//! In-memory transport.
//!
//! Keeps a fake remote filesystem, interprets the `mv` and `chown` commands
//! the session issues, and records everything dispatched. Clones share state,
//! so a test can keep a handle after handing the transport to a session.

use super::{CommandOutput, EntryKind, RemoteStat, Transport};
use crate::elevation::RemoteCommand;
use crate::error::{DeployError, Result};
use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

const HOST: &str = "memory";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    File(Vec<u8>),
    Dir,
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<PathBuf, Node>,
    owners: BTreeMap<PathBuf, String>,
    commands: Vec<RemoteCommand>,
    puts: Vec<(PathBuf, PathBuf)>,
    mkdirs: Vec<PathBuf>,
    stats: Vec<PathBuf>,
    broken_paths: HashSet<PathBuf>,
    fail_dispatch: bool,
    forced_status: Option<(i32, String)>,
    assume_parents: bool,
    closed: bool,
    close_calls: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<State>>,
}

/// Lexically normalise an absolute remote path (`.`/`..`/duplicate slashes)
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    out
}

impl MemoryTransport {
    /// Empty remote filesystem containing only `/`.
    pub fn new() -> Self {
        let transport = Self::default();
        transport.lock().nodes.insert(PathBuf::from("/"), Node::Dir);
        transport
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock only happens in a failing test
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Treat missing parent directories as present (dry runs).
    pub fn assume_parents(self, enabled: bool) -> Self {
        self.lock().assume_parents = enabled;
        self
    }

    /// Add a remote file, creating parent directories.
    pub fn with_file(self, path: impl AsRef<Path>, contents: impl Into<Vec<u8>>) -> Self {
        let path = normalize(path.as_ref());
        {
            let mut state = self.lock();
            if let Some(parent) = path.parent() {
                insert_dirs(&mut state, parent);
            }
            state.nodes.insert(path, Node::File(contents.into()));
        }
        self
    }

    /// Add a remote directory and its parents.
    pub fn with_dir(self, path: impl AsRef<Path>) -> Self {
        insert_dirs(&mut self.lock(), &normalize(path.as_ref()));
        self
    }

    /// Make every operation on `path` fail with a transport error.
    pub fn break_path(self, path: impl AsRef<Path>) -> Self {
        self.lock().broken_paths.insert(normalize(path.as_ref()));
        self
    }

    /// Make every command fail to dispatch.
    pub fn fail_dispatch(self) -> Self {
        self.lock().fail_dispatch = true;
        self
    }

    /// Make every command exit with `status` without side effects.
    pub fn force_exit_status(self, status: i32, stderr: impl Into<String>) -> Self {
        self.lock().forced_status = Some((status, stderr.into()));
        self
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.lock().nodes.contains_key(&normalize(path.as_ref()))
    }

    pub fn is_dir(&self, path: impl AsRef<Path>) -> bool {
        self.lock().nodes.get(&normalize(path.as_ref())) == Some(&Node::Dir)
    }

    /// Contents of a remote file
    pub fn file(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        match self.lock().nodes.get(&normalize(path.as_ref())) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn owner(&self, path: impl AsRef<Path>) -> Option<String> {
        self.lock().owners.get(&normalize(path.as_ref())).cloned()
    }

    /// Every command dispatched, in order
    pub fn commands(&self) -> Vec<RemoteCommand> {
        self.lock().commands.clone()
    }

    /// `(local, remote)` for every upload, in order
    pub fn puts(&self) -> Vec<(PathBuf, PathBuf)> {
        self.lock().puts.clone()
    }

    /// Every mkdir attempted, in order
    pub fn mkdirs(&self) -> Vec<PathBuf> {
        self.lock().mkdirs.clone()
    }

    /// Every path stat'ed, in order
    pub fn stats(&self) -> Vec<PathBuf> {
        self.lock().stats.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn close_calls(&self) -> usize {
        self.lock().close_calls
    }
}

fn insert_dirs(state: &mut State, path: &Path) {
    for ancestor in path.ancestors() {
        state
            .nodes
            .entry(ancestor.to_path_buf())
            .or_insert(Node::Dir);
    }
}

impl State {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(DeployError::transport(HOST, "transport is closed"))
        } else {
            Ok(())
        }
    }

    fn check_path(&self, path: &Path) -> Result<()> {
        if self.broken_paths.contains(path) {
            Err(DeployError::transport(
                HOST,
                format!("{}: permission denied", path.display()),
            ))
        } else {
            Ok(())
        }
    }

    fn parent_ready(&mut self, path: &Path) -> Result<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("/"));
        match self.nodes.get(parent) {
            Some(Node::Dir) => Ok(()),
            Some(Node::File(_)) => Err(DeployError::transport(
                HOST,
                format!("{}: not a directory", parent.display()),
            )),
            None if self.assume_parents => {
                insert_dirs(self, parent);
                Ok(())
            }
            None => Err(DeployError::NotFound(parent.to_path_buf())),
        }
    }

    fn run(&mut self, argv: &[String]) -> CommandOutput {
        let failed = |stderr: String| CommandOutput {
            status: 1,
            stdout: String::new(),
            stderr,
        };

        match argv {
            [cmd, dashdash, from, to] if cmd == "mv" && dashdash == "--" => {
                let from = normalize(Path::new(from));
                let to = normalize(Path::new(to));
                if self.broken_paths.contains(&from) || self.broken_paths.contains(&to) {
                    return failed(format!("mv: cannot move '{}': Permission denied", from.display()));
                }
                if !self.nodes.contains_key(&from) {
                    return failed(format!("mv: cannot stat '{}': No such file or directory", from.display()));
                }

                let moved: Vec<PathBuf> = self
                    .nodes
                    .keys()
                    .filter(|p| p.starts_with(&from))
                    .cloned()
                    .collect();
                for old in moved {
                    let new = match old.strip_prefix(&from) {
                        Ok(rest) if rest.as_os_str().is_empty() => to.clone(),
                        Ok(rest) => to.join(rest),
                        Err(_) => continue,
                    };
                    if let Some(node) = self.nodes.remove(&old) {
                        self.nodes.insert(new.clone(), node);
                    }
                    if let Some(owner) = self.owners.remove(&old) {
                        self.owners.insert(new, owner);
                    }
                }
                CommandOutput::default()
            }
            [cmd, spec, dashdash, path] if cmd == "chown" && dashdash == "--" => {
                let path = normalize(Path::new(path));
                if !self.nodes.contains_key(&path) {
                    return failed(format!(
                        "chown: cannot access '{}': No such file or directory",
                        path.display()
                    ));
                }
                let owner = spec.split(':').next().unwrap_or(spec).to_string();
                self.owners.insert(path, owner);
                CommandOutput::default()
            }
            _ => CommandOutput {
                status: 127,
                stdout: String::new(),
                stderr: format!("{}: command not found", argv.first().map(String::as_str).unwrap_or("")),
            },
        }
    }
}

impl Transport for MemoryTransport {
    fn exec(&mut self, command: &RemoteCommand) -> Result<CommandOutput> {
        let mut state = self.lock();
        state.check_open()?;
        if state.fail_dispatch {
            return Err(DeployError::transport(HOST, "channel request rejected"));
        }
        state.commands.push(command.clone());

        if let Some((status, stderr)) = state.forced_status.clone() {
            return Ok(CommandOutput {
                status,
                stdout: String::new(),
                stderr,
            });
        }
        Ok(state.run(command.argv()))
    }

    fn stat(&mut self, path: &Path) -> Result<RemoteStat> {
        let path = normalize(path);
        let mut state = self.lock();
        state.check_open()?;
        state.stats.push(path.clone());
        state.check_path(&path)?;

        match state.nodes.get(&path) {
            Some(Node::File(data)) => Ok(RemoteStat {
                size: data.len() as u64,
                kind: EntryKind::File,
            }),
            Some(Node::Dir) => Ok(RemoteStat {
                size: 4096,
                kind: EntryKind::Directory,
            }),
            None => Err(DeployError::NotFound(path)),
        }
    }

    fn put(&mut self, local: &Path, remote: &Path) -> Result<u64> {
        let remote = normalize(remote);
        let mut state = self.lock();
        state.check_open()?;
        state.check_path(&remote)?;

        let data = std::fs::read(local).map_err(|e| DeployError::LocalFile {
            path: local.to_path_buf(),
            source: e,
        })?;
        state.parent_ready(&remote)?;
        if state.nodes.get(&remote) == Some(&Node::Dir) {
            return Err(DeployError::transport(
                HOST,
                format!("{}: is a directory", remote.display()),
            ));
        }

        let len = data.len() as u64;
        state.puts.push((local.to_path_buf(), remote.clone()));
        state.nodes.insert(remote, Node::File(data));
        Ok(len)
    }

    fn mkdir(&mut self, path: &Path) -> Result<()> {
        let path = normalize(path);
        let mut state = self.lock();
        state.check_open()?;
        state.mkdirs.push(path.clone());
        state.check_path(&path)?;

        if state.nodes.contains_key(&path) {
            return Err(DeployError::transport(
                HOST,
                format!("{}: file exists", path.display()),
            ));
        }
        state.parent_ready(&path)?;
        state.nodes.insert(path, Node::Dir);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.close_calls += 1;
        state.closed = true;
        Ok(())
    }
}

//! Tool adapters: one external invocation per node attempt.
//!
//! The adapter turns bound parameter values into a deterministic command
//! line, runs it in a working directory owned by this attempt alone, and
//! maps the declared output patterns back to files. Two scoped guards keep
//! the filesystem and the process table clean on every exit path:
//!
//! * [`WorkDir`] removes the attempt directory on drop unless it is kept
//!   (committed to the store, or retained for inspection after a failure).
//! * `ChildGuard` kills and reaps the subprocess if it is still running when
//!   the adapter returns, whether by timeout, cancellation, an I/O error or a
//!   panic unwinding through the worker.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use glob::MatchOptions;

use crate::core::{CancelToken, Settings};
use crate::error::{Logs, ToolError};
use crate::template::{AdapterSpec, Builtin, CommandSpec};

/// Directory inside each working directory holding the captured streams.
/// Hidden so that output patterns like `*` never pick it up.
pub const LOG_DIR: &str = ".logs";

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: true,
};

/// Resolved parameter values: every parameter is a list of strings, a scalar
/// being a list of one.
pub type Params = BTreeMap<String, Vec<String>>;

/// Output name to the files it matched, sorted.
pub type Outputs = BTreeMap<String, Vec<Utf8PathBuf>>;

/// A fully expanded external invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl std::fmt::Display for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// What a successful invocation produced.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub outputs: Outputs,
    pub logs: Logs,
}

/// Working directory scoped to a single node attempt.
#[derive(Debug)]
pub struct WorkDir {
    path: Utf8PathBuf,
    keep: bool,
}

impl WorkDir {
    /// Creates a fresh, empty directory at `path`, wiping leftovers from an
    /// earlier attempt with the same name. The stored path is absolute, since
    /// tools run with the directory as their cwd.
    pub fn create(path: impl Into<Utf8PathBuf>) -> io::Result<Self> {
        let path = path.into();

        if path.exists() {
            fs::remove_dir_all(&path)?;
        }

        fs::create_dir_all(path.join(LOG_DIR))?;
        let path = path.canonicalize_utf8()?;

        Ok(Self { path, keep: false })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Disarms the cleanup and hands back the path.
    pub fn keep(mut self) -> Utf8PathBuf {
        self.keep = true;
        std::mem::take(&mut self.path)
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if !self.keep && !self.path.as_str().is_empty() {
            if let Err(err) = fs::remove_dir_all(&self.path) {
                tracing::debug!("couldn't remove {}: {}", self.path, err);
            }
        }
    }
}

/// Owns a spawned tool. On unix the tool leads its own process group, and
/// terminating it signals the whole group, so helpers started by wrapper
/// scripts go down with it.
struct ChildGuard(Child);

impl ChildGuard {
    fn terminate(&mut self) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;

            if let Ok(pgid) = i32::try_from(self.0.id()) {
                let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
            }
        }

        if let Ok(None) = self.0.try_wait() {
            let _ = self.0.kill();
        }

        let _ = self.0.wait();
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Runs nodes' adapters. One instance is shared by every worker of a run.
#[derive(Debug)]
pub struct ToolAdapter {
    base_env: BTreeMap<String, String>,
    poll_interval: Duration,
    cancel: CancelToken,
    invocations: AtomicUsize,
}

impl ToolAdapter {
    pub fn new(settings: &Settings, cancel: CancelToken) -> Self {
        Self {
            base_env: settings.base_env.clone(),
            poll_interval: settings.poll_interval,
            cancel,
            invocations: AtomicUsize::new(0),
        }
    }

    /// Number of times [`ToolAdapter::run`] has been called.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Expands the argument template of `command`. The same parameters and
    /// working directory always produce the same invocation.
    pub fn invocation(
        &self,
        command: &CommandSpec,
        params: &Params,
        outputs: &BTreeMap<String, String>,
        workdir: &Utf8Path,
    ) -> Result<Invocation, ToolError> {
        let mut args = Vec::with_capacity(command.args.len());

        for template in &command.args {
            args.extend(expand(template, params, outputs, workdir)?);
        }

        let mut env = self.base_env.clone();
        env.extend(command.env.clone());

        Ok(Invocation {
            program: command.program.clone(),
            args,
            env,
        })
    }

    /// Executes one attempt inside `workdir` and verifies the declared
    /// outputs.
    pub fn run(
        &self,
        adapter: &AdapterSpec,
        params: &Params,
        outputs: &BTreeMap<String, String>,
        workdir: &WorkDir,
        timeout: Option<Duration>,
    ) -> Result<ToolOutput, ToolError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);

        if self.cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        let logs = match adapter {
            AdapterSpec::Command(command) => {
                let invocation = self.invocation(command, params, outputs, workdir.path())?;
                self.spawn(&invocation, workdir.path(), timeout)?
            }
            AdapterSpec::Builtin { op } => run_builtin(*op, params, outputs, workdir.path())?,
        };

        let outputs = collect_outputs(outputs, workdir.path(), &logs)?;

        Ok(ToolOutput { outputs, logs })
    }

    fn spawn(
        &self,
        invocation: &Invocation,
        dir: &Utf8Path,
        timeout: Option<Duration>,
    ) -> Result<Logs, ToolError> {
        tracing::debug!("running {} in {}", invocation, dir);

        let stdout = File::create(dir.join(LOG_DIR).join("stdout.log"))?;
        let stderr = File::create(dir.join(LOG_DIR).join("stderr.log"))?;

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .env_clear()
            .envs(&invocation.env)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = command
            .spawn()
            .map_err(|source| ToolError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        let mut child = ChildGuard(child);
        let start = Instant::now();

        let status: ExitStatus = loop {
            if let Some(status) = child.0.try_wait()? {
                break status;
            }

            if self.cancel.is_cancelled() {
                child.terminate();
                return Err(ToolError::Cancelled);
            }

            if let Some(limit) = timeout.filter(|limit| start.elapsed() >= *limit) {
                tracing::warn!("{} exceeded {:.2?}, killing it", invocation.program, limit);
                child.terminate();
                return Err(ToolError::Timeout {
                    after: limit,
                    logs: read_logs(dir),
                });
            }

            std::thread::sleep(self.poll_interval);
        };

        let logs = read_logs(dir);

        if status.success() {
            Ok(logs)
        } else {
            Err(ToolError::Exit {
                code: status.code(),
                logs,
            })
        }
    }
}

/// Substitutes `{param}` and `{out:name}` placeholders in one argument.
///
/// An argument that is exactly `{param}` expands to one argument per value;
/// a placeholder embedded in a longer argument requires a single value.
/// `{{` and `}}` stand for literal braces.
fn expand(
    template: &str,
    params: &Params,
    outputs: &BTreeMap<String, String>,
    workdir: &Utf8Path,
) -> Result<Vec<String>, ToolError> {
    let lookup = |name: &str| -> Result<Vec<String>, ToolError> {
        if let Some(output) = name.strip_prefix("out:") {
            let pattern = outputs.get(output).ok_or_else(|| {
                ToolError::InvalidParameter(format!("unknown output placeholder {{{name}}}"))
            })?;
            return Ok(vec![workdir.join(pattern).into_string()]);
        }

        params
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::InvalidParameter(format!("missing parameter {{{name}}}")))
    };

    if let Some(name) = template
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .filter(|name| !name.contains(['{', '}']))
    {
        return lookup(name);
    }

    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(at) = rest.find(['{', '}']) {
        result.push_str(&rest[..at]);
        let tail = &rest[at..];

        if let Some(after) = tail.strip_prefix("{{") {
            result.push('{');
            rest = after;
            continue;
        }

        if let Some(after) = tail.strip_prefix("}}") {
            result.push('}');
            rest = after;
            continue;
        }

        if tail.starts_with('}') {
            return Err(ToolError::InvalidParameter(format!(
                "unmatched '}}' in '{template}', write '}}}}' for a literal brace"
            )));
        }

        let Some(close) = tail.find('}') else {
            return Err(ToolError::InvalidParameter(format!(
                "unterminated placeholder in '{template}'"
            )));
        };

        let name = &tail[1..close];
        match lookup(name)?.as_slice() {
            [value] => result.push_str(value),
            values => {
                return Err(ToolError::InvalidParameter(format!(
                    "parameter {{{name}}} has {} values but is embedded in '{template}'",
                    values.len()
                )));
            }
        }

        rest = &tail[close + 1..];
    }

    result.push_str(rest);
    Ok(vec![result])
}

fn read_logs(dir: &Utf8Path) -> Logs {
    let read = |name: &str| {
        fs::read(dir.join(LOG_DIR).join(name))
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default()
    };

    Logs {
        stdout: read("stdout.log"),
        stderr: read("stderr.log"),
    }
}

fn collect_outputs(
    declared: &BTreeMap<String, String>,
    dir: &Utf8Path,
    logs: &Logs,
) -> Result<Outputs, ToolError> {
    let mut outputs = Outputs::new();

    for (name, pattern) in declared {
        let full = dir.join(pattern);
        let mut files = Vec::new();

        for entry in glob::glob_with(full.as_str(), MATCH_OPTIONS)? {
            let path = entry.map_err(glob::GlobError::into_error)?;
            let path = Utf8PathBuf::try_from(path)
                .map_err(|err| ToolError::Io(err.into_io_error()))?;
            files.push(path);
        }

        if files.is_empty() {
            return Err(ToolError::MissingOutput {
                output: name.clone(),
                pattern: pattern.clone(),
                logs: logs.clone(),
            });
        }

        files.sort();
        outputs.insert(name.clone(), files);
    }

    Ok(outputs)
}

fn is_plain_name(pattern: &str) -> bool {
    !pattern.contains(['*', '?', '[', '/'])
}

fn run_builtin(
    op: Builtin,
    params: &Params,
    outputs: &BTreeMap<String, String>,
    dir: &Utf8Path,
) -> Result<Logs, ToolError> {
    let mut logs = Logs::default();

    match op {
        Builtin::Copy => {
            let inputs = params
                .get("in")
                .ok_or_else(|| ToolError::InvalidParameter("copy requires 'in'".into()))?;

            let rename = match (inputs.as_slice(), outputs.values().next()) {
                ([_], Some(pattern)) if outputs.len() == 1 && is_plain_name(pattern) => {
                    Some(pattern.as_str())
                }
                _ => None,
            };

            for input in inputs {
                let source = Utf8Path::new(input);
                let name = match rename {
                    Some(name) => name,
                    None => source.file_name().ok_or_else(|| {
                        ToolError::InvalidParameter(format!("'{input}' has no file name"))
                    })?,
                };

                fs::copy(source, dir.join(name))?;
                logs.stdout.push_str(&format!("copied {input} -> {name}\n"));
            }
        }
        Builtin::Touch => {
            let content = params
                .get("content")
                .map(|lines| lines.join("\n"))
                .unwrap_or_default();

            for pattern in outputs.values() {
                if !is_plain_name(pattern) {
                    return Err(ToolError::InvalidParameter(format!(
                        "touch needs plain file names, got '{pattern}'"
                    )));
                }

                fs::write(dir.join(pattern), &content)?;
                logs.stdout.push_str(&format!("wrote {pattern}\n"));
            }
        }
    }

    Ok(logs)
}

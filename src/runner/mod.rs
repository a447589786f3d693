//! External command execution.
//!
//! [`CommandRunner`] is the only way stages reach the package manager,
//! compiler toolchain and service manager. [`SystemRunner`] spawns real
//! processes; [`mock::MockRunner`] records calls and returns scripted output.
//!
//! Exit status is the only thing interpreted unless a [`CommandSpec`]
//! carries an output matcher (see [`CommandSpec::expect_stdout`]).

pub mod mock;

use std::fmt;
use std::io::{Read, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A command line plus everything needed to run it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
    pub expect_stdout: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Treat the command as failed unless stdout contains `needle`.
    pub fn expect_stdout(mut self, needle: impl Into<String>) -> Self {
        self.expect_stdout = Some(needle.into());
        self
    }

    /// The command line as a single string, used for logs and mock matching.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(|part| {
                if part.is_empty() || part.contains(char::is_whitespace) {
                    format!("'{}'", part)
                } else {
                    part.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// How a command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    Success,
    /// Non-zero exit; `None` when the process was killed by a signal or
    /// could not be spawned for a reason other than a missing binary.
    NonZeroExit(Option<i32>),
    NotFound,
    TimedOut(Duration),
    /// Exit was zero but the output matcher did not match.
    OutputMismatch { expected: String },
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandStatus::Success => write!(f, "succeeded"),
            CommandStatus::NonZeroExit(Some(code)) => write!(f, "exited with status {}", code),
            CommandStatus::NonZeroExit(None) => write!(f, "terminated abnormally"),
            CommandStatus::NotFound => write!(f, "was not found"),
            CommandStatus::TimedOut(after) => write!(f, "timed out after {}s", after.as_secs()),
            CommandStatus::OutputMismatch { expected } => {
                write!(f, "did not report '{}'", expected)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: CommandStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Success,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn exit(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::NonZeroExit(Some(code)),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: CommandStatus::NotFound,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn timed_out(after: Duration) -> Self {
        Self {
            status: CommandStatus::TimedOut(after),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Success
    }
}

/// A command that did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("command `{command}` {status}{}", stderr_suffix(.stderr))]
pub struct CommandError {
    pub command: String,
    pub status: CommandStatus,
    pub stderr: String,
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {}", trimmed)
    }
}

/// Executes external commands on behalf of stages.
pub trait CommandRunner {
    /// Run the command and report how it ended, without applying the matcher.
    fn execute(&self, spec: &CommandSpec) -> CommandOutput;

    /// Whether `tool` resolves on the search path.
    fn tool_exists(&self, tool: &str) -> bool;

    /// Block for `duration`. Retry backoff and service settle delays go
    /// through here.
    fn pause(&self, duration: Duration) {
        thread::sleep(duration);
    }

    /// Run the command, apply the output matcher and fail on anything but
    /// success.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let output = classify(spec, self.execute(spec));
        if output.is_success() {
            Ok(output)
        } else {
            Err(CommandError {
                command: spec.command_line(),
                status: output.status,
                stderr: output.stderr,
            })
        }
    }

    /// Convenience predicate for precondition and postcondition probes.
    fn succeeds(&self, spec: &CommandSpec) -> bool {
        self.run(spec).is_ok()
    }
}

fn classify(spec: &CommandSpec, mut output: CommandOutput) -> CommandOutput {
    if let Some(needle) = &spec.expect_stdout {
        if output.is_success() && !output.stdout.contains(needle.as_str()) {
            output.status = CommandStatus::OutputMismatch {
                expected: needle.clone(),
            };
        }
    }
    output
}

/// Runs commands as real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn execute(&self, spec: &CommandSpec) -> CommandOutput {
        tracing::debug!(command = %spec, "running command");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        if spec.timeout.is_some() {
            // own group, so a timeout also takes down what the command spawned
            cmd.process_group(0);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(command = %spec, "command not found");
                return CommandOutput::not_found();
            }
            Err(e) => {
                return CommandOutput {
                    status: CommandStatus::NonZeroExit(None),
                    stdout: String::new(),
                    stderr: format!("failed to spawn {}: {}", spec.program, e),
                }
            }
        };

        if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            let command = spec.command_line();
            thread::spawn(move || {
                if let Err(e) = stdin.write_all(input.as_bytes()) {
                    tracing::debug!(command = %command, error = %e, "writing stdin failed");
                }
            });
        }
        let stdout = child.stdout.take().map(|pipe| thread::spawn(move || read_pipe(pipe)));
        let stderr = child.stderr.take().map(|pipe| thread::spawn(move || read_pipe(pipe)));

        let status = match wait_with_deadline(&mut child, spec.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let after = spec.timeout.unwrap_or_default();
                tracing::debug!(command = %spec, secs = after.as_secs(), "command timed out");
                return CommandOutput {
                    stdout: join_reader(stdout),
                    stderr: join_reader(stderr),
                    ..CommandOutput::timed_out(after)
                };
            }
            Err(e) => {
                return CommandOutput {
                    status: CommandStatus::NonZeroExit(None),
                    stdout: String::new(),
                    stderr: format!("failed waiting for {}: {}", spec.program, e),
                }
            }
        };

        let stdout = join_reader(stdout);
        let stderr = join_reader(stderr);

        CommandOutput {
            status: if status.success() {
                CommandStatus::Success
            } else {
                CommandStatus::NonZeroExit(status.code())
            },
            stdout,
            stderr,
        }
    }

    fn tool_exists(&self, tool: &str) -> bool {
        which::which(tool).is_ok()
    }
}

fn read_pipe(mut pipe: impl Read) -> String {
    let mut buf = Vec::new();
    if let Err(e) = pipe.read_to_end(&mut buf) {
        tracing::debug!(error = %e, "reading command output failed");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn join_reader(handle: Option<thread::JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// SIGKILL the child's process group, falling back to the child alone.
fn kill_group(child: &mut Child) {
    let Ok(pgid) = i32::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    // SAFETY: kill has no memory-safety preconditions; a negative pid names
    // the group the child leads (set up with process_group(0)).
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        tracing::debug!(
            pgid,
            error = %std::io::Error::last_os_error(),
            "killing process group failed"
        );
        if let Err(e) = child.kill() {
            tracing::debug!(error = %e, "killing child failed");
        }
    }
}

/// Wait for the child, killing it once `timeout` elapses.
///
/// Returns `Ok(None)` when the deadline was hit.
fn wait_with_deadline(
    child: &mut Child,
    timeout: Option<Duration>,
) -> std::io::Result<Option<ExitStatus>> {
    let Some(timeout) = timeout else {
        return child.wait().map(Some);
    };
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            kill_group(child);
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

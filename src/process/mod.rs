//! External process execution.
//!
//! A runner spawns exactly one child per invocation, sends its standard output
//! and standard error into the same log file, and waits for it to exit. It
//! never retries and never judges the exit status; that is left to the stage
//! that asked for the invocation.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::ProcessError;

/// Everything needed to start one external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// File piped to the child's standard input.
    pub stdin: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
    /// Variables added on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Created or truncated; receives stdout and stderr.
    pub log_path: PathBuf,
    /// The artifact this invocation is expected to produce, if it is a single file.
    pub artifact: Option<PathBuf>,
    /// Kill the child when it runs longer than this.
    pub timeout: Option<Duration>,
}

impl ProcessInvocation {
    pub fn new(program: impl Into<PathBuf>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            cwd: None,
            env: Vec::new(),
            log_path: log_path.into(),
            artifact: None,
            timeout: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifact = Some(path.into());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    /// Value following `flag` in the argument list, e.g. the target of `-o`.
    pub fn arg_after(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|arg| arg == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    /// Value of a `KEY:value` style argument.
    pub fn keyed_arg(&self, key: &str) -> Option<&str> {
        let prefix = format!("{}:", key);
        self.args
            .iter()
            .find_map(|arg| arg.strip_prefix(prefix.as_str()))
    }
}

impl fmt::Display for ProcessInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Outcome of one finished invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// `None` when the child was terminated by a signal.
    pub exit_code: Option<i32>,
    pub log_path: PathBuf,
    pub artifact: Option<PathBuf>,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs external commands on behalf of the stages.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run one invocation to completion.
    async fn run(&self, invocation: &ProcessInvocation) -> Result<ExecutionResult, ProcessError>;
}

/// Runner backed by real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessRunner;

impl SystemProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessRunner for SystemProcessRunner {
    async fn run(&self, invocation: &ProcessInvocation) -> Result<ExecutionResult, ProcessError> {
        let program = invocation.program_name();
        let log = open_log(&invocation.log_path)?;
        // Both streams share one file description so output stays in emission order.
        let stderr_log = log.try_clone().map_err(|source| ProcessError::Log {
            path: invocation.log_path.clone(),
            source,
        })?;

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr_log))
            .kill_on_drop(true);
        match &invocation.stdin {
            Some(path) => {
                let input = File::open(path).map_err(|source| ProcessError::Stdin {
                    path: path.clone(),
                    source,
                })?;
                command.stdin(Stdio::from(input));
            }
            None => {
                command.stdin(Stdio::null());
            }
        }
        if let Some(dir) = &invocation.cwd {
            command.current_dir(dir);
        }
        for (key, value) in &invocation.env {
            command.env(key, value);
        }

        debug!(command = %invocation, log = %invocation.log_path.display(), "spawning");
        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;

        let status = match invocation.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(waited) => waited,
                Err(_) => {
                    warn!(program = %program, limit_secs = limit.as_secs(), "time limit exceeded, killing child");
                    if let Err(err) = child.kill().await {
                        warn!(program = %program, error = %err, "failed to kill child");
                    }
                    return Err(ProcessError::TimedOut { program, limit });
                }
            },
            None => child.wait().await,
        }
        .map_err(|source| ProcessError::Wait {
            program: program.clone(),
            source,
        })?;

        let duration = started.elapsed();
        debug!(program = %program, exit_code = ?status.code(), elapsed_ms = duration.as_millis() as u64, "child exited");
        Ok(ExecutionResult {
            exit_code: status.code(),
            log_path: invocation.log_path.clone(),
            artifact: invocation.artifact.clone(),
            duration,
        })
    }
}

fn open_log(path: &Path) -> Result<File, ProcessError> {
    File::create(path).map_err(|source| ProcessError::Log {
        path: path.to_path_buf(),
        source,
    })
}

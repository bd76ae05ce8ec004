//! Control of the monitored Moltbot process.
//!
//! [`ProcessController`] is the seam the command processor drives; the shell
//! implementation runs the configured command lines directly (split with
//! `shell-words`, never through `sh -c`) under a timeout.
//!
//! When no stop or status command settles the question, running processes
//! are listed with `ps` and matched against `process_pattern`. The watcher's
//! own process and anything running the watcher binary are never matched, so
//! the kill switch cannot take the watcher down with it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::MoltbotConfig;

/// Lists every process as `<pid> <argv...>` without headers.
const PS_COMMAND: &str = "ps -axo pid=,args=";

/// Binary name of the watcher itself.
const WATCHER_BINARY: &str = env!("CARGO_PKG_NAME");

/// Liveness of the monitored process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// The process is alive.
    Running,
    /// The process is not running.
    Stopped,
    /// Liveness could not be determined.
    Unknown,
}

impl ProcessStatus {
    /// Lowercase label used in replies.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        }
    }
}

/// Errors from invoking an external process-control command.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// No command is configured for this action.
    #[error("no {0} command configured")]
    NotConfigured(&'static str),

    /// The command line could not be split into arguments.
    #[error("invalid command line `{command}`: {reason}")]
    InvalidCommand {
        /// Offending command line.
        command: String,
        /// Parser message.
        reason: String,
    },

    /// The program could not be spawned.
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        /// Command line that failed.
        command: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// `process_pattern` is not a valid regex.
    #[error("invalid process pattern `{pattern}`: {source}")]
    InvalidPattern {
        /// Offending pattern.
        pattern: String,
        /// Regex compile error.
        #[source]
        source: regex::Error,
    },

    /// No running process matched `process_pattern`.
    #[error("no running process matches `{0}`")]
    NoMatch(String),

    /// The command did not finish within the timeout.
    #[error("`{command}` timed out after {secs}s")]
    Timeout {
        /// Command line that timed out.
        command: String,
        /// Timeout that elapsed.
        secs: u64,
    },

    /// The command exited unsuccessfully.
    #[error("`{command}` exited with {status}: {output}")]
    Failed {
        /// Command line that failed.
        command: String,
        /// Exit status description.
        status: String,
        /// Trimmed stderr (or stdout when stderr was empty).
        output: String,
    },
}

/// Start, stop and check on the monitored process.
#[async_trait]
pub trait ProcessController: Send + Sync {
    /// Start the process. Returns a short success description.
    async fn start(&self) -> Result<String, ProcessError>;

    /// Stop the process. Returns a short success description.
    async fn stop(&self) -> Result<String, ProcessError>;

    /// Determine whether the process is running.
    async fn is_running(&self) -> ProcessStatus;
}

/// Captured result of a finished command.
#[derive(Debug)]
struct CommandOutput {
    success: bool,
    code: Option<i32>,
    status: String,
    stdout: String,
    stderr: String,
}

/// [`ProcessController`] backed by configured shell command lines.
#[derive(Debug, Clone)]
pub struct ShellProcessController {
    start_command: String,
    stop_command: String,
    status_command: Option<String>,
    process_pattern: Regex,
    pid_file: Option<PathBuf>,
    timeout: Duration,
}

impl ShellProcessController {
    /// Build from the `[moltbot]` config section.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::InvalidPattern`] if `process_pattern` does not
    /// compile.
    pub fn from_config(config: &MoltbotConfig) -> Result<Self, ProcessError> {
        let process_pattern =
            Regex::new(&config.process_pattern).map_err(|source| ProcessError::InvalidPattern {
                pattern: config.process_pattern.clone(),
                source,
            })?;
        Ok(Self {
            start_command: config.start_command.clone(),
            stop_command: config.stop_command.clone(),
            status_command: non_empty(&config.status_command),
            process_pattern,
            pid_file: non_empty(&config.pid_file).map(|p| crate::config::expand_home(&p)),
            timeout: Duration::from_secs(config.command_timeout_secs),
        })
    }

    /// Override the invocation timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run a command line to completion under the timeout.
    async fn run(&self, command_line: &str) -> Result<CommandOutput, ProcessError> {
        let argv = shell_words::split(command_line).map_err(|e| ProcessError::InvalidCommand {
            command: command_line.to_owned(),
            reason: e.to_string(),
        })?;
        let Some((program, args)) = argv.split_first() else {
            return Err(ProcessError::InvalidCommand {
                command: command_line.to_owned(),
                reason: "empty command".to_owned(),
            });
        };

        debug!(command = command_line, "running process-control command");
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| ProcessError::Timeout {
                command: command_line.to_owned(),
                secs: self.timeout.as_secs(),
            })?
            .map_err(|source| ProcessError::Spawn {
                command: command_line.to_owned(),
                source,
            })?;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            status: output.status.to_string(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        })
    }

    /// Run a command line and require a successful exit.
    async fn run_checked(&self, command_line: &str) -> Result<CommandOutput, ProcessError> {
        let output = self.run(command_line).await?;
        if output.success {
            return Ok(output);
        }
        let detail = if output.stderr.is_empty() {
            output.stdout.clone()
        } else {
            output.stderr.clone()
        };
        Err(ProcessError::Failed {
            command: command_line.to_owned(),
            status: output.status,
            output: detail,
        })
    }

    /// Running processes whose command line matches `process_pattern`,
    /// excluding the watcher.
    async fn matching_processes(&self) -> Result<Vec<MatchedProcess>, ProcessError> {
        let table = self.run_checked(PS_COMMAND).await?;
        let own_pid = std::process::id();
        Ok(parse_process_table(&table.stdout)
            .filter(|p| p.pid != own_pid)
            .filter(|p| p.command_line != PS_COMMAND)
            .filter(|p| !is_watcher_command(&p.command_line))
            .filter(|p| self.process_pattern.is_match(&p.command_line))
            .collect())
    }

    /// Send SIGTERM to every matching process.
    async fn terminate_matching(&self) -> Result<String, ProcessError> {
        let matched = self.matching_processes().await?;
        if matched.is_empty() {
            return Err(ProcessError::NoMatch(self.process_pattern.as_str().to_owned()));
        }

        let pids: Vec<String> = matched.iter().map(|p| p.pid.to_string()).collect();
        for process in &matched {
            info!(pid = process.pid, command = %process.command_line, "terminating process");
        }
        self.run_checked(&format!("kill -TERM {}", pids.join(" ")))
            .await?;
        Ok(format!("sent SIGTERM to pid {}", pids.join(", ")))
    }

    /// `kill -0` against the pid recorded in `pid_file`.
    async fn pid_file_status(&self) -> Option<ProcessStatus> {
        let path = self.pid_file.as_ref()?;
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Some(ProcessStatus::Stopped);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read pid file");
                return None;
            }
        };
        let Ok(pid) = contents.trim().parse::<u32>() else {
            warn!(path = %path.display(), "pid file does not contain a pid");
            return None;
        };

        match self.run(&format!("kill -0 {pid}")).await {
            Ok(output) if output.success => Some(ProcessStatus::Running),
            Ok(_) => Some(ProcessStatus::Stopped),
            Err(e) => {
                warn!(error = %e, "pid liveness check failed");
                Some(ProcessStatus::Unknown)
            }
        }
    }

    /// Exit status mapping for `status_command`.
    async fn exit_code_status(&self, command_line: &str) -> ProcessStatus {
        match self.run(command_line).await {
            Ok(output) => match output.code {
                Some(0) => ProcessStatus::Running,
                Some(1) => ProcessStatus::Stopped,
                _ => {
                    warn!(command = command_line, status = %output.status, "unexpected status exit");
                    ProcessStatus::Unknown
                }
            },
            Err(e) => {
                warn!(error = %e, "liveness check failed");
                ProcessStatus::Unknown
            }
        }
    }
}

#[async_trait]
impl ProcessController for ShellProcessController {
    async fn start(&self) -> Result<String, ProcessError> {
        if self.start_command.trim().is_empty() {
            return Err(ProcessError::NotConfigured("start"));
        }
        info!(command = %self.start_command, "starting moltbot");
        self.run_checked(&self.start_command).await?;
        Ok(format!("ran `{}`", self.start_command))
    }

    async fn stop(&self) -> Result<String, ProcessError> {
        if !self.stop_command.trim().is_empty() {
            info!(command = %self.stop_command, "stopping moltbot");
            match self.run_checked(&self.stop_command).await {
                Ok(_) => return Ok(format!("ran `{}`", self.stop_command)),
                Err(e) => warn!(error = %e, "stop command failed, falling back to pkill"),
            }
        }

        self.terminate_matching().await
    }

    async fn is_running(&self) -> ProcessStatus {
        if let Some(status) = self.pid_file_status().await {
            return status;
        }
        if let Some(status_command) = &self.status_command {
            return self.exit_code_status(status_command).await;
        }
        match self.matching_processes().await {
            Ok(matched) if matched.is_empty() => ProcessStatus::Stopped,
            Ok(_) => ProcessStatus::Running,
            Err(e) => {
                warn!(error = %e, "process listing failed");
                ProcessStatus::Unknown
            }
        }
    }
}

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedProcess {
    /// Process id.
    pub pid: u32,
    /// Full command line as reported by `ps`.
    pub command_line: String,
}

/// Parse `ps -o pid=,args=` output. Malformed rows are skipped.
pub fn parse_process_table(table: &str) -> impl Iterator<Item = MatchedProcess> + '_ {
    table.lines().filter_map(|row| {
        let (pid, command_line) = row.trim_start().split_once(char::is_whitespace)?;
        Some(MatchedProcess {
            pid: pid.parse().ok()?,
            command_line: command_line.trim().to_owned(),
        })
    })
}

/// Whether a command line runs the watcher binary.
pub fn is_watcher_command(command_line: &str) -> bool {
    command_line
        .split_whitespace()
        .next()
        .and_then(|argv0| Path::new(argv0).file_name())
        .is_some_and(|name| name == WATCHER_BINARY)
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

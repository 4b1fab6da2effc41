//! Shell command execution with full output capture.
//!
//! Commands are shell command lines, run through `sh -c` on Unix and `cmd /C`
//! on Windows. Output is captured in full; on Windows it is routed through
//! temporary files and read back after exit. There is no timeout for
//! foreground commands: a hanging tool hangs the run.

use crate::timing::TimingLog;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Error type for command execution.
#[derive(Debug)]
pub enum ProcessError {
    /// The shell itself could not be spawned.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// The command exited non-zero where success was required.
    Failed(Box<ProcessResult>),
    /// The command succeeded but wrote unexpected output to stderr.
    UnexpectedStderr(Box<ProcessResult>),
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::Spawn { command, source } => {
                write!(f, "failed to spawn `{command}`: {source}")
            }
            ProcessError::Failed(result) => {
                write!(f, "command returned exit code {}.\n{result}", result.exit_code)
            }
            ProcessError::UnexpectedStderr(result) => {
                write!(f, "command wrote to STDERR.\n{result}")
            }
        }
    }
}

impl std::error::Error for ProcessError {}

/// Immutable record of one finished command.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub command: String,
    pub cwd: Option<PathBuf>,
    /// The exact environment the command ran with.
    pub env: HashMap<String, String>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub run_time: Duration,
}

impl fmt::Display for ProcessResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "$ {}", self.command)?;
        if let Some(cwd) = &self.cwd {
            writeln!(f, "cwd: {}", cwd.display())?;
        }
        writeln!(f, "exit code: {}", self.exit_code)?;
        writeln!(f, "stdout:\n{}", self.stdout)?;
        write!(f, "stderr:\n{}", self.stderr)
    }
}

/// A command ready to run: a shell command line plus the working directory and
/// the complete environment it will see.
#[derive(Debug, Clone)]
pub struct Process {
    command: String,
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
    tolerated_stderr: Option<String>,
    timing: Option<Arc<TimingLog>>,
}

impl Process {
    /// Create a process from a shell command line.
    ///
    /// The child sees exactly `env`, nothing inherited.
    pub fn create(
        command: impl Into<String>,
        cwd: Option<&Path>,
        env: HashMap<String, String>,
    ) -> Self {
        Process {
            command: command.into(),
            cwd: cwd.map(Path::to_path_buf),
            env,
            tolerated_stderr: None,
            timing: None,
        }
    }

    /// Tolerate one specific stderr line in [`Process::run_check_stderr`].
    pub fn tolerate_stderr_line(mut self, line: Option<String>) -> Self {
        self.tolerated_stderr = line;
        self
    }

    /// Record this command's duration into a timing log.
    pub fn with_timing(mut self, timing: Option<Arc<TimingLog>>) -> Self {
        self.timing = timing;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Run to completion and capture everything. Non-zero exit is not an
    /// error here; only spawn failure is.
    pub fn run(&self) -> Result<ProcessResult, ProcessError> {
        let start = Instant::now();
        let (stdout, stderr, exit_code) = self.execute()?;
        let run_time = start.elapsed();

        if let Some(timing) = &self.timing {
            timing.record_command(&self.command, run_time);
        }

        Ok(ProcessResult {
            command: self.command.clone(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            stdout,
            stderr,
            exit_code,
            run_time,
        })
    }

    /// Run and require a zero exit code.
    pub fn run_check(&self) -> Result<ProcessResult, ProcessError> {
        let result = self.run()?;
        if result.exit_code != 0 {
            return Err(ProcessError::Failed(Box::new(result)));
        }
        Ok(result)
    }

    /// Run and require a zero exit code and clean stderr.
    ///
    /// One tolerated line is allowed: when stderr consists of exactly one
    /// non-empty line containing the configured benign substring, it passes.
    pub fn run_check_stderr(&self) -> Result<ProcessResult, ProcessError> {
        let result = self.run()?;
        if result.exit_code != 0 {
            return Err(ProcessError::Failed(Box::new(result)));
        }
        if !stderr_is_clean(&result.stderr, self.tolerated_stderr.as_deref()) {
            return Err(ProcessError::UnexpectedStderr(Box::new(result)));
        }
        Ok(result)
    }

    #[cfg(not(windows))]
    fn execute(&self) -> Result<(String, String, i32), ProcessError> {
        let output = self
            .shell_command()
            .stdin(Stdio::null())
            .output()
            .map_err(|source| ProcessError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        Ok((
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
            output.status.code().unwrap_or(-1),
        ))
    }

    #[cfg(windows)]
    fn execute(&self) -> Result<(String, String, i32), ProcessError> {
        // Pipes deadlock under cmd.exe for large outputs; capture through
        // temporary files instead. The files are removed on drop.
        fn spawn_err(command: &str) -> impl FnOnce(std::io::Error) -> ProcessError + '_ {
            move |source| ProcessError::Spawn {
                command: command.to_string(),
                source,
            }
        }

        let out_file = tempfile::NamedTempFile::new().map_err(spawn_err(&self.command))?;
        let err_file = tempfile::NamedTempFile::new().map_err(spawn_err(&self.command))?;

        let status = self
            .shell_command()
            .stdin(Stdio::null())
            .stdout(out_file.reopen().map_err(spawn_err(&self.command))?)
            .stderr(err_file.reopen().map_err(spawn_err(&self.command))?)
            .status()
            .map_err(spawn_err(&self.command))?;

        let stdout = std::fs::read_to_string(out_file.path()).unwrap_or_default();
        let stderr = std::fs::read_to_string(err_file.path()).unwrap_or_default();
        Ok((stdout, stderr, status.code().unwrap_or(-1)))
    }

    fn shell_command(&self) -> Command {
        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C");
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c");
            c
        };
        cmd.arg(&self.command);
        cmd.env_clear();
        cmd.envs(&self.env);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }
}

fn stderr_is_clean(stderr: &str, tolerated: Option<&str>) -> bool {
    if stderr.trim().is_empty() {
        return true;
    }
    let Some(tolerated) = tolerated else {
        return false;
    };
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    lines.len() == 1 && lines[0].contains(tolerated)
}

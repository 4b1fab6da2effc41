//! Per-scenario environment management.
//!
//! Each scenario gets its own `ScenarioContext`: a variable table, a lazily
//! created run directory, an optional scenario-scoped cache dir, background
//! process handles, mock rules and the last command result. Teardown is
//! explicit and ordered; directory removal failures are errors, killing an
//! already-gone process is not.

use crate::config::HarnessConfig;
use crate::mock::{self, MockRule};
use crate::process::{Process, ProcessResult};
use crate::suite::{EnvError, SuiteState};
use crate::{fsx, vars};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a scenario finished, on the framework result-code scale.
///
/// The run dir is kept for post-mortems only when the code exceeds the
/// "worth keeping" threshold of 10.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioOutcome {
    Passed,
    Skipped,
    Pending,
    Failed,
}

impl ScenarioOutcome {
    pub fn code(self) -> u8 {
        match self {
            ScenarioOutcome::Passed => 0,
            ScenarioOutcome::Skipped => 10,
            ScenarioOutcome::Pending => 20,
            ScenarioOutcome::Failed => 99,
        }
    }

    fn keep_run_dir(self) -> bool {
        self.code() > 10
    }
}

/// Which captured stream a step refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

struct BackgroundProcess {
    child: Child,
    command: String,
}

/// Everything one scenario owns.
pub struct ScenarioContext {
    suite: Arc<SuiteState>,
    pub variables: HashMap<String, String>,
    last_result: Option<ProcessResult>,
    /// Emails the shim suppressed, counted from marker lines.
    pub email_sends: usize,
    run_dir: Option<PathBuf>,
    scenario_cache_dir: Option<PathBuf>,
    background: Vec<BackgroundProcess>,
    mocks: Vec<MockRule>,
    mock_file: Option<PathBuf>,
    infix: String,
    started: Instant,
    torn_down: bool,
}

impl ScenarioContext {
    /// `feature_file` and `line` identify the scenario; they become part of
    /// every directory name this scenario creates.
    pub fn new(suite: Arc<SuiteState>, feature_file: &str, line: u32) -> Self {
        let basename = Path::new(feature_file)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "scenario".to_string());
        let infix = format!("{basename}.{line}");

        let config = suite.config();
        let mut variables = HashMap::new();
        variables.insert("DB_NAME".to_string(), config.db.name.clone());
        variables.insert("DB_USER".to_string(), config.db.user.clone());
        variables.insert("DB_PASSWORD".to_string(), config.db.pass.clone());
        variables.insert("DB_HOST".to_string(), config.db.host.clone());
        variables.insert(
            "DB_TYPE".to_string(),
            match config.db.driver {
                crate::config::DbDriver::Postgres => "postgres".to_string(),
                crate::config::DbDriver::Sqlite => "sqlite".to_string(),
            },
        );
        variables.insert(
            "CACHE_DIR".to_string(),
            config.general_cache_dir().display().to_string(),
        );
        if let Some(src) = &config.source_dir {
            variables.insert("SRC_DIR".to_string(), src.display().to_string());
        }

        ScenarioContext {
            suite,
            variables,
            last_result: None,
            email_sends: 0,
            run_dir: None,
            scenario_cache_dir: None,
            background: Vec::new(),
            mocks: Vec::new(),
            mock_file: None,
            infix,
            started: Instant::now(),
            torn_down: false,
        }
    }

    pub fn suite(&self) -> &Arc<SuiteState> {
        &self.suite
    }

    fn config(&self) -> &HarnessConfig {
        self.suite.config()
    }

    /// The scenario's working directory, created on first use. Repeated calls
    /// return the same path.
    pub fn run_dir(&mut self) -> Result<PathBuf, EnvError> {
        if let Some(dir) = &self.run_dir {
            return Ok(dir.clone());
        }
        let config = self.config();
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-test-run-{}-", config.product, self.infix))
            .tempdir_in(&config.temp_root)
            .map_err(EnvError::io("creating run dir"))?
            .keep();
        tracing::debug!(dir = %dir.display(), "run dir created");
        self.variables
            .insert("RUN_DIR".to_string(), dir.display().to_string());
        self.run_dir = Some(dir.clone());
        Ok(dir)
    }

    /// Create (or replace) the scenario-scoped cache dir, exported to
    /// subprocesses as the tool's cache-dir override and to steps as
    /// `{SUITE_CACHE_DIR}`.
    pub fn create_cache_dir(&mut self) -> Result<PathBuf, EnvError> {
        if let Some(previous) = self.scenario_cache_dir.take() {
            fsx::remove_dir(&previous)
                .map_err(EnvError::io(format!("removing {}", previous.display())))?;
        }
        let config = self.config();
        let dir = tempfile::Builder::new()
            .prefix(&format!(
                "{}-test-suite-cache-{}-",
                config.product, self.infix
            ))
            .tempdir_in(&config.temp_root)
            .map_err(EnvError::io("creating scenario cache dir"))?
            .keep();
        self.variables
            .insert("SUITE_CACHE_DIR".to_string(), dir.display().to_string());
        self.scenario_cache_dir = Some(dir.clone());
        Ok(dir)
    }

    /// Expand every placeholder form a step may contain.
    pub fn expand(&self, text: &str) -> String {
        let mut out = text.to_string();
        if out.contains("{INVOKE_TOOL_WITH_ARGS-") {
            out = vars::expand_invocations(&out, self.suite.invoke_strategy());
        }
        out = vars::expand(&out, &self.variables);
        if out.contains("{VERSION-") {
            out = vars::expand_versions(&out, self.suite.version_index());
        }
        out
    }

    /// Build a [`Process`] for an already-expanded command line, rooted at
    /// `subdir` under the run dir.
    pub fn proc(&mut self, command: &str, subdir: &str) -> Result<Process, EnvError> {
        let run_dir = self.run_dir()?;
        let cwd = if subdir.is_empty() {
            run_dir
        } else {
            let dir = run_dir.join(subdir);
            std::fs::create_dir_all(&dir)
                .map_err(EnvError::io(format!("creating {}", dir.display())))?;
            dir
        };

        let mut env = self.suite.process_env()?;
        let config = self.config();
        if let Some(cache_dir) = &self.scenario_cache_dir {
            env.insert(config.cache_dir_var(), cache_dir.display().to_string());
        }
        if let Some(mock_file) = &self.mock_file {
            env.insert(config.mock_file_var(), mock_file.display().to_string());
        }

        Ok(Process::create(command, Some(&cwd), env)
            .tolerate_stderr_line(config.benign_stderr_line.clone())
            .with_timing(self.suite.timing()))
    }

    /// Run a command that must succeed with clean stderr ("When I run ...").
    pub fn run_cmd(&mut self, command: &str, subdir: &str) -> Result<&ProcessResult, EnvError> {
        let command = self.expand(command);
        let result = self
            .proc(&command, subdir)?
            .run_check_stderr()
            .map_err(EnvError::Command)?;
        Ok(self.store_result(result))
    }

    /// Run a command whose outcome the scenario inspects itself
    /// ("When I try ...").
    pub fn try_cmd(&mut self, command: &str, subdir: &str) -> Result<&ProcessResult, EnvError> {
        let command = self.expand(command);
        let result = self
            .proc(&command, subdir)?
            .run()
            .map_err(EnvError::Command)?;
        Ok(self.store_result(result))
    }

    fn store_result(&mut self, mut result: ProcessResult) -> &ProcessResult {
        result.stdout = self.capture_email_sends(&result.stdout);
        self.last_result.insert(result)
    }

    /// Strip the shim's suppressed-email marker lines from stdout, counting
    /// each into the scenario.
    fn capture_email_sends(&mut self, stdout: &str) -> String {
        let marker = self.config().email_marker();
        let mut kept = Vec::new();
        for line in stdout.split_inclusive('\n') {
            if line.trim_end().starts_with(&marker) {
                self.email_sends += 1;
            } else {
                kept.push(line);
            }
        }
        kept.concat()
    }

    /// The most recent foreground command result.
    pub fn last_result(&self) -> Option<&ProcessResult> {
        self.last_result.as_ref()
    }

    pub fn last_stdout(&self) -> &str {
        self.last_result.as_ref().map_or("", |r| &r.stdout)
    }

    pub fn last_stderr(&self) -> &str {
        self.last_result.as_ref().map_or("", |r| &r.stderr)
    }

    /// Save a captured stream into the variable table, without its trailing
    /// newlines, so `{KEY}` splices cleanly into later command lines.
    pub fn save_output_as(&mut self, stream: OutputStream, key: &str) {
        let value = match stream {
            OutputStream::Stdout => self.last_stdout(),
            OutputStream::Stderr => self.last_stderr(),
        };
        self.variables
            .insert(key.to_string(), value.trim_end_matches('\n').to_string());
    }

    /// Launch a long-running command in its own process group.
    ///
    /// The process gets a settle window; exiting during it is an error
    /// carrying the captured stderr.
    pub fn background(&mut self, command: &str) -> Result<(), EnvError> {
        let command = self.expand(command);
        let run_dir = self.run_dir()?;
        let env = self.suite.process_env()?;

        let mut cmd = shell_command(&command);
        cmd.env_clear();
        cmd.envs(&env);
        cmd.current_dir(&run_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(EnvError::io(format!("spawning `{command}`")))?;

        std::thread::sleep(Duration::from_secs(1));
        match child.try_wait() {
            Ok(Some(_status)) => {
                let stderr = child
                    .stderr
                    .take()
                    .and_then(|mut s| {
                        use std::io::Read;
                        let mut buf = String::new();
                        s.read_to_string(&mut buf).ok().map(|_| buf)
                    })
                    .unwrap_or_default();
                Err(EnvError::BackgroundExited { command, stderr })
            }
            Ok(None) => {
                tracing::debug!(pid = child.id(), %command, "background process settled");
                self.background.push(BackgroundProcess { child, command });
                Ok(())
            }
            Err(source) => Err(EnvError::Io {
                context: format!("polling `{command}`"),
                source,
            }),
        }
    }

    /// Register an outbound-request mock and publish the shim file.
    pub fn add_mock(&mut self, pattern: &str, body: &str) -> Result<(), EnvError> {
        self.mocks.push(MockRule {
            pattern: self.expand(pattern),
            body: body.to_string(),
        });
        let run_dir = self.run_dir()?;
        let path = mock::write_mock_file(&self.mocks, &run_dir)
            .map_err(EnvError::io("writing mock file"))?;
        self.mock_file = Some(path);
        Ok(())
    }

    /// Ordered scenario teardown. Call exactly once, with the outcome.
    pub fn teardown(&mut self, outcome: ScenarioOutcome) -> Result<(), EnvError> {
        self.torn_down = true;

        if let Some(run_dir) = self.run_dir.take() {
            if outcome.keep_run_dir() {
                tracing::info!(dir = %run_dir.display(), "keeping run dir for inspection");
            } else {
                fsx::remove_dir(&run_dir)
                    .map_err(EnvError::io(format!("removing {}", run_dir.display())))?;
            }
        }

        if let Some(cache_dir) = self.scenario_cache_dir.take() {
            fsx::remove_dir(&cache_dir)
                .map_err(EnvError::io(format!("removing {}", cache_dir.display())))?;
        }

        // The tool writes its global config under the isolated HOME; one
        // scenario's config must not leak into the next.
        let config = self.config();
        let global_config = config
            .home_dir()
            .join(format!(".{}", config.tool))
            .join("config.yml");
        fsx::remove_file(&global_config)
            .map_err(EnvError::io(format!("removing {}", global_config.display())))?;

        for mut proc in self.background.drain(..) {
            tracing::debug!(
                pid = proc.child.id(),
                command = %proc.command,
                "terminating background process"
            );
            terminate_tree(proc.child.id())?;
            let _ = proc.child.wait();
        }

        if let Some(timing) = self.suite.timing() {
            timing.record_scenario(&self.infix, self.started.elapsed());
        }
        Ok(())
    }
}

impl Drop for ScenarioContext {
    fn drop(&mut self) {
        // Backstop only; ordered teardown with error reporting is explicit.
        if !self.torn_down {
            for proc in &mut self.background {
                let _ = proc.child.kill();
                let _ = proc.child.wait();
            }
        }
    }
}

fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(command);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command);
        c
    }
}

/// Kill a process and all of its descendants.
///
/// The pid is assumed to lead its own process group (background processes are
/// spawned that way), so the group signal catches the whole tree; individually
/// enumerated descendants cover children that changed groups. Processes that
/// are already gone are not an error.
#[cfg(unix)]
pub fn terminate_tree(pid: u32) -> Result<(), EnvError> {
    let descendants = collect_descendants(pid);
    signal_tolerant(|| unsafe { libc::killpg(pid as i32, libc::SIGKILL) }, pid)?;
    for child in descendants {
        signal_tolerant(|| unsafe { libc::kill(child as i32, libc::SIGKILL) }, child)?;
    }
    Ok(())
}

#[cfg(unix)]
fn signal_tolerant(send: impl FnOnce() -> i32, pid: u32) -> Result<(), EnvError> {
    if send() == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(EnvError::Kill {
        pid,
        message: err.to_string(),
    })
}

/// Transitive children of `pid`, found by walking the system process table.
#[cfg(unix)]
fn collect_descendants(pid: u32) -> Vec<u32> {
    let Ok(output) = Command::new("ps").args(["-eo", "pid=,ppid="]).output() else {
        return Vec::new();
    };
    let mut children_of: HashMap<u32, Vec<u32>> = HashMap::new();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let mut parts = line.split_whitespace();
        if let (Some(child), Some(parent)) = (parts.next(), parts.next())
            && let (Ok(child), Ok(parent)) = (child.parse(), parent.parse())
        {
            children_of.entry(parent).or_default().push(child);
        }
    }

    let mut found = Vec::new();
    let mut queue = vec![pid];
    while let Some(current) = queue.pop() {
        if let Some(children) = children_of.get(&current) {
            for &child in children {
                found.push(child);
                queue.push(child);
            }
        }
    }
    found
}

#[cfg(windows)]
pub fn terminate_tree(pid: u32) -> Result<(), EnvError> {
    let output = Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .output()
        .map_err(|source| EnvError::Io {
            context: format!("taskkill for pid {pid}"),
            source,
        })?;
    // 128: no such process.
    match output.status.code() {
        Some(0) | Some(128) => Ok(()),
        code => Err(EnvError::Kill {
            pid,
            message: format!("taskkill exited with {code:?}"),
        }),
    }
}

//! Suite-level shared state.
//!
//! One `SuiteState` lives for the whole test run. It owns the expensive
//! discoveries (subprocess env template, invoke strategy, version index) as
//! explicitly memoized values, the optional timing log, and the staged copy
//! of the tool's own source tree.

use crate::config::HarnessConfig;
use crate::fsx;
use crate::timing::TimingLog;
use crate::vars::InvokeStrategy;
use crate::versions::VersionIndex;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

/// Error type for environment management.
#[derive(Debug)]
pub enum EnvError {
    Io {
        context: String,
        source: io::Error,
    },
    /// The tool binary could not be located anywhere.
    MissingBinDir {
        tool: String,
    },
    /// Staging the tool's source tree was requested without `source_dir`.
    NoSourceDir,
    /// A foreground command failed in a way the step cannot tolerate.
    Command(crate::process::ProcessError),
    /// A background process died during its settle window.
    BackgroundExited {
        command: String,
        stderr: String,
    },
    /// A live process could not be killed.
    Kill {
        pid: u32,
        message: String,
    },
}

impl std::fmt::Display for EnvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvError::Io { context, source } => write!(f, "{context}: {source}"),
            EnvError::MissingBinDir { tool } => {
                write!(f, "could not locate the '{tool}' binary (set the bin dir)")
            }
            EnvError::NoSourceDir => {
                write!(f, "no source_dir configured; cannot stage a source checkout")
            }
            EnvError::Command(e) => write!(f, "{e}"),
            EnvError::BackgroundExited { command, stderr } => {
                write!(f, "background process `{command}` exited early:\n{stderr}")
            }
            EnvError::Kill { pid, message } => write!(f, "killing pid {pid}: {message}"),
        }
    }
}

impl std::error::Error for EnvError {}

impl EnvError {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> EnvError {
        let context = context.into();
        move |source| EnvError::Io { context, source }
    }
}

/// State shared by every scenario of one suite run.
pub struct SuiteState {
    config: HarnessConfig,
    env_template: OnceLock<HashMap<String, String>>,
    invoke: OnceLock<InvokeStrategy>,
    versions: OnceLock<Option<VersionIndex>>,
    timing: Option<Arc<TimingLog>>,
    local_source: Mutex<Option<PathBuf>>,
}

impl SuiteState {
    pub fn new(config: HarnessConfig) -> Arc<Self> {
        let timing = config.log_run_times.then(|| {
            let spec = std::env::var(config.log_run_times_var()).unwrap_or_default();
            Arc::new(TimingLog::from_env_value(&spec))
        });
        Arc::new(SuiteState {
            config,
            env_template: OnceLock::new(),
            invoke: OnceLock::new(),
            versions: OnceLock::new(),
            timing,
            local_source: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn timing(&self) -> Option<Arc<TimingLog>> {
        self.timing.clone()
    }

    /// Run once before the first scenario: installed-state caches never
    /// survive across suite runs.
    pub fn prepare(&self) -> Result<(), EnvError> {
        let install_cache = self.config.install_cache_dir();
        tracing::debug!(dir = %install_cache.display(), "clearing install cache");
        fsx::remove_dir(&install_cache)
            .map_err(EnvError::io(format!("clearing {}", install_cache.display())))
    }

    /// The environment template every subprocess starts from. Built once.
    pub fn process_env(&self) -> Result<HashMap<String, String>, EnvError> {
        if let Some(env) = self.env_template.get() {
            return Ok(env.clone());
        }
        let built = self.build_env()?;
        Ok(self.env_template.get_or_init(|| built).clone())
    }

    fn build_env(&self) -> Result<HashMap<String, String>, EnvError> {
        let config = &self.config;
        let bin_dir = config
            .resolve_bin_dir()
            .ok_or_else(|| EnvError::MissingBinDir {
                tool: config.tool.clone(),
            })?;

        let mut env = HashMap::new();

        let host_path = std::env::var_os("PATH").unwrap_or_default();
        let mut paths = vec![bin_dir.clone()];
        paths.extend(std::env::split_paths(&host_path));
        let joined = std::env::join_paths(paths).map_err(|source| EnvError::Io {
            context: "prefixing PATH with the bin dir".to_string(),
            source: io::Error::other(source),
        })?;
        env.insert("PATH".to_string(), joined.to_string_lossy().into_owned());
        env.insert(config.run_flag_var(), "1".to_string());

        let home = config.home_dir();
        std::fs::create_dir_all(&home)
            .map_err(EnvError::io(format!("creating {}", home.display())))?;
        env.insert("HOME".to_string(), home.display().to_string());

        // Host settings the tool is allowed to see.
        for var in [
            config.config_path_var(),
            config.allow_root_var(),
            config.interpreter_args_var(),
            config.interpreter_bin_var(),
            "TERM".to_string(),
            "CI_BUILD_DIR".to_string(),
        ] {
            if let Ok(value) = std::env::var(&var) {
                env.insert(var, value);
            }
        }

        tracing::debug!(bin_dir = %bin_dir.display(), "subprocess env template built");
        Ok(env)
    }

    /// How `{INVOKE_TOOL_WITH_ARGS-...}` renders. Detected once.
    pub fn invoke_strategy(&self) -> &InvokeStrategy {
        self.invoke
            .get_or_init(|| InvokeStrategy::detect(&self.config))
    }

    /// The upstream version index, fetched once. `None` when unconfigured or
    /// the fetch failed; `{VERSION-...}` placeholders then pass through.
    pub fn version_index(&self) -> Option<&VersionIndex> {
        self.versions
            .get_or_init(|| {
                let url = self.config.version_index_url.as_ref()?;
                match VersionIndex::fetch(url) {
                    Ok(index) => Some(index),
                    Err(e) => {
                        tracing::warn!(error = %e, "version index fetch failed");
                        None
                    }
                }
            })
            .as_ref()
    }

    /// Copy the tool's own source tree into a scratch checkout, once per
    /// suite. `.git` and build artifacts stay behind.
    pub fn stage_local_source(&self) -> Result<PathBuf, EnvError> {
        let mut staged = self
            .local_source
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(path) = staged.as_ref() {
            return Ok(path.clone());
        }

        let source = self.config.source_dir.as_ref().ok_or(EnvError::NoSourceDir)?;
        let dest = tempfile::Builder::new()
            .prefix(&format!("{}-test-local-source-", self.config.product))
            .tempdir_in(&self.config.temp_root)
            .map_err(EnvError::io("creating local source dir"))?
            .keep();

        copy_source_tree(source, &dest)
            .map_err(EnvError::io(format!("staging {}", source.display())))?;

        *staged = Some(dest.clone());
        Ok(dest)
    }

    /// Run once after the last scenario. Returns the timing report, if any,
    /// for the caller to print.
    pub fn teardown(&self) -> Result<Option<String>, EnvError> {
        let staged = self
            .local_source
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(path) = staged {
            fsx::remove_dir(&path)
                .map_err(EnvError::io(format!("removing {}", path.display())))?;
        }
        Ok(self.timing.as_ref().map(|t| t.report()))
    }
}

fn copy_source_tree(src: &std::path::Path, dest: &std::path::Path) -> io::Result<()> {
    std::fs::create_dir_all(dest)?;
    let walker = walkdir::WalkDir::new(src)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            name != ".git" && name != "target" && name != "node_modules"
        });
    for entry in walker {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

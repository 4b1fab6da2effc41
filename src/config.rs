//! Harness configuration.
//!
//! Everything the harness needs to know about the tool under test: its name,
//! how it is invoked, where caches live and how the test database is reached.
//! Values come from a `fixtest.yaml`/`fixtest.toml` file (see [`crate::loader`])
//! with environment-variable overrides layered on top. All derived environment
//! variable names follow the product name, so a product of `wp-cli` yields
//! `WP_CLI_TEST_DBNAME` and friends.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Known-benign stderr line tolerated by `run_check_stderr` by default.
pub const DEFAULT_BENIGN_STDERR: &str =
    "The PSR-0 `Requests_...` class names in the Request library are deprecated.";

/// Which database server backs installed fixtures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DbDriver {
    /// PostgreSQL server.
    Postgres,
    /// Embedded SQLite file inside the installed tree.
    Sqlite,
}

/// Database connection settings for provisioned fixtures.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DbSettings {
    #[serde(default = "default_db_driver")]
    pub driver: DbDriver,
    #[serde(default = "default_db_name")]
    pub name: String,
    #[serde(default = "default_db_user")]
    pub user: String,
    #[serde(default = "default_db_pass")]
    pub pass: String,
    /// Host, optionally `host:port`.
    #[serde(default = "default_db_host")]
    pub host: String,
}

impl Default for DbSettings {
    fn default() -> Self {
        DbSettings {
            driver: default_db_driver(),
            name: default_db_name(),
            user: default_db_user(),
            pass: default_db_pass(),
            host: default_db_host(),
        }
    }
}

fn default_db_driver() -> DbDriver {
    DbDriver::Sqlite
}
fn default_db_name() -> String {
    "fixtest_test".to_string()
}
fn default_db_user() -> String {
    "fixtest_test".to_string()
}
fn default_db_pass() -> String {
    "password1".to_string()
}
fn default_db_host() -> String {
    "127.0.0.1".to_string()
}

/// Top-level harness configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    /// Product name; prefixes every temp directory and derived env var.
    #[serde(default = "default_product")]
    pub product: String,
    /// Name of the executable under test.
    #[serde(default = "default_tool")]
    pub tool: String,
    /// Interpreter the tool's bundle form runs under (shebang detection).
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Directory containing the tool binary. Discovered via PATH when unset.
    #[serde(default)]
    pub bin_dir: Option<PathBuf>,
    /// URL of the upstream version-index document (`{"offers": [...]}`).
    #[serde(default)]
    pub version_index_url: Option<String>,
    /// URL template for released self-contained bundles; `{version}` is
    /// substituted.
    #[serde(default)]
    pub bundle_url_template: Option<String>,
    /// The tool's own source tree, staged into a scratch checkout on demand.
    #[serde(default)]
    pub source_dir: Option<PathBuf>,
    /// Root for every cache and run directory the harness creates.
    #[serde(default = "default_temp_root")]
    pub temp_root: PathBuf,
    #[serde(default)]
    pub db: DbSettings,
    /// Name of the config file `config create` produces in the app root.
    #[serde(default = "default_config_file")]
    pub config_file: String,
    /// Location of the embedded database file, relative to the app root.
    #[serde(default = "default_sqlite_db_file")]
    pub sqlite_db_file: PathBuf,
    /// URL of a zip bundle carrying the embedded-database drop-in plugin,
    /// installed into every provisioned app when the sqlite driver is active.
    #[serde(default)]
    pub db_plugin_url: Option<String>,
    /// Where the drop-in bundle is extracted, relative to the app root.
    #[serde(default = "default_db_plugin_dir")]
    pub db_plugin_dir: PathBuf,
    /// Single stderr line `run_check_stderr` tolerates.
    #[serde(default = "default_benign_stderr")]
    pub benign_stderr_line: Option<String>,
    /// Collect per-command and per-scenario run times.
    #[serde(default)]
    pub log_run_times: bool,
}

fn default_product() -> String {
    "fixtest".to_string()
}
fn default_tool() -> String {
    "fixtest".to_string()
}
fn default_interpreter() -> String {
    "php".to_string()
}
fn default_temp_root() -> PathBuf {
    std::env::temp_dir()
}
fn default_config_file() -> String {
    "config.php".to_string()
}
fn default_sqlite_db_file() -> PathBuf {
    PathBuf::from("data/app.sqlite")
}
fn default_db_plugin_dir() -> PathBuf {
    PathBuf::from("content/mu-plugins")
}
fn default_benign_stderr() -> Option<String> {
    Some(DEFAULT_BENIGN_STDERR.to_string())
}

impl Default for HarnessConfig {
    fn default() -> Self {
        HarnessConfig {
            product: default_product(),
            tool: default_tool(),
            interpreter: default_interpreter(),
            bin_dir: None,
            version_index_url: None,
            bundle_url_template: None,
            source_dir: None,
            temp_root: default_temp_root(),
            db: DbSettings::default(),
            config_file: default_config_file(),
            sqlite_db_file: default_sqlite_db_file(),
            db_plugin_url: None,
            db_plugin_dir: default_db_plugin_dir(),
            benign_stderr_line: default_benign_stderr(),
            log_run_times: false,
        }
    }
}

fn env_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

impl HarnessConfig {
    /// Prefix for harness-owned env vars, e.g. `FIXTEST_TEST`.
    pub fn env_prefix(&self) -> String {
        format!("{}_TEST", env_name(&self.product))
    }

    /// Prefix for env vars the tool itself reads, e.g. `FIXTEST`.
    pub fn tool_env(&self) -> String {
        env_name(&self.tool)
    }

    pub fn bin_dir_var(&self) -> String {
        format!("{}_BIN_DIR", self.env_prefix())
    }

    pub fn version_var(&self) -> String {
        format!("{}_VERSION", self.env_prefix())
    }

    pub fn log_run_times_var(&self) -> String {
        format!("{}_LOG_RUN_TIMES", self.env_prefix())
    }

    /// Flag set in every subprocess so the tool can detect it runs under test.
    pub fn run_flag_var(&self) -> String {
        format!("{}_RUN", self.env_prefix())
    }

    pub fn mock_file_var(&self) -> String {
        format!("{}_MOCK_FILE", self.env_prefix())
    }

    pub fn cache_dir_var(&self) -> String {
        format!("{}_CACHE_DIR", self.tool_env())
    }

    pub fn config_path_var(&self) -> String {
        format!("{}_CONFIG_PATH", self.tool_env())
    }

    pub fn allow_root_var(&self) -> String {
        format!("{}_ALLOW_ROOT", self.tool_env())
    }

    /// Extra arguments passed to the interpreter, e.g. `FIXTEST_PHP_ARGS`.
    pub fn interpreter_args_var(&self) -> String {
        format!("{}_{}_ARGS", self.tool_env(), env_name(&self.interpreter))
    }

    /// Pinned interpreter binary, e.g. `FIXTEST_PHP`.
    pub fn interpreter_bin_var(&self) -> String {
        format!("{}_{}", self.tool_env(), env_name(&self.interpreter))
    }

    pub fn db_var(&self, suffix: &str) -> String {
        format!("{}_DB{}", self.env_prefix(), suffix)
    }

    /// Prefix of the marker line the email-suppression shim prints for each
    /// email it swallows.
    pub fn email_marker(&self) -> String {
        format!("{} test suite: Sent email to", self.tool)
    }

    /// App version pinned for this run, from `{PREFIX}_VERSION`.
    pub fn pinned_version(&self) -> Option<String> {
        std::env::var(self.version_var())
            .ok()
            .filter(|v| !v.is_empty())
    }

    fn versioned_dir(&self, stem: &str) -> PathBuf {
        let suffix = self
            .pinned_version()
            .map(|v| format!("-{v}"))
            .unwrap_or_default();
        self.temp_root
            .join(format!("{}-test-{stem}{suffix}", self.product))
    }

    /// Pristine upstream tree, shared across runs, never auto-invalidated.
    pub fn download_cache_dir(&self) -> PathBuf {
        self.versioned_dir("core-download-cache")
    }

    /// Installed-state overlays and dumps, rebuilt every suite run.
    pub fn install_cache_dir(&self) -> PathBuf {
        self.versioned_dir("core-install-cache")
    }

    /// General-purpose cache exposed to scenarios as `{CACHE_DIR}`.
    pub fn general_cache_dir(&self) -> PathBuf {
        self.temp_root.join(format!("{}-test-cache", self.product))
    }

    /// Isolated HOME handed to every subprocess.
    pub fn home_dir(&self) -> PathBuf {
        self.temp_root.join(format!("{}-test-home", self.product))
    }

    /// Directory holding the tool binary: configured, from env, or the PATH
    /// entry `which` finds the tool in.
    pub fn resolve_bin_dir(&self) -> Option<PathBuf> {
        if let Some(dir) = &self.bin_dir {
            return Some(dir.clone());
        }
        if let Ok(dir) = std::env::var(self.bin_dir_var())
            && !dir.is_empty()
        {
            return Some(PathBuf::from(dir));
        }
        which::which(&self.tool)
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
    }

    /// Apply `{PREFIX}_*` environment overrides on top of loaded values.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var(self.db_var("TYPE")) {
            match v.to_ascii_lowercase().as_str() {
                "postgres" | "postgresql" => self.db.driver = DbDriver::Postgres,
                "sqlite" => self.db.driver = DbDriver::Sqlite,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var(self.db_var("NAME")) {
            self.db.name = v;
        }
        if let Ok(v) = std::env::var(self.db_var("USER")) {
            self.db.user = v;
        }
        if let Ok(v) = std::env::var(self.db_var("PASS")) {
            self.db.pass = v;
        }
        if let Ok(v) = std::env::var(self.db_var("HOST")) {
            self.db.host = v;
        }
        if let Ok(v) = std::env::var(self.bin_dir_var())
            && !v.is_empty()
        {
            self.bin_dir = Some(PathBuf::from(v));
        }
        if std::env::var(self.log_run_times_var()).is_ok() {
            self.log_run_times = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_env_names_follow_product() {
        let mut config = HarnessConfig {
            product: "wp-cli".to_string(),
            tool: "wp".to_string(),
            interpreter: "php".to_string(),
            ..HarnessConfig::default()
        };
        assert_eq!(config.env_prefix(), "WP_CLI_TEST");
        assert_eq!(config.db_var("NAME"), "WP_CLI_TEST_DBNAME");
        assert_eq!(config.cache_dir_var(), "WP_CACHE_DIR");
        assert_eq!(config.interpreter_args_var(), "WP_PHP_ARGS");
        assert_eq!(config.interpreter_bin_var(), "WP_PHP");

        config.product = "fixtest".to_string();
        assert_eq!(config.bin_dir_var(), "FIXTEST_TEST_BIN_DIR");
    }

    #[test]
    fn cache_dirs_live_under_temp_root() {
        let config = HarnessConfig {
            temp_root: PathBuf::from("/scratch"),
            ..HarnessConfig::default()
        };
        assert_eq!(
            config.download_cache_dir(),
            PathBuf::from("/scratch/fixtest-test-core-download-cache")
        );
        assert_eq!(
            config.install_cache_dir(),
            PathBuf::from("/scratch/fixtest-test-core-install-cache")
        );
        assert_eq!(
            config.general_cache_dir(),
            PathBuf::from("/scratch/fixtest-test-cache")
        );
        assert_eq!(
            config.home_dir(),
            PathBuf::from("/scratch/fixtest-test-home")
        );
    }

    #[test]
    fn explicit_bin_dir_wins_over_discovery() {
        let config = HarnessConfig {
            bin_dir: Some(PathBuf::from("/opt/tool/bin")),
            ..HarnessConfig::default()
        };
        assert_eq!(config.resolve_bin_dir(), Some(PathBuf::from("/opt/tool/bin")));
    }

    #[test]
    fn default_round_trips_through_yaml() {
        let config = HarnessConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let back: HarnessConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.product, config.product);
        assert_eq!(back.db.name, config.db.name);
    }
}

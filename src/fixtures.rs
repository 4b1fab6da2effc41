//! Fixture provisioning flows.
//!
//! The expensive scenario preconditions: downloading the app's pristine tree,
//! creating its config file and installing it. Each flow pays its cost once
//! per distinct parameter set and serves every later scenario from cache.
//! Install-cache entries are an overlay of the post-install tree over the
//! pristine download plus a database dump stored next to the entry.

use crate::cache::{CacheError, FixtureCache};
use crate::config::DbDriver;
use crate::database::{Database, DbError};
use crate::fsx;
use crate::http::HttpError;
use crate::process::ProcessError;
use crate::scenario::ScenarioContext;
use crate::suite::EnvError;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

/// Error type for provisioning flows.
#[derive(Debug)]
pub enum FixtureError {
    Env(EnvError),
    Cache(CacheError),
    Command(ProcessError),
    Db(DbError),
    Http(HttpError),
    Io { context: String, source: io::Error },
    /// `download_bundle` was called without a `bundle_url_template`.
    NoBundleUrl,
}

impl std::fmt::Display for FixtureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FixtureError::Env(e) => write!(f, "{e}"),
            FixtureError::Cache(e) => write!(f, "{e}"),
            FixtureError::Command(e) => write!(f, "{e}"),
            FixtureError::Db(e) => write!(f, "{e}"),
            FixtureError::Http(e) => write!(f, "{e}"),
            FixtureError::Io { context, source } => write!(f, "{context}: {source}"),
            FixtureError::NoBundleUrl => {
                write!(f, "no bundle_url_template configured; cannot download a bundle")
            }
        }
    }
}

impl std::error::Error for FixtureError {}

impl From<EnvError> for FixtureError {
    fn from(e: EnvError) -> Self {
        FixtureError::Env(e)
    }
}

impl From<CacheError> for FixtureError {
    fn from(e: CacheError) -> Self {
        FixtureError::Cache(e)
    }
}

impl From<ProcessError> for FixtureError {
    fn from(e: ProcessError) -> Self {
        FixtureError::Command(e)
    }
}

impl From<DbError> for FixtureError {
    fn from(e: DbError) -> Self {
        FixtureError::Db(e)
    }
}

impl FixtureError {
    fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> FixtureError {
        let context = context.into();
        move |source| FixtureError::Io { context, source }
    }
}

impl ScenarioContext {
    /// The app root for `subdir`, under the run dir.
    pub fn app_dir(&mut self, subdir: &str) -> Result<PathBuf, FixtureError> {
        let run_dir = self.run_dir()?;
        if subdir.is_empty() {
            return Ok(run_dir);
        }
        let dir = run_dir.join(subdir);
        std::fs::create_dir_all(&dir)
            .map_err(FixtureError::io(format!("creating {}", dir.display())))?;
        Ok(dir)
    }

    /// Database handle bound to this scenario's app root.
    pub fn database(&mut self, subdir: &str) -> Result<Database, FixtureError> {
        let app_dir = self.app_dir(subdir)?;
        let config = self.suite().config();
        Ok(Database::new(config.db.clone())
            .with_sqlite_file(app_dir.join(&config.sqlite_db_file)))
    }

    /// Make sure the pristine download cache exists, populating it with one
    /// `<tool> core download` on first use. Never invalidated automatically;
    /// delete the directory to force a refresh.
    pub fn ensure_download_cache(&mut self) -> Result<PathBuf, FixtureError> {
        let config = self.suite().config().clone();
        let cache_dir = config.download_cache_dir();
        if dir_is_populated(&cache_dir) {
            tracing::debug!(dir = %cache_dir.display(), "download cache hit");
            return Ok(cache_dir);
        }

        let staging = tempfile::Builder::new()
            .prefix(&format!("{}-test-download-staging-", config.product))
            .tempdir_in(&config.temp_root)
            .map_err(FixtureError::io("creating download staging dir"))?;

        let mut command = format!(
            "{} core download --force --path='{}'",
            config.tool,
            staging.path().display()
        );
        if let Some(version) = config.pinned_version() {
            command.push_str(&format!(" --version={version}"));
        }
        tracing::debug!(%command, "populating download cache");
        self.proc(&command, "")?.run_check()?;

        let staged = staging.keep();
        if cache_dir.exists() {
            // Another suite run got there first.
            let _ = fsx::remove_dir(&staged);
            return Ok(cache_dir);
        }
        std::fs::rename(&staged, &cache_dir).map_err(FixtureError::io(format!(
            "publishing download cache {}",
            cache_dir.display()
        )))?;
        Ok(cache_dir)
    }

    /// Copy the pristine app tree into the run dir.
    pub fn download_app(&mut self, subdir: &str) -> Result<PathBuf, FixtureError> {
        let subdir = self.expand(subdir);
        let cache = self.ensure_download_cache()?;
        let dest = self.app_dir(&subdir)?;
        fsx::copy_dir(&cache, &dest)
            .map_err(FixtureError::io(format!("copying app tree into {}", dest.display())))?;
        Ok(dest)
    }

    /// Create the app's config file, from cache when the exact parameter set
    /// has been seen before.
    pub fn create_config(&mut self, subdir: &str, extra: Option<&str>) -> Result<(), FixtureError> {
        let subdir = self.expand(subdir);
        let config = self.suite().config().clone();

        let mut params = BTreeMap::new();
        params.insert("dbname", config.db.name.clone());
        params.insert("dbuser", config.db.user.clone());
        params.insert("dbpass", config.db.pass.clone());
        params.insert("dbhost", config.db.host.clone());
        if let Some(extra) = extra {
            params.insert("extra", extra.to_string());
        }

        let mut key_inputs: Vec<String> =
            params.iter().map(|(k, v)| format!("{k}={v}")).collect();
        key_inputs.push(format!("subdir={subdir}"));
        let key_refs: Vec<&str> = key_inputs.iter().map(String::as_str).collect();

        let install_cache = FixtureCache::new(config.install_cache_dir());
        let cached_file = install_cache.entry_path("config", &key_refs);

        let app_dir = self.app_dir(&subdir)?;
        let config_path = app_dir.join(&config.config_file);

        if cached_file.exists() {
            tracing::debug!(file = %cached_file.display(), "config cache hit");
            std::fs::copy(&cached_file, &config_path)
                .map_err(FixtureError::io("copying cached config"))?;
            return Ok(());
        }

        let mut command = format!(
            "{} config create --dbname='{}' --dbuser='{}' --dbpass='{}' --dbhost='{}' --skip-salts",
            config.tool, config.db.name, config.db.user, config.db.pass, config.db.host
        );
        if config.db.driver == DbDriver::Sqlite {
            command.push_str(" --skip-check");
        }
        if let Some(extra) = extra {
            command.push(' ');
            command.push_str(extra);
        }
        self.proc(&command, &subdir)?.run_check()?;

        std::fs::create_dir_all(install_cache.base())
            .map_err(FixtureError::io("creating install cache dir"))?;
        std::fs::copy(&config_path, &cached_file)
            .map_err(FixtureError::io("storing config in cache"))?;
        Ok(())
    }

    /// Fetch and extract a zip-packaged plugin bundle once, serving later
    /// installs from the cache. Entries live under the general cache and
    /// survive suite runs.
    pub fn ensure_plugin_bundle(&mut self, url: &str) -> Result<PathBuf, FixtureError> {
        let url = self.expand(url);
        let config = self.suite().config().clone();
        let cache = FixtureCache::new(config.general_cache_dir());
        let entry = cache.get_or_create("plugin", &[&url], |staging| {
            let archive = staging.join("bundle.zip");
            crate::http::save_to_file(&url, &archive)?;
            fsx::extract_zip(&archive, staging)?;
            fsx::remove_file(&archive)?;
            Ok(())
        })?;
        Ok(entry)
    }

    /// Copy a plugin bundle into the app's drop-in directory.
    pub fn install_plugin_bundle(
        &mut self,
        subdir: &str,
        url: &str,
    ) -> Result<PathBuf, FixtureError> {
        let subdir = self.expand(subdir);
        let config = self.suite().config().clone();
        let bundle = self.ensure_plugin_bundle(url)?;
        let dest = self.app_dir(&subdir)?.join(&config.db_plugin_dir);
        fsx::copy_dir(&bundle, &dest).map_err(FixtureError::io(format!(
            "installing plugin bundle into {}",
            dest.display()
        )))?;
        Ok(dest)
    }

    /// Provision a fully installed app in the run dir.
    ///
    /// First install per parameter set runs `<tool> core install` for real and
    /// records an overlay + database dump; later installs replay the recording
    /// onto a fresh pristine copy.
    pub fn install_app(&mut self, subdir: &str, extra_config: Option<&str>) -> Result<(), FixtureError> {
        let subdir = self.expand(subdir);
        let config = self.suite().config().clone();

        let db = self.database(&subdir)?;
        db.create_database()?;

        self.download_app(&subdir)?;
        self.create_config(&subdir, extra_config)?;

        // The embedded driver needs its drop-in plugin in place before the
        // install runs; the overlay then records it for cache-hit replays.
        if config.db.driver == DbDriver::Sqlite
            && let Some(plugin_url) = config.db_plugin_url.clone()
        {
            self.install_plugin_bundle(&subdir, &plugin_url)?;
        }

        let url = "https://example.test".to_string();
        let install_args: Vec<(&str, &str)> = vec![
            ("url", url.as_str()),
            ("title", "Test"),
            ("admin_user", "admin"),
            ("admin_password", "password1"),
            ("admin_email", "admin@example.test"),
        ];

        let mut key_inputs: Vec<String> = install_args
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        key_inputs.push(format!("subdir={subdir}"));
        key_inputs.push(format!(
            "plugin={}",
            config.db_plugin_url.as_deref().unwrap_or_default()
        ));
        let key_refs: Vec<&str> = key_inputs.iter().map(String::as_str).collect();

        let install_cache = FixtureCache::new(config.install_cache_dir());
        let entry = install_cache.entry_path("install", &key_refs);
        let dump = entry.with_extension(db.dump_extension());

        let app_dir = self.app_dir(&subdir)?;

        if entry.exists() {
            tracing::debug!(entry = %entry.display(), "install cache hit");
            install_cache
                .materialize(&entry, &app_dir)
                .map_err(FixtureError::Cache)?;
            db.restore(&dump)?;
            return Ok(());
        }

        let flags: String = install_args
            .iter()
            .map(|(k, v)| format!(" --{k}='{v}'"))
            .collect();
        let command = format!("{} core install{flags} --skip-email", config.tool);
        tracing::debug!(%command, "installing app");
        self.proc(&command, &subdir)?.run_check()?;

        // Record the install: overlay over the pristine tree, then the dump,
        // then the entry rename that publishes both.
        let pristine = config.download_cache_dir();
        install_cache.get_or_create("install", &key_refs, |staging| {
            let overlay = fsx::collect_overlay(&app_dir, &pristine)?;
            fsx::apply_overlay(&overlay, &app_dir, staging)?;
            db.dump(&dump)?;
            Ok(())
        })?;
        Ok(())
    }

    /// Download the packaged self-contained executable for a released version
    /// into the run dir, exposing its path as `{BUNDLE_PATH}`.
    pub fn download_bundle(&mut self, version: &str) -> Result<PathBuf, FixtureError> {
        let version = self.expand(version);
        let config = self.suite().config().clone();
        let template = config
            .bundle_url_template
            .as_ref()
            .ok_or(FixtureError::NoBundleUrl)?;
        let url = template.replace("{version}", &version);

        let run_dir = self.run_dir()?;
        let dest = run_dir.join(format!("{}-{version}.bundle", config.tool));
        tracing::debug!(%url, dest = %dest.display(), "downloading bundle");
        crate::http::save_to_file(&url, &dest).map_err(FixtureError::Http)?;

        self.variables
            .insert("BUNDLE_PATH".to_string(), dest.display().to_string());
        Ok(dest)
    }
}

fn dir_is_populated(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

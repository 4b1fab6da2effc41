//! Integration tests for the full provisioning and scenario lifecycle.

use fixtest::config::HarnessConfig;
use fixtest::scenario::{OutputStream, ScenarioContext, ScenarioOutcome};
use fixtest::suite::SuiteState;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn fixtest_cmd() -> Command {
    Command::new(env!("CARGO_BIN_EXE_fixtest"))
}

/// A stand-in tool under test: answers the provisioning subcommands and logs
/// every call under the isolated HOME the harness hands it.
#[cfg(unix)]
fn install_fake_tool(bin_dir: &Path) {
    let tool = bin_dir.join("faketool");
    fs::write(
        &tool,
        r#"#!/bin/sh
echo "$1 $2" >> "$HOME/calls.log"
case "$1 $2" in
  "core download")
    for arg; do
      case "$arg" in
        --path=*) path=${arg#--path=} ;;
      esac
    done
    mkdir -p "$path/admin"
    echo "<?php sample" > "$path/config-sample.php"
    ;;
  "config create")
    echo "<?php config" > config.php
    ;;
  "core install")
    mkdir -p content/uploads
    echo "generated" > content/uploads/installed.txt
    ;;
  "post list")
    echo "4.2.1"
    ;;
  *)
    echo "unknown: $*" >&2
    exit 1
    ;;
esac
"#,
    )
    .unwrap();
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
}

fn harness_config(temp_root: &Path, bin_dir: &Path) -> HarnessConfig {
    HarnessConfig {
        temp_root: temp_root.to_path_buf(),
        tool: "faketool".to_string(),
        bin_dir: Some(bin_dir.to_path_buf()),
        ..HarnessConfig::default()
    }
}

#[test]
#[cfg(unix)]
fn two_scenarios_share_one_provisioning_run() {
    let root = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    install_fake_tool(bin.path());

    let config = harness_config(root.path(), bin.path());
    let suite = SuiteState::new(config);
    suite.prepare().unwrap();

    let mut first = ScenarioContext::new(suite.clone(), "features/site.feature", 5);
    first.install_app("site", None).unwrap();
    let app = first.app_dir("site").unwrap();
    assert!(app.join("config-sample.php").exists());
    assert!(app.join("config.php").exists());
    assert!(app.join("content/uploads/installed.txt").exists());
    first.teardown(ScenarioOutcome::Passed).unwrap();

    let mut second = ScenarioContext::new(suite.clone(), "features/site.feature", 20);
    second.install_app("site", None).unwrap();
    let app = second.app_dir("site").unwrap();
    assert!(app.join("content/uploads/installed.txt").exists());
    second.teardown(ScenarioOutcome::Passed).unwrap();

    // The expensive subcommands ran exactly once; the second scenario was
    // served from cache.
    let calls = fs::read_to_string(suite.config().home_dir().join("calls.log")).unwrap();
    assert_eq!(calls.matches("core download").count(), 1, "{calls}");
    assert_eq!(calls.matches("config create").count(), 1, "{calls}");
    assert_eq!(calls.matches("core install").count(), 1, "{calls}");

    suite.teardown().unwrap();
}

#[test]
#[cfg(unix)]
fn saved_output_feeds_later_commands() {
    let root = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    install_fake_tool(bin.path());

    let suite = SuiteState::new(harness_config(root.path(), bin.path()));
    let mut ctx = ScenarioContext::new(suite, "features/vars.feature", 2);

    ctx.run_cmd("faketool post list", "").unwrap();
    ctx.save_output_as(OutputStream::Stdout, "PLUGIN_VERSION");
    assert_eq!(ctx.variables["PLUGIN_VERSION"], "4.2.1");

    let result = ctx.run_cmd("echo installed {PLUGIN_VERSION}", "").unwrap();
    assert_eq!(result.stdout, "installed 4.2.1\n");

    ctx.teardown(ScenarioOutcome::Passed).unwrap();
}

#[test]
#[cfg(unix)]
fn run_dirs_survive_failure_and_vanish_on_success() {
    let root = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    install_fake_tool(bin.path());
    let config = harness_config(root.path(), bin.path());

    let suite = SuiteState::new(config.clone());
    let mut passed = ScenarioContext::new(suite.clone(), "features/keep.feature", 1);
    let passed_dir = passed.run_dir().unwrap();
    passed.teardown(ScenarioOutcome::Passed).unwrap();
    assert!(!passed_dir.exists());

    let mut failed = ScenarioContext::new(suite, "features/keep.feature", 2);
    let failed_dir = failed.run_dir().unwrap();
    failed.teardown(ScenarioOutcome::Failed).unwrap();
    assert!(failed_dir.exists());
}

#[test]
fn schema_command_describes_the_config_file() {
    let output = fixtest_cmd().arg("schema").output().unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let schema: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let properties = schema
        .get("properties")
        .and_then(|p| p.as_object())
        .expect("schema has properties");
    assert!(properties.contains_key("product"));
    assert!(properties.contains_key("db"));
    assert!(properties.contains_key("temp_root"));
}

#[test]
fn prune_removes_cache_directories() {
    let root = TempDir::new().unwrap();
    let config_path = root.path().join("fixtest.yaml");
    fs::write(
        &config_path,
        format!("product: pruned\ntemp_root: {}\n", root.path().display()),
    )
    .unwrap();

    let download = root.path().join("pruned-test-core-download-cache");
    let install = root.path().join("pruned-test-core-install-cache");
    let general = root.path().join("pruned-test-cache");
    for dir in [&download, &install, &general] {
        fs::create_dir_all(dir.join("entry")).unwrap();
    }

    let output = fixtest_cmd()
        .arg("--config")
        .arg(&config_path)
        .arg("prune")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );

    assert!(!download.exists());
    assert!(!install.exists());
    assert!(!general.exists());
}

#[test]
#[cfg(unix)]
fn info_command_reports_resolved_paths() {
    let root = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    install_fake_tool(bin.path());

    let config_path = root.path().join("fixtest.yaml");
    fs::write(
        &config_path,
        format!(
            "product: demo\ntool: faketool\nbin_dir: {}\ntemp_root: {}\n",
            bin.path().display(),
            root.path().display()
        ),
    )
    .unwrap();

    let output = fixtest_cmd()
        .arg("--config")
        .arg(&config_path)
        .arg("info")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("demo-test-core-download-cache"), "{stdout}");
    assert!(stdout.contains("DEMO_TEST_RUN=1"), "{stdout}");
    assert!(stdout.contains(&bin.path().display().to_string()), "{stdout}");
}

#[test]
#[cfg(unix)]
fn check_db_succeeds_for_the_embedded_driver() {
    let root = TempDir::new().unwrap();
    let config_path = root.path().join("fixtest.yaml");
    fs::write(
        &config_path,
        format!(
            "temp_root: {}\ndb:\n  driver: sqlite\n",
            root.path().display()
        ),
    )
    .unwrap();

    let output = fixtest_cmd()
        .arg("--config")
        .arg(&config_path)
        .arg("check-db")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
#[cfg(unix)]
fn background_processes_die_with_the_scenario() {
    let root = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    install_fake_tool(bin.path());

    let suite = SuiteState::new(harness_config(root.path(), bin.path()));
    let mut ctx = ScenarioContext::new(suite, "features/server.feature", 7);
    let run_dir = ctx.run_dir().unwrap();

    let marker: PathBuf = run_dir.join("still-running");
    ctx.background(&format!(
        "touch '{}'; sleep 300",
        marker.display()
    ))
    .unwrap();
    assert!(marker.exists());

    ctx.teardown(ScenarioOutcome::Passed).unwrap();
    // Run dir (and marker) removed, process tree gone; nothing recreates it.
    std::thread::sleep(std::time::Duration::from_millis(300));
    assert!(!run_dir.exists());
}

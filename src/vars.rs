//! Scenario variable interpolation.
//!
//! Placeholders are `{UPPER_SNAKE}` tokens. Plain placeholders resolve against
//! the scenario variable table; two special forms resolve against suite state:
//! `{INVOKE_TOOL_WITH_ARGS-<flags>}` (how to invoke the tool under test) and
//! `{VERSION-<alias>}` (upstream version aliases).

use crate::config::HarnessConfig;
use crate::versions::VersionIndex;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::OnceLock;

fn var_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Z_][A-Z_0-9]*)\}").unwrap())
}

fn invoke_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{INVOKE_TOOL_WITH_ARGS-([^\}]*)\}").unwrap())
}

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{VERSION-([^\}]*)\}").unwrap())
}

/// Expand `{UPPER_SNAKE}` placeholders from the variable table.
///
/// An unknown placeholder expands to the empty string. That silence is
/// deliberate and long-standing: steps rely on it to blank out optional
/// fragments, but it also hides typos, so name variables carefully.
pub fn expand(text: &str, vars: &HashMap<String, String>) -> String {
    var_re()
        .replace_all(text, |caps: &Captures| {
            vars.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// How `{INVOKE_TOOL_WITH_ARGS-<flags>}` renders. Detected once per suite.
#[derive(Debug, Clone)]
pub enum InvokeStrategy {
    /// A self-contained bundle that must be handed to the interpreter so the
    /// flags reach the interpreter itself.
    Bundle {
        interpreter: String,
        bundle_path: PathBuf,
    },
    /// An entry script that launches its own interpreter; flags travel
    /// through an environment variable on the command line.
    EntryScript {
        args_var: String,
        command: String,
    },
}

impl InvokeStrategy {
    /// Inspect the resolved bin path: an interpreter shebang on the tool's
    /// file means we are looking at a bundle.
    pub fn detect(config: &HarnessConfig) -> Self {
        if let Some(bin_dir) = config.resolve_bin_dir() {
            let tool_path = bin_dir.join(&config.tool);
            if has_interpreter_shebang(&tool_path, &config.interpreter) {
                tracing::debug!(path = %tool_path.display(), "tool resolved as interpreter bundle");
                return InvokeStrategy::Bundle {
                    interpreter: config.interpreter.clone(),
                    bundle_path: tool_path,
                };
            }
        }
        tracing::debug!(tool = %config.tool, "tool resolved as entry script");
        InvokeStrategy::EntryScript {
            args_var: config.interpreter_args_var(),
            command: config.tool.clone(),
        }
    }

    /// Render the placeholder body for one set of flags.
    pub fn render(&self, flags: &str) -> String {
        match self {
            InvokeStrategy::Bundle {
                interpreter,
                bundle_path,
            } => format!("{interpreter} {flags} {}", bundle_path.display()),
            InvokeStrategy::EntryScript { args_var, command } => {
                format!("{args_var}='{flags}' {command}")
            }
        }
    }
}

fn has_interpreter_shebang(path: &std::path::Path, interpreter: &str) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    let mut first_line = String::new();
    if BufReader::new(file).read_line(&mut first_line).is_err() {
        return false;
    }
    let first_line = first_line.trim_end();
    first_line == format!("#!/usr/bin/env {interpreter}")
        || (first_line.starts_with("#!") && first_line.ends_with(&format!("/{interpreter}")))
}

/// Expand `{INVOKE_TOOL_WITH_ARGS-<flags>}` occurrences.
pub fn expand_invocations(text: &str, strategy: &InvokeStrategy) -> String {
    invoke_re()
        .replace_all(text, |caps: &Captures| strategy.render(&caps[1]))
        .into_owned()
}

/// Expand `{VERSION-<alias>}` occurrences against a version index.
///
/// With no index available (fetch failed or no URL configured) placeholders
/// pass through unchanged so the eventual failure names the real problem.
pub fn expand_versions(text: &str, index: Option<&VersionIndex>) -> String {
    let Some(index) = index else {
        return text.to_string();
    };
    version_re()
        .replace_all(text, |caps: &Captures| match index.resolve(&caps[1]) {
            Some(version) => version.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn known_placeholders_expand() {
        let vars = vars(&[("RUN_DIR", "/tmp/run"), ("DB_NAME", "app_test")]);
        assert_eq!(
            expand("cd {RUN_DIR} && use {DB_NAME}", &vars),
            "cd /tmp/run && use app_test"
        );
    }

    #[test]
    fn unknown_placeholders_expand_to_empty() {
        assert_eq!(expand("a{NOPE}b", &HashMap::new()), "ab");
    }

    #[test]
    fn lowercase_and_malformed_tokens_pass_through() {
        let vars = vars(&[("X", "v")]);
        assert_eq!(expand("{lower} {1BAD} {X", &vars), "{lower} {1BAD} {X");
    }

    #[test]
    fn bundle_strategy_renders_interpreter_call() {
        let strategy = InvokeStrategy::Bundle {
            interpreter: "php".to_string(),
            bundle_path: PathBuf::from("/opt/bin/tool"),
        };
        assert_eq!(
            expand_invocations("run: {INVOKE_TOOL_WITH_ARGS--ddisplay_errors=1}", &strategy),
            "run: php -ddisplay_errors=1 /opt/bin/tool"
        );
    }

    #[test]
    fn entry_script_strategy_renders_env_prefix() {
        let strategy = InvokeStrategy::EntryScript {
            args_var: "TOOL_PHP_ARGS".to_string(),
            command: "tool".to_string(),
        };
        assert_eq!(
            expand_invocations("{INVOKE_TOOL_WITH_ARGS--dmemory_limit=256M} --version", &strategy),
            "TOOL_PHP_ARGS='-dmemory_limit=256M' tool --version"
        );
    }

    #[test]
    fn shebang_detection() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("bundled");
        std::fs::write(&bundle, "#!/usr/bin/env php\n<?php ...").unwrap();
        assert!(has_interpreter_shebang(&bundle, "php"));
        assert!(!has_interpreter_shebang(&bundle, "python"));

        let script = dir.path().join("plain");
        std::fs::write(&script, "#!/bin/sh\nexec tool \"$@\"").unwrap();
        assert!(!has_interpreter_shebang(&script, "php"));
    }

    #[test]
    fn version_aliases_resolve_or_pass_through() {
        let index = VersionIndex::from_offers(vec!["6.5.2".to_string(), "6.4.3".to_string()]);
        assert_eq!(
            expand_versions("get {VERSION-latest} and {VERSION-6.4-latest}", Some(&index)),
            "get 6.5.2 and 6.4.3"
        );
        assert_eq!(
            expand_versions("get {VERSION-9-latest}", Some(&index)),
            "get {VERSION-9-latest}"
        );
        assert_eq!(
            expand_versions("get {VERSION-latest}", None),
            "get {VERSION-latest}"
        );
    }
}

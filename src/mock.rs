//! HTTP mock rules.
//!
//! Scenarios register `(pattern, body)` pairs; the rules are serialized to a
//! JSON shim file inside the run dir and the file's path is exported to
//! subprocesses through an env var. The tool's test shim consults the file and
//! short-circuits matching outbound requests. Rules live and die with the
//! scenario.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

/// Shim file name inside the run dir.
pub const MOCK_FILE_NAME: &str = ".mock-requests.json";

/// One outbound-request substitution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MockRule {
    /// Substring (or tool-defined pattern) matched against the request URL.
    pub pattern: String,
    /// Response body returned instead of performing the request.
    pub body: String,
}

/// Write the full rule set to the shim file, replacing any previous version.
pub fn write_mock_file(rules: &[MockRule], run_dir: &Path) -> io::Result<PathBuf> {
    let path = run_dir.join(MOCK_FILE_NAME);
    let json = serde_json::to_string_pretty(rules).map_err(io::Error::other)?;
    std::fs::write(&path, json)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_round_trip_through_shim_file() {
        let dir = tempfile::tempdir().unwrap();
        let rules = vec![
            MockRule {
                pattern: "api.example.test/v1".to_string(),
                body: r#"{"ok":true}"#.to_string(),
            },
            MockRule {
                pattern: "downloads.example.test".to_string(),
                body: String::new(),
            },
        ];

        let path = write_mock_file(&rules, dir.path()).unwrap();
        assert_eq!(path.file_name().unwrap(), MOCK_FILE_NAME);

        let back: Vec<MockRule> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, rules);
    }

    #[test]
    fn rewriting_replaces_previous_rules() {
        let dir = tempfile::tempdir().unwrap();
        let first = vec![MockRule {
            pattern: "a".to_string(),
            body: "1".to_string(),
        }];
        let second = vec![MockRule {
            pattern: "b".to_string(),
            body: "2".to_string(),
        }];

        write_mock_file(&first, dir.path()).unwrap();
        let path = write_mock_file(&second, dir.path()).unwrap();

        let back: Vec<MockRule> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, second);
    }
}

//! Run-time telemetry.
//!
//! Accumulates per-command durations and per-scenario wall times, then renders
//! a top-N report at suite end. Purely diagnostic; nothing reads it back.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_TOP_COMMANDS: usize = 40;
const DEFAULT_TOP_SCENARIOS: usize = 20;

/// Shared accumulator for command and scenario run times.
#[derive(Debug)]
pub struct TimingLog {
    commands: Mutex<HashMap<String, (Duration, u64)>>,
    scenarios: Mutex<Vec<(String, Duration)>>,
    started: Instant,
    started_at: chrono::DateTime<chrono::Local>,
    top_commands: usize,
    top_scenarios: usize,
}

impl TimingLog {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_TOP_COMMANDS, DEFAULT_TOP_SCENARIOS)
    }

    pub fn with_limits(top_commands: usize, top_scenarios: usize) -> Self {
        TimingLog {
            commands: Mutex::new(HashMap::new()),
            scenarios: Mutex::new(Vec::new()),
            started: Instant::now(),
            started_at: chrono::Local::now(),
            top_commands,
            top_scenarios,
        }
    }

    /// Parse a `{PREFIX}_LOG_RUN_TIMES` value of the form `[<top_commands>[,<top_scenarios>]]`.
    pub fn from_env_value(value: &str) -> Self {
        let mut parts = value.split(',').map(str::trim);
        let top_commands = parts
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_TOP_COMMANDS);
        let top_scenarios = parts
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_TOP_SCENARIOS);
        Self::with_limits(top_commands, top_scenarios)
    }

    /// Add one command invocation. Durations for identical command lines
    /// accumulate.
    pub fn record_command(&self, command: &str, duration: Duration) {
        if let Ok(mut commands) = self.commands.lock() {
            let entry = commands
                .entry(command.to_string())
                .or_insert((Duration::ZERO, 0));
            entry.0 += duration;
            entry.1 += 1;
        }
    }

    /// Add one finished scenario's wall time.
    pub fn record_scenario(&self, key: &str, duration: Duration) {
        if let Ok(mut scenarios) = self.scenarios.lock() {
            scenarios.push((key.to_string(), duration));
        }
    }

    /// Render the end-of-suite report.
    pub fn report(&self) -> String {
        let elapsed = self.started.elapsed();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "run times (suite started {}, total {:.2}s)",
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
            elapsed.as_secs_f64()
        );

        if let Ok(commands) = self.commands.lock() {
            let mut rows: Vec<_> = commands
                .iter()
                .map(|(cmd, (total, count))| (cmd.clone(), *total, *count))
                .collect();
            rows.sort_by(|a, b| b.1.cmp(&a.1));
            rows.truncate(self.top_commands);

            let _ = writeln!(out, "\nslowest commands (cumulative):");
            for (cmd, total, count) in rows {
                let _ = writeln!(out, "  {:>8.2}s  {count:>4}x  {cmd}", total.as_secs_f64());
            }
        }

        if let Ok(scenarios) = self.scenarios.lock() {
            let mut rows = scenarios.clone();
            rows.sort_by(|a, b| b.1.cmp(&a.1));
            rows.truncate(self.top_scenarios);

            let _ = writeln!(out, "\nslowest scenarios:");
            for (key, duration) in rows {
                let _ = writeln!(out, "  {:>8.2}s  {key}", duration.as_secs_f64());
            }
        }

        out
    }
}

impl Default for TimingLog {
    fn default() -> Self {
        Self::new()
    }
}

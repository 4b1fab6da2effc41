//! Fixture cache, ephemeral environments and structural output assertions for
//! end-to-end testing of command-line tools.
//!
//! A test suite drives this crate from its step-definition layer: a
//! [`suite::SuiteState`] is created once per run, each scenario gets its own
//! [`scenario::ScenarioContext`], fixture steps provision cached artifacts
//! through [`cache::FixtureCache`] and the flows in [`fixtures`], commands run
//! through [`process::Process`], and assertion steps verify captured output
//! with the comparators in [`compare`].

pub mod cache;
pub mod compare;
pub mod config;
pub mod database;
pub mod fixtures;
pub mod fsx;
pub mod http;
pub mod loader;
pub mod mock;
pub mod process;
pub mod scenario;
pub mod suite;
pub mod timing;
pub mod vars;
pub mod versions;

pub use config::HarnessConfig;
pub use process::{Process, ProcessResult};
pub use scenario::{ScenarioContext, ScenarioOutcome};
pub use suite::SuiteState;

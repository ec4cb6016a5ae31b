//! Benchmark harness: scripted tasks replayed over the agent core.
//!
//! A suite is a YAML file of [`BenchmarkDefinition`]s. For each run the
//! harness rebuilds an isolated workspace, drives the agent (or an
//! external command), validates the outcome with the declarative check
//! DSL, appends the result to a resume-friendly CSV log, and finally
//! renders a Markdown report.

mod csvlog;
mod definition;
mod environment;
mod executor;
mod report;
mod result;
mod runner;
mod validator;

pub use csvlog::{CSV_HEADER, ResultLog};
pub use definition::{
    BenchmarkDefinition, CheckType, SetupFile, ValidationCheck, filter_suite, load_suite,
    parse_suite,
};
pub use environment::Environment;
pub use executor::{Executor, ExecutorConfig, extract_tool_calls};
pub use report::{ReportGenerator, mean_stddev, natural_cmp};
pub use result::{RunResult, ToolInvocation};
pub use runner::{Harness, HarnessConfig};
pub use validator::{validate, validate_all};

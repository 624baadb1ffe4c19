//! Command-line interface layer.
//!
//! A thin shell over [`crate::orchestrator::Orchestrator`]: argument
//! parsing, config overrides, result rendering. Everything substantive
//! lives in the library so the pipeline stays embeddable.

mod args;
mod gate;
mod run;

pub use args::{Arguments, Command};
pub use gate::InteractiveGate;
pub use run::run_cli;

use std::process::ExitCode;

/// Process exit status for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// The operation completed fully.
    Success,
    /// The operation completed with failures (failed rounds, failed
    /// documents, or a phase that did not converge).
    Partial,
    /// The operation could not run at all.
    Error,
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        match status {
            ExitStatus::Success => ExitCode::from(0),
            ExitStatus::Partial => ExitCode::from(1),
            ExitStatus::Error => ExitCode::from(2),
        }
    }
}

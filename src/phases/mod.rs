//! The two learning phases.
//!
//! Both phases are state machines driven round-by-round: the schema phase
//! refines a field schema across exemplars, the code phase turns the final
//! schema into a verified extraction program. They run strictly in that
//! order; rounds produced by the schema phase feed the code phase its
//! exemplar documents and expected values.

pub mod code;
pub mod schema;

pub use code::{CodePhase, CodePhaseOutcome, IterationReport};
pub use schema::{RoundRecord, SchemaPhase, SchemaPhaseOutcome};

/// How a phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Succeeded,
    /// The phase ran out of budget; partial output is still attached.
    Failed,
    /// The cancellation flag fired; work up to the current atomic step is
    /// retained.
    Cancelled,
}

impl PhaseStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

//! Pagesift - learned HTML-to-record extraction
//!
//! Pagesift turns a directory of structurally similar HTML documents into
//! structured records. It learns a field schema from a few exemplars, asks a
//! language model to synthesize a deterministic extraction program, verifies
//! and repairs that program against the exemplars, and then applies it to the
//! whole corpus.
//!
//! ## Module Structure
//!
//! - `cli`: Command-line interface layer (user-facing commands)
//! - `config`: Configuration file loading and validation
//! - `corpus`: Document ingest from a file or directory of HTML pages
//! - `normalize`: Tolerant value normalization and matching
//! - `eval`: Precision/recall/F1 scoring of extracted records
//! - `cluster`: Layout clustering of mixed corpora
//! - `schema`: Field schema types, merging, persistence, and editing
//! - `prompt`: Versioned prompt template bundles
//! - `model`: Language-model client interface and HTTP implementation
//! - `fetch`: HTML fetching and simplification
//! - `artifact`: The declarative extraction program emitted by the model
//! - `executor`: Sandboxed interpreter for extraction programs
//! - `phases`: Schema refinement and code generation state machines
//! - `batch`: Parallel application of the final program to the corpus
//! - `orchestrator`: Composition of the phases into public operations

pub mod artifact;
pub mod batch;
pub mod cancel;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod corpus;
pub mod error;
pub mod eval;
pub mod executor;
pub mod fetch;
pub mod model;
pub mod normalize;
pub mod orchestrator;
pub mod phases;
pub mod prompt;
pub mod schema;

pub use error::{PipelineError, Result};

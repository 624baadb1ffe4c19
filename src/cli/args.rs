//! CLI argument definitions using clap.
//!
//! ## Commands
//!
//! - `extract`: full pipeline (schema, extractor, batch extraction)
//! - `schema`: schema learning only
//! - `code`: extractor synthesis (learning a schema first if none given)
//! - `run`: apply an existing extractor to a corpus
//! - `classify`: partition a corpus by page layout
//! - `init`: write a default configuration file

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Arguments {
    #[command(subcommand)]
    pub command: Command,
}

/// Arguments shared by every corpus-consuming command.
#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// HTML corpus: a directory of .html/.htm files, or a single file
    pub path: PathBuf,

    /// Run name; persisted outputs land under <output>/<name>/
    #[arg(long)]
    pub name: Option<String>,

    /// Output root directory (overrides config file)
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// What to persist (repeatable): schema, code, data, report, files
    #[arg(long = "save", value_name = "ITEM")]
    pub save: Vec<String>,

    /// Number of schema-learning rounds (overrides config file)
    #[arg(long)]
    pub rounds: Option<usize>,

    /// Model name (overrides config file)
    #[arg(long)]
    pub model: Option<String>,

    /// OpenAI-compatible endpoint base URL (overrides config file)
    #[arg(long)]
    pub base_url: Option<String>,

    /// Batch worker count (overrides config file)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Parser)]
pub struct ExtractArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Pause after schema learning to let you edit the schema file
    #[arg(long)]
    pub edit: bool,

    /// Predefined schema file (field name -> spec); fixes the field set
    #[arg(long)]
    pub schema: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub struct SchemaArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Pause after schema learning to let you edit the schema file
    #[arg(long)]
    pub edit: bool,
}

#[derive(Debug, Parser)]
pub struct CodeArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Existing schema file to generate code for (skips schema learning)
    #[arg(long)]
    pub schema: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub struct RunArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Extractor to apply: a parser file path or inline program source
    #[arg(long)]
    pub parser: String,
}

#[derive(Debug, Parser)]
pub struct ClassifyArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Learn a schema, synthesize an extractor, and extract every document
    Extract(ExtractArgs),
    /// Learn a field schema from corpus exemplars
    Schema(SchemaArgs),
    /// Synthesize an extractor for a schema
    Code(CodeArgs),
    /// Apply an existing extractor to a corpus
    Run(RunArgs),
    /// Group corpus documents by page layout
    Classify(ClassifyArgs),
    /// Write a default .pagesiftrc.json in the current directory
    Init,
}

impl Command {
    pub fn common(&self) -> Option<&CommonArgs> {
        match self {
            Command::Extract(args) => Some(&args.common),
            Command::Schema(args) => Some(&args.common),
            Command::Code(args) => Some(&args.common),
            Command::Run(args) => Some(&args.common),
            Command::Classify(args) => Some(&args.common),
            Command::Init => None,
        }
    }
}

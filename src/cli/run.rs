//! Command dispatch and result rendering.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;
use indexmap::IndexMap;

use super::args::{Arguments, Command, CommonArgs};
use super::{ExitStatus, InteractiveGate};
use crate::config::{CONFIG_FILE_NAME, Config, SchemaMode, default_config_json, load_config};
use crate::model::OpenAiClient;
use crate::orchestrator::Orchestrator;
use crate::phases::PhaseStatus;
use crate::schema::Schema;

/// Success mark for consistent output formatting.
const SUCCESS_MARK: &str = "\u{2713}"; // ✓

/// Failure mark for consistent output formatting.
const FAILURE_MARK: &str = "\u{2718}"; // ✘

pub async fn run_cli(args: Arguments) -> Result<ExitStatus> {
    match args.command {
        Command::Init => init(),
        Command::Extract(extract) => {
            let config = build_config(&extract.common, extract.edit, extract.schema.as_deref())?;
            let orchestrator = build_orchestrator(config, extract.edit)?;
            let result = orchestrator.extract_data(&extract.common.path).await?;

            print_status(result.status, &result.summary());
            if result.batch.is_some() && extract.common.save.is_empty() {
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            print_errors(&result.errors);
            Ok(exit_status(result.status, result.errors.is_empty()))
        }
        Command::Schema(schema) => {
            let config = build_config(&schema.common, schema.edit, None)?;
            let orchestrator = build_orchestrator(config, schema.edit)?;
            let result = orchestrator.extract_schema(&schema.common.path).await?;

            print_status(result.status, &result.summary());
            if let Some(final_schema) = &result.final_schema {
                if schema.common.save.is_empty() {
                    println!("{}", final_schema.to_pretty_json()?);
                }
            }
            print_errors(&result.errors);
            Ok(exit_status(result.status, result.errors.is_empty()))
        }
        Command::Code(code) => {
            let provided = code
                .schema
                .as_deref()
                .map(read_schema_file)
                .transpose()?;
            let config = build_config(&code.common, false, None)?;
            let orchestrator = build_orchestrator(config, false)?;
            let result = orchestrator.infer_code(&code.common.path, provided).await?;

            print_status(result.status, &result.summary());
            if let Some(source) = &result.artifact_source {
                if code.common.save.is_empty() {
                    println!("{source}");
                }
            }
            print_errors(&result.errors);
            Ok(exit_status(result.status, result.errors.is_empty()))
        }
        Command::Run(run) => {
            let config = build_config(&run.common, false, None)?;
            let orchestrator = build_orchestrator(config, false)?;
            let result = orchestrator
                .extract_with_code(&run.common.path, &run.parser)
                .await?;

            print_status(result.batch.status, &result.summary());
            if run.common.save.is_empty() {
                println!("{}", serde_json::to_string_pretty(&result.batch)?);
            }
            print_errors(&result.errors);
            Ok(exit_status(result.batch.status, result.errors.is_empty()))
        }
        Command::Classify(classify) => {
            let config = build_config(&classify.common, false, None)?;
            let orchestrator = build_orchestrator(config, false)?;
            let outcome = orchestrator.classify(&classify.common.path).await?;

            print_status(PhaseStatus::Succeeded, &outcome.summary());
            if classify.common.save.is_empty() {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            }
            Ok(ExitStatus::Success)
        }
    }
}

fn init() -> Result<ExitStatus> {
    let config_path = Path::new(CONFIG_FILE_NAME);
    if config_path.exists() {
        anyhow::bail!("{} already exists", CONFIG_FILE_NAME);
    }
    std::fs::write(config_path, default_config_json()?)
        .with_context(|| format!("failed to write {CONFIG_FILE_NAME}"))?;
    println!("{} wrote {}", SUCCESS_MARK.green(), CONFIG_FILE_NAME);
    Ok(ExitStatus::Success)
}

/// Load config from the working directory and apply CLI overrides.
fn build_config(
    common: &CommonArgs,
    edit: bool,
    predefined_schema_file: Option<&Path>,
) -> Result<Config> {
    let cwd = std::env::current_dir().context("cannot determine the working directory")?;
    let mut config = load_config(&cwd)?.config;

    if let Some(name) = &common.name {
        config.name = name.clone();
    }
    if let Some(output) = &common.output {
        config.output_path = output.to_string_lossy().into_owned();
    }
    if let Some(rounds) = common.rounds {
        config.iteration_rounds = rounds;
    }
    if let Some(model) = &common.model {
        config.model_name = model.clone();
    }
    if let Some(base_url) = &common.base_url {
        config.model_base_url = base_url.clone();
    }
    if let Some(workers) = common.workers {
        config.batch_workers = workers;
    }
    if !common.save.is_empty() {
        config.save = common.save.clone();
    }
    if edit {
        config.enable_schema_edit = true;
    }
    if let Some(path) = predefined_schema_file {
        let schema = read_schema_file(path)?;
        config.schema_mode = SchemaMode::Predefined;
        config.predefined_schema = schema
            .iter()
            .map(|(name, spec)| (name.clone(), spec.kind.as_str().to_string()))
            .collect::<IndexMap<_, _>>();
    }

    config.validate()?;
    Ok(config)
}

fn build_orchestrator(config: Config, interactive_edit: bool) -> Result<Orchestrator> {
    let model = OpenAiClient::from_env(&config.model_base_url, &config.model_name)?;
    let mut orchestrator = Orchestrator::new(config, Arc::new(model))?;
    if interactive_edit {
        orchestrator = orchestrator.with_edit_gate(Arc::new(InteractiveGate));
    }
    Ok(orchestrator)
}

fn read_schema_file(path: &Path) -> Result<Schema> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read schema file: {}", path.display()))?;
    Ok(Schema::from_json_str(&content)?)
}

fn print_status(status: PhaseStatus, summary: &str) {
    match status {
        PhaseStatus::Succeeded => eprintln!("{} {}", SUCCESS_MARK.green(), summary.green()),
        PhaseStatus::Failed => eprintln!("{} {}", FAILURE_MARK.red(), summary.red()),
        PhaseStatus::Cancelled => eprintln!("{} {}", FAILURE_MARK.yellow(), "cancelled".yellow()),
    }
}

fn print_errors(errors: &[crate::orchestrator::ErrorRecord]) {
    for error in errors {
        match &error.doc_id {
            Some(doc_id) => eprintln!(
                "{}: [{}] {}: {}",
                "warning".bold().yellow(),
                error.phase,
                doc_id,
                error.message
            ),
            None => eprintln!(
                "{}: [{}] {}",
                "warning".bold().yellow(),
                error.phase,
                error.message
            ),
        }
    }
}

fn exit_status(status: PhaseStatus, clean: bool) -> ExitStatus {
    match status {
        PhaseStatus::Succeeded if clean => ExitStatus::Success,
        PhaseStatus::Succeeded => ExitStatus::Partial,
        _ => ExitStatus::Partial,
    }
}

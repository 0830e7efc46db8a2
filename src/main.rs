mod cli;
mod config;
mod errors;
mod extractor;
mod loader;
mod model;
mod orchestrator;
mod source;
mod transformer;

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::fmt::format::FmtSpan;

use cli::{Cli, Commands};
use config::{CliOverrides, Config};
use errors::Error;
use model::LoadMode;

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_level(false)
        .init();

    loader::postgres::register();

    match dispatch(Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "run failed");
            ExitCode::FAILURE
        }
    }
}

fn dispatch(cli: Cli) -> Result<ExitCode, Error> {
    match cli.command {
        Commands::Run {
            source_uri,
            mode,
            workers,
            validate,
        } => run_command(cli.config, source_uri, mode, workers, validate),
        Commands::InitDb => init_db_command(cli.config),
        Commands::Validate { schema, source_uri } => validate_command(&source_uri, &schema),
        Commands::ValidateDbSchema => validate_db_schema_command(cli.config),
    }
}

fn run_command(
    config_path: Option<std::path::PathBuf>,
    source_uri: Option<String>,
    mode: Option<String>,
    workers: Option<usize>,
    validate: bool,
) -> Result<ExitCode, Error> {
    let overrides = CliOverrides {
        source_uri,
        mode: mode.as_deref().and_then(parse_mode),
        workers,
        schema_type: None,
    };
    let config = Config::load(config_path.as_deref(), overrides)?;
    let loader = loader::build_loader(&config.database_dialect, &config.database_dsn)?;

    if validate {
        if let Some(xsd_path) = &config.xsd_path {
            for file in source::list(&config.source_uri)? {
                let reader = source::open(&file.uri)?;
                let (ok, problems) = extractor::validate_against_xsd(reader, xsd_path)?;
                if !ok {
                    error!(file = %file.uri, problems = ?problems, "schema validation failed");
                }
            }
        }
    }

    let summary = orchestrator::run(&config, loader)?;
    info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        skipped = summary.skipped,
        total_rows = summary.total_rows,
        "run complete"
    );

    Ok(if summary.is_clean() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn init_db_command(config_path: Option<std::path::PathBuf>) -> Result<ExitCode, Error> {
    let config = Config::load(config_path.as_deref(), CliOverrides::default())?;
    let loader = loader::build_loader(&config.database_dialect, &config.database_dsn)?;
    loader.create_all_tables(config.schema_type)?;
    Ok(ExitCode::SUCCESS)
}

fn validate_command(source_uri: &str, schema: &std::path::Path) -> Result<ExitCode, Error> {
    let mut all_valid = true;
    for file in source::list(source_uri)? {
        let reader = source::open(&file.uri)?;
        let (ok, problems) = extractor::validate_against_xsd(reader, schema)?;
        if !ok {
            all_valid = false;
            error!(file = %file.uri, problems = ?problems, "schema validation failed");
        }
        else {
            info!(file = %file.uri, "schema valid");
        }
    }
    Ok(if all_valid { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn validate_db_schema_command(config_path: Option<std::path::PathBuf>) -> Result<ExitCode, Error> {
    let config = Config::load(config_path.as_deref(), CliOverrides::default())?;
    let loader = loader::build_loader(&config.database_dialect, &config.database_dsn)?;
    loader.validate_schema(config.schema_type)?;
    Ok(ExitCode::SUCCESS)
}

fn parse_mode(value: &str) -> Option<LoadMode> {
    match value {
        "full" => Some(LoadMode::Full),
        "delta" => Some(LoadMode::Delta),
        _ => None,
    }
}

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use validate_ns::batch::{BatchConfig, BatchValidator, ProgressCallback, ValidationPhase};
use validate_ns::cli::{Cli, VerbosityLevel};
use validate_ns::config::{Config, ConfigManager};
use validate_ns::engine::{EngineOptions, ValidationEngine};
use validate_ns::file_discovery::FileDiscovery;
use validate_ns::input::InputSource;
use validate_ns::output::Output;
use validate_ns::sink::TracingSink;
use validate_ns::xsd::XsdSchemaFactory;

const EXIT_INVALID: u8 = 1;
const EXIT_USAGE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();
    if let Err(message) = cli.validate() {
        eprintln!("Error: {}", message);
        return ExitCode::from(EXIT_USAGE);
    }

    let config = match ConfigManager::load_config(&cli).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(EXIT_USAGE);
        }
    };
    init_tracing(verbosity(&config));

    match run(&cli, &config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(EXIT_USAGE)
        }
    }
}

fn verbosity(config: &Config) -> VerbosityLevel {
    if config.output.quiet {
        VerbosityLevel::Quiet
    } else if config.output.verbose {
        VerbosityLevel::Verbose
    } else {
        VerbosityLevel::Normal
    }
}

fn init_tracing(verbosity: VerbosityLevel) {
    let default_directive = match verbosity {
        VerbosityLevel::Quiet => "error",
        VerbosityLevel::Normal => "warn",
        VerbosityLevel::Verbose => "validate_ns=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: &Cli, config: &Config) -> anyhow::Result<ExitCode> {
    let factory = Arc::new(XsdSchemaFactory::new(
        config.cache.max_schemas,
        config.cache_ttl(),
    ));
    // Problems found while loading the schema are logged; per-document diagnostics are collected
    // by the batch validator.
    let engine = Arc::new(ValidationEngine::new(
        factory,
        Arc::new(TracingSink),
        EngineOptions {
            check_id_idref: config.validation.check_id_idref,
            fail_fast: config.validation.fail_fast,
        },
    ));

    let schema_source = InputSource::from_path(&cli.schema)
        .with_context(|| format!("cannot open schema {}", cli.schema.display()))?;
    let loaded = engine
        .load_schema(&schema_source)
        .with_context(|| format!("cannot load schema {}", cli.schema.display()))?;
    if !loaded {
        eprintln!("Error: schema {} is incorrect", cli.schema.display());
        return Ok(ExitCode::from(EXIT_USAGE));
    }

    let discovery = FileDiscovery::new()
        .with_extensions(config.files.extensions.clone())
        .with_include_patterns(config.files.include_patterns.clone())?
        .with_exclude_patterns(config.files.exclude_patterns.clone())?;
    let batch = BatchValidator::new(
        engine,
        BatchConfig {
            max_concurrent_validations: config.thread_count(),
            validation_timeout: config.validation_timeout(),
            fail_fast: config.validation.fail_fast,
        },
    );
    debug!(config = ?batch.config(), "starting batch validation");

    let progress: Option<ProgressCallback> = config.validation.show_progress.then(|| {
        Arc::new(|p: validate_ns::batch::ValidationProgress| {
            if p.phase == ValidationPhase::Validation {
                eprint!("\rValidated {}/{}", p.completed, p.total);
                if p.completed == p.total {
                    eprintln!();
                }
            }
        }) as ProgressCallback
    });

    let results = batch
        .validate_path_with_progress(&cli.path, &discovery, progress)
        .await
        .with_context(|| format!("cannot validate {}", cli.path.display()))?;

    let output = Output::new(config.output.format, verbosity(config));
    println!("{}", output.render(&results)?);

    Ok(if results.has_failures() {
        ExitCode::from(EXIT_INVALID)
    } else {
        ExitCode::SUCCESS
    })
}

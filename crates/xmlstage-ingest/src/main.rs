//! xmlstage - XML to Postgres staging loader

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use xmlstage_common::logging::{init_logging, LogConfig, LogLevel};
use xmlstage_ingest::config::{ParseErrorPolicy, PipelineConfig};
use xmlstage_ingest::db::{
    create_pool, finalize_all, health_check, schema, DbConfig, PgCopySink, PgFinalizer,
};
use xmlstage_ingest::generate::{write_sample_file, SampleSpec};
use xmlstage_ingest::pipeline::{Coordinator, RunStatus};
use xmlstage_ingest::xml::XmlSource;

#[derive(Parser, Debug)]
#[command(name = "xmlstage")]
#[command(author, version, about = "Stream XML into Postgres staging tables and finalize")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create final and staging tables, then empty staging
    Init {
        /// Leave existing staging rows in place
        #[arg(long)]
        keep_staging: bool,
    },

    /// Load an XML document into staging and finalize it
    Run(RunArgs),

    /// Merge whatever is in staging into the final tables
    Finalize {
        /// Print the finalize reports as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write a synthetic input document
    Generate {
        /// Output file
        output: PathBuf,

        #[arg(long, default_value_t = 1_000)]
        groups: u64,

        #[arg(long, default_value_t = 10)]
        events_per_group: u64,

        /// Id of the first group
        #[arg(long, default_value_t = 1)]
        first_id: u64,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Input document (`.xml` or `.xml.gz`)
    input: PathBuf,

    /// Ensure the schema and empty staging before loading
    #[arg(long)]
    init: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    batch_max_rows: Option<usize>,

    #[arg(long)]
    batch_max_bytes: Option<usize>,

    #[arg(long)]
    channel_capacity: Option<usize>,

    #[arg(long)]
    copy_retries: Option<u32>,

    /// `skip` or `abort`
    #[arg(long)]
    parse_error_policy: Option<ParseErrorPolicy>,

    /// Give up on parsing and loading after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Skip ANALYZE after finalize
    #[arg(long)]
    no_analyze: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(rows) = self.batch_max_rows {
            config.batch_max_rows = rows;
        }
        if let Some(bytes) = self.batch_max_bytes {
            config.batch_max_bytes = bytes;
        }
        if let Some(capacity) = self.channel_capacity {
            config.channel_capacity = capacity;
        }
        if let Some(retries) = self.copy_retries {
            config.retry.max_retries = retries;
        }
        if let Some(policy) = self.parse_error_policy {
            config.parse_error_policy = policy;
        }
        if let Some(secs) = self.timeout_secs {
            config.run_timeout = Some(std::time::Duration::from_secs(secs));
        }
        if self.no_analyze {
            config.analyze = false;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("xmlstage")
        .build();

    // Environment takes precedence over flags
    let log_config = match log_config.merge_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(2);
        },
    };
    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: failed to initialize logging: {}", e);
            return ExitCode::from(2);
        },
    };

    match execute(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        },
    }
}

async fn execute(command: Command) -> Result<ExitCode> {
    match command {
        Command::Init { keep_staging } => {
            let config = load_config()?;
            let pool = connect(&config).await?;
            schema::ensure_schema(&pool, &config.tables).await?;
            if !keep_staging {
                schema::truncate_staging(&pool, &config.tables).await?;
            }
            pool.close().await;
            Ok(ExitCode::SUCCESS)
        },

        Command::Run(args) => run(args).await,

        Command::Finalize { json } => {
            let config = load_config()?;
            let pool = connect(&config).await?;
            let finalizer = PgFinalizer::new(pool.clone(), config.tables.clone())
                .with_analyze(config.analyze);
            let reports = finalize_all(&finalizer)
                .await
                .map_err(|(kind, e)| e.context(format!("Finalize failed for {}", kind)))?;
            pool.close().await;

            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            }
            Ok(ExitCode::SUCCESS)
        },

        Command::Generate {
            output,
            groups,
            events_per_group,
            first_id,
        } => {
            let config = load_config()?;
            let spec = SampleSpec {
                groups,
                events_per_group,
                first_id,
            };
            let bytes = write_sample_file(&output, &spec, &config.xml)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            info!(
                output = %output.display(),
                records = spec.total_records(),
                bytes,
                "Sample document written"
            );
            Ok(ExitCode::SUCCESS)
        },
    }
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let mut config = PipelineConfig::from_env()?;
    args.apply(&mut config);
    config.validate()?;

    let pool = connect(&config).await?;
    if args.init {
        schema::ensure_schema(&pool, &config.tables).await?;
        schema::truncate_staging(&pool, &config.tables).await?;
    }

    let sink = Arc::new(PgCopySink::new(pool.clone()));
    let finalizer =
        Arc::new(PgFinalizer::new(pool.clone(), config.tables.clone()).with_analyze(config.analyze));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping run");
            on_signal.cancel();
        }
    });

    let coordinator = Coordinator::new(config, sink, finalizer).with_cancellation(cancel);
    let summary = coordinator.run(XmlSource::path(&args.input)).await;
    pool.close().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    Ok(match summary.status {
        RunStatus::Done => ExitCode::SUCCESS,
        RunStatus::Failed => ExitCode::FAILURE,
        RunStatus::Cancelled => ExitCode::from(130),
    })
}

fn load_config() -> Result<PipelineConfig> {
    let config = PipelineConfig::from_env()?;
    config.validate()?;
    Ok(config)
}

async fn connect(config: &PipelineConfig) -> Result<sqlx::PgPool> {
    let db = DbConfig::from_env()?;
    db.validate_for_workers(config.workers)?;
    let pool = create_pool(&db).await.context("Failed to connect to database")?;
    health_check(&pool).await?;
    Ok(pool)
}

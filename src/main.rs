//! reroll CLI - Regenerate assistant turns of tool-calling datasets.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use reroll::models::format_tokens;
use reroll::{
    Config, LLMClient, OutputWriter, RerolloutPipeline, RunSummary, default_output_path,
    load_processed_ids,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Config file picked up from the working directory when `--config` is absent.
const DEFAULT_CONFIG: &str = "reroll.toml";

/// Per-call deadline for single-record runs, where a hung call is the bug being chased.
const SINGLE_RECORD_TIMEOUT_SECS: u64 = 120;

#[derive(Parser)]
#[command(name = "reroll")]
#[command(version)]
#[command(about = "Regenerate assistant turns of tool-calling datasets with a replacement model")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file [default: reroll.toml, if present]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output (per-turn logs, no progress bar)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Regenerate a dataset
    Run {
        /// Input JSONL file (or .json array)
        input: PathBuf,

        /// Output JSONL file [default: <input>_rerolled.jsonl]
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Only process the first N records
        #[arg(short, long)]
        num: Option<usize>,

        /// Only process the record at this index
        #[arg(short, long, conflicts_with = "num")]
        index: Option<usize>,

        /// Skip records already in the output file and append to it
        #[arg(long)]
        resume: bool,

        /// Chat completions URL
        #[arg(long)]
        api_url: Option<String>,

        /// Model name
        #[arg(long)]
        model: Option<String>,

        /// Maximum records regenerating at once
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,

        /// Attempts per call
        #[arg(short, long)]
        retries: Option<u32>,

        /// Per-call timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Write the first regenerated record, before and after, to this file
        #[arg(long)]
        proof: Option<PathBuf>,
    },

    /// Validate configuration and check the endpoint
    Validate,

    /// Show example configuration
    Example,
}

/// `RUST_LOG` wins when it parses; otherwise DEBUG with `--verbose`, INFO without.
fn log_filter(verbose: bool, directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(if verbose { "debug" } else { "info" }))
}

fn setup_logging(verbose: bool) -> Result<()> {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(log_filter(verbose, directives.as_deref()))
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Config::from_file_or_default(Path::new(DEFAULT_CONFIG))
            .with_context(|| format!("Failed to load config from {DEFAULT_CONFIG:?}"))?,
    };
    Ok(config)
}

fn print_example_config() {
    let example = r#"# reroll configuration file

[endpoint]
# Full chat completions URL, or a base URL ("/chat/completions" is appended)
api_url = "http://localhost:30000/v1/chat/completions"
model = "deepseek-ai/DeepSeek-V3.2"
# api_key = "sk-..."          # or:
# api_key_env = "REROLL_API_KEY"
timeout_secs = 300
max_retries = 5

# [endpoint.headers]
# X-Team = "${TEAM_ID}"

[generation]
temperature = 0.7
max_tokens = 2048

[run]
concurrency = 3000
"#;
    println!("{example}");
}

fn print_summary(summary: &RunSummary, output: &Path) {
    let tokens = &summary.tokens;
    println!("\n=== Rerollout Complete ===");
    println!("Records:     {}", summary.total_records);
    println!("Skipped:     {}", summary.skipped);
    println!("Processed:   {}", summary.processed());
    println!("Success:     {}", summary.success);
    println!("Errors:      {}", summary.error);
    println!("Runtime:     {:.1}s", summary.runtime_secs);
    println!("Throughput:  {:.2} rec/s", summary.records_per_sec);
    println!(
        "Tokens:      {} total ({} prompt, {} completion) over {} calls",
        format_tokens(tokens.total),
        format_tokens(tokens.prompt),
        format_tokens(tokens.completion),
        tokens.calls
    );
    println!(
        "Token rate:  {:.0} tok/s ({:.0} completion tok/s)",
        tokens.tokens_per_sec, tokens.completion_per_sec
    );
    println!("Output:      {output:?}");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Example => {
            print_example_config();
        }

        Commands::Validate => {
            let config = load_config(cli.config.as_deref())?;
            config.validate().context("Invalid configuration")?;

            let client = LLMClient::from_config(&config).context("Failed to build client")?;

            info!("Configuration is valid");
            info!("  Endpoint: {}", client.url());
            info!("  Model: {}", client.model());
            info!(
                "  Sampling: temperature {}, max_tokens {}",
                config.generation.temperature, config.generation.max_tokens
            );
            info!("  Concurrency: {}", config.run.concurrency);

            let health = client.health_check().await;
            match &health.error {
                None => info!(
                    url = %health.url,
                    latency_ms = health.latency_ms.unwrap_or_default(),
                    "Endpoint {}",
                    health.status
                ),
                Some(error) => warn!(url = %health.url, error = %error, "Endpoint {}", health.status),
            }
        }

        Commands::Run {
            input,
            output,
            num,
            index,
            resume,
            api_url,
            model,
            concurrency,
            retries,
            timeout,
            proof,
        } => {
            let mut config = load_config(cli.config.as_deref())?;

            // CLI flags override the file
            if let Some(api_url) = api_url {
                config.endpoint.api_url = api_url;
            }
            if let Some(model) = model {
                config.endpoint.model = model;
            }
            if let Some(concurrency) = concurrency {
                config.run.concurrency = concurrency;
            }
            if let Some(retries) = retries {
                config.endpoint.max_retries = retries;
            }
            config.endpoint.timeout_secs = match (timeout, index) {
                (Some(secs), _) => secs,
                (None, Some(_)) => SINGLE_RECORD_TIMEOUT_SECS,
                (None, None) => config.endpoint.timeout_secs,
            };
            config.validate().context("Invalid configuration")?;

            if !input.exists() {
                bail!("Input file not found: {:?}", input);
            }
            let output = output.unwrap_or_else(|| default_output_path(&input));

            let records = RerolloutPipeline::load_records(&input)
                .with_context(|| format!("Failed to load records from {:?}", input))?;
            let records = RerolloutPipeline::select(records, num, index)?;

            let processed = if resume {
                load_processed_ids(&output)
                    .with_context(|| format!("Failed to read resume state from {:?}", output))?
            } else {
                HashSet::new()
            };

            let writer = Arc::new(
                OutputWriter::open(&output, resume)
                    .await
                    .with_context(|| format!("Failed to open output {:?}", output))?,
            );

            let client = Arc::new(LLMClient::from_config(&config).context("Failed to build client")?);
            info!(
                endpoint = %client.url(),
                model = %client.model(),
                records = records.len(),
                "Rerolling"
            );

            let mut pipeline = RerolloutPipeline::new(client, config.run.concurrency)
                .with_progress(!cli.verbose);
            if let Some(proof) = proof {
                pipeline = pipeline.with_proof(proof, config.endpoint.model.clone());
            }

            let summary = pipeline.run(records, &processed, writer).await?;
            print_summary(&summary, &output);
        }
    }

    Ok(())
}

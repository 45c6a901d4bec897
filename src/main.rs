use anyhow::{Context, Result};
use clap::Parser;
use sharded_counter::{CliArgs, Config, Workload};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sharded-counter")]
#[command(about = "Drive a workload against an in-process sharded counter")]
struct Cli {
    #[arg(short, long, env = "SHARDED_COUNTER_CONFIG", help = "Path to a TOML or JSON config file")]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Increase verbosity")]
    verbose: bool,

    #[arg(long, default_value = "workload", help = "Name of the counter to drive")]
    counter: String,

    #[arg(long, default_value_t = 1000, help = "Number of unit increments")]
    increments: u64,

    #[arg(long, default_value_t = 0, help = "Number of unit decrements")]
    decrements: u64,

    #[arg(long, default_value_t = 8, help = "Concurrent tasks per phase")]
    concurrency: usize,

    #[arg(long, help = "Initial shard count for the counter")]
    shards: Option<u32>,

    #[arg(long, help = "Queue name for deletion jobs")]
    delete_queue: Option<String>,

    #[arg(long, help = "Disable the aggregate cache")]
    no_cache: bool,

    #[arg(long, help = "Delete the counter once the workload finishes")]
    delete: bool,

    #[arg(long, help = "Log level (error, warn, info, debug, trace)")]
    log_level: Option<String>,
}

fn max_level(cli: &Cli, config: &Config) -> tracing::Level {
    if cli.verbose {
        return tracing::Level::DEBUG;
    }
    config
        .logging
        .level
        .parse()
        .unwrap_or(tracing::Level::INFO)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = CliArgs {
        config_file: cli.config.clone(),
        initial_shards: cli.shards,
        delete_queue: cli.delete_queue.clone(),
        no_cache: cli.no_cache,
        log_level: cli.log_level.clone(),
    };
    let config = Config::load_with_cli(&args).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(max_level(&cli, &config))
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let workload = Workload {
        counter: cli.counter,
        increments: cli.increments,
        decrements: cli.decrements,
        concurrency: cli.concurrency,
        delete_after: cli.delete,
    };

    let report = sharded_counter::run(config, workload).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

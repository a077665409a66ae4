use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use quotaguard::config::RateLimiterConfig;
use quotaguard::ratelimit::RateLimiter;

/// Administer rate limits stored in MongoDB or Redis.
#[derive(Debug, Parser)]
#[command(name = "quotaguard", version, about)]
struct Cli {
    /// Path to the rate limiter configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "QUOTAGUARD_CONFIG", default_value = "quotaguard.yaml")]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Count one request against a key and print the decision
    Check { key: String },
    /// Delete the stored count for a key
    Reset { key: String },
    /// Print the stored record for a key without counting a request
    Inspect { key: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = RateLimiterConfig::from_file(&cli.config)?;
    info!(
        backend = %config.backend.kind(),
        max_requests = config.max_requests,
        window_seconds = config.window_seconds,
        "Configuration loaded"
    );

    let limiter = RateLimiter::new(config)?;
    let result = run(&limiter, cli.command).await;
    limiter.close().await?;
    result
}

async fn run(limiter: &RateLimiter, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Check { key } => {
            let outcome = limiter.check_key_outcome(&key).await?;
            if outcome.is_degraded() {
                info!(key = %key, "Backend unavailable, decision is fail-open");
            }
            println!("{}", serde_json::to_string_pretty(outcome.decision())?);
        }
        Command::Reset { key } => {
            limiter.reset_limit(&key).await?;
            println!("{}", serde_json::json!({ "key": key, "reset": true }));
        }
        Command::Inspect { key } => match limiter.get_limit_info(&key).await? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => println!("{}", serde_json::json!({ "key": key, "found": false })),
        },
    }
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

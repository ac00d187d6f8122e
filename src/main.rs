use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::ratelimit::{Limiter, LimiterRegistry, Outcome, SystemClock};

/// Validate admission-control policies and exercise them locally.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Policy file (YAML or JSON)
    #[arg(short, long, env = "TURNSTILE_CONFIG")]
    config: PathBuf,

    /// Log filter, overrides the policy file (RUST_LOG wins over both)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load the policy file and build every limiter in it
    Validate,
    /// Fire a burst of acquisitions at one policy and report the outcome
    Simulate(SimulateArgs),
}

#[derive(Debug, Args)]
struct SimulateArgs {
    /// Policy to exercise
    #[arg(short, long)]
    policy: String,

    /// Number of acquisitions
    #[arg(short = 'n', long, default_value_t = 20)]
    requests: u32,

    /// Pause between acquisitions
    #[arg(long, value_parser = humantime::parse_duration, default_value = "0s")]
    interval: Duration,

    /// How long each admitted unit of work holds its lease (concurrency only)
    #[arg(long, value_parser = humantime::parse_duration, default_value = "100ms")]
    hold: Duration,

    /// How long a queued acquisition may wait (concurrency only)
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = TurnstileConfig::from_file(&cli.config)?;
    init_tracing(&cli, &config);

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(path = %cli.config.display(), policies = config.policies.len(), "Configuration loaded");

    let registry = Arc::new(LimiterRegistry::from_config(&config, Arc::new(SystemClock))?);

    match cli.command {
        Command::Validate => {
            for (name, policy) in &config.policies {
                info!(policy = %name, kind = %policy.kind(), ?policy, "Policy is valid");
            }
        }
        Command::Simulate(args) => {
            tokio::select! {
                result = simulate(registry.clone(), args) => result?,
                _ = shutdown_signal() => {}
            }
            registry.close_all();
        }
    }

    info!("Turnstile stopped");
    Ok(())
}

fn init_tracing(cli: &Cli, config: &TurnstileConfig) {
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if cli.json || config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn simulate(registry: Arc<LimiterRegistry>, args: SimulateArgs) -> anyhow::Result<()> {
    let limiter = registry.resolve(&args.policy)?;
    info!(
        policy = %args.policy,
        kind = %limiter.kind(),
        requests = args.requests,
        "Starting simulation"
    );

    let (admitted, rejected) = if limiter.kind().is_blocking() {
        run_leases(limiter.clone(), &args).await?
    } else {
        run_attempts(limiter.as_ref(), &args).await?
    };

    let stats = limiter.statistics();
    info!(
        policy = %args.policy,
        admitted,
        rejected,
        available = stats.available_permits,
        queued = stats.queued_permits,
        "Simulation finished"
    );
    Ok(())
}

async fn run_attempts(limiter: &dyn Limiter, args: &SimulateArgs) -> anyhow::Result<(u32, u32)> {
    let (mut admitted, mut rejected) = (0, 0);
    for attempt in 0..args.requests {
        match limiter.try_acquire(1)? {
            Outcome::Admitted(_) => admitted += 1,
            Outcome::Rejected { retry_after } => {
                debug!(attempt, ?retry_after, "Rejected");
                rejected += 1;
            }
        }
        if !args.interval.is_zero() {
            tokio::time::sleep(args.interval).await;
        }
    }
    Ok((admitted, rejected))
}

async fn run_leases(limiter: Arc<dyn Limiter>, args: &SimulateArgs) -> anyhow::Result<(u32, u32)> {
    let mut tasks = JoinSet::new();
    for _ in 0..args.requests {
        let limiter = limiter.clone();
        let (hold, timeout) = (args.hold, args.timeout);
        tasks.spawn(async move {
            match limiter.acquire(1, timeout).await? {
                Outcome::Admitted(permit) => {
                    tokio::time::sleep(hold).await;
                    limiter.release(permit)?;
                    Ok::<_, turnstile::TurnstileError>(true)
                }
                Outcome::Rejected { .. } => Ok(false),
            }
        });
        if !args.interval.is_zero() {
            tokio::time::sleep(args.interval).await;
        }
    }

    let (mut admitted, mut rejected) = (0, 0);
    while let Some(result) = tasks.join_next().await {
        if result?? {
            admitted += 1;
        } else {
            rejected += 1;
        }
    }
    Ok((admitted, rejected))
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping simulation");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping simulation");
        }
    }
}

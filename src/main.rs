use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bouncer::config::{BouncerConfig, LoggingConfig, StoreBackend, StoreConfig};
use bouncer::ratelimit::{Decision, LimitStatus, RateLimiter, ScopeRegistry, DEFAULT_SCOPE};
use bouncer::store::{CounterStore, MemoryStore};

/// Inspect and administer attempt limits stored in a counter store.
#[derive(Debug, Parser)]
#[command(name = "bouncer", version, about)]
struct Cli {
    /// YAML configuration file; BOUNCER__* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record one attempt and print the decision
    Check(Target),
    /// Show remaining attempts and block status without recording anything
    Status {
        #[command(flatten)]
        target: Target,
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },
    /// Clear the counter and block for one identifier
    Reset(Target),
    /// Clear every counter and block in a scope
    ResetScope {
        #[arg(short, long, default_value = DEFAULT_SCOPE)]
        scope: String,
    },
    /// Record several attempts in a row, printing each decision
    Simulate {
        #[command(flatten)]
        target: Target,
        #[arg(short = 'n', long, default_value_t = 10)]
        attempts: u32,
    },
}

impl Command {
    /// Whether the command reads or changes state left by earlier runs, which
    /// a per-process memory store never has.
    fn needs_shared_store(&self) -> bool {
        !matches!(self, Command::Simulate { .. })
    }
}

#[derive(Debug, clap::Args)]
struct Target {
    /// Scope the attempts are counted under, e.g. an endpoint path
    #[arg(short, long, default_value = DEFAULT_SCOPE)]
    scope: String,
    /// Identifier being limited, e.g. a client IP or account name
    #[arg(short, long = "id")]
    identifier: String,
}

/// Status as printed by `status --json`.
#[derive(Debug, Serialize)]
struct StatusReport {
    scope: String,
    identifier: String,
    remaining_attempts: u64,
    blocked: bool,
    block_remaining_secs: u64,
    blocked_until: Option<String>,
    max_attempts: u64,
    window_secs: u64,
    block_duration_secs: u64,
}

impl StatusReport {
    fn new(status: LimitStatus) -> anyhow::Result<Self> {
        let blocked_until = if status.block.blocked && !status.block.remaining.is_zero() {
            let remaining = chrono::Duration::from_std(status.block.remaining)?;
            Some((chrono::Utc::now() + remaining).to_rfc3339())
        } else {
            None
        };

        Ok(Self {
            scope: status.scope,
            identifier: status.identifier,
            remaining_attempts: status.remaining_attempts,
            blocked: status.block.blocked,
            block_remaining_secs: status.block.remaining.as_secs(),
            blocked_until,
            max_attempts: status.limit.max_attempts,
            window_secs: status.limit.window.as_secs(),
            block_duration_secs: status.limit.block_duration.as_secs(),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = BouncerConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Bouncer");

    if config.store.backend == StoreBackend::Memory && cli.command.needs_shared_store() {
        anyhow::bail!(
            "the memory store does not outlive this process, so this command would \
             act on an empty store; configure `store.backend: redis` or use `simulate`"
        );
    }

    let store = connect_store(&config.store).await?;
    let registry = Arc::new(ScopeRegistry::from_config(&config)?);
    let limiter = RateLimiter::with_options(store, registry, config.limiter_options());
    info!(backend = ?config.store.backend, "Rate limiter initialized");

    match cli.command {
        Command::Check(target) => {
            let decision = limiter.check(&target.scope, &target.identifier).await?;
            println!("{}", describe(&decision));
        }
        Command::Status { target, json } => {
            let status = limiter.status(&target.scope, &target.identifier).await?;
            let report = StatusReport::new(status)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_status(&report);
            }
        }
        Command::Reset(target) => {
            limiter.reset(&target.scope, &target.identifier).await?;
            println!("reset {} in scope '{}'", target.identifier, target.scope);
        }
        Command::ResetScope { scope } => {
            let deleted = limiter.reset_all_for_scope(&scope).await?;
            println!("deleted {} keys in scope '{}'", deleted, scope);
        }
        Command::Simulate { target, attempts } => {
            for n in 1..=attempts {
                let decision = limiter.check(&target.scope, &target.identifier).await?;
                println!("#{:<4} {}", n, describe(&decision));
            }
            let status = limiter.status(&target.scope, &target.identifier).await?;
            print_status(&StatusReport::new(status)?);
        }
    }

    Ok(())
}

/// Initialize tracing, honoring `RUST_LOG` over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn connect_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    match config.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            if let Some(every) = config.purge_interval() {
                store.spawn_purger(every);
            }
            Ok(store as Arc<dyn CounterStore>)
        }
        #[cfg(feature = "redis-store")]
        StoreBackend::Redis => {
            let store = bouncer::store::RedisStore::connect(&config.redis_url)
                .await
                .with_context(|| format!("connecting to {}", config.redis_url))?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis-store"))]
        StoreBackend::Redis => {
            anyhow::bail!("the redis store backend requires building with the `redis-store` feature")
        }
    }
}

fn describe(decision: &Decision) -> String {
    match decision {
        Decision::Allowed {
            attempts,
            remaining,
        } => format!("allowed (attempt {}, {} remaining)", attempts, remaining),
        Decision::Tripped => "denied: attempt limit reached, now blocked".to_string(),
        Decision::Blocked => "denied: blocked".to_string(),
    }
}

fn print_status(report: &StatusReport) {
    println!("scope:              '{}'", report.scope);
    println!("identifier:         {}", report.identifier);
    println!(
        "remaining attempts: {}/{}",
        report.remaining_attempts, report.max_attempts
    );
    match &report.blocked_until {
        Some(until) => println!(
            "blocked:            yes, {}s left (until {})",
            report.block_remaining_secs, until
        ),
        None if report.blocked => println!("blocked:            yes, no expiry"),
        None => println!("blocked:            no"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Command {
        Cli::try_parse_from(args).unwrap().command
    }

    #[test]
    fn test_only_simulate_runs_on_a_private_store() {
        assert!(!parse(&["bouncer", "simulate", "--id", "u1"]).needs_shared_store());

        for args in [
            &["bouncer", "check", "--id", "u1"][..],
            &["bouncer", "status", "--id", "u1", "--json"][..],
            &["bouncer", "reset", "-s", "/login", "--id", "u1"][..],
            &["bouncer", "reset-scope", "--scope", "/login"][..],
        ] {
            assert!(parse(args).needs_shared_store(), "{:?}", args);
        }
    }
}

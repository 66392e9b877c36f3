use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use classnet::{Router, RouterConfig, hooks};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, Layer as _, fmt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the host inventory.
    #[arg(long, env = "CLASSNET_INVENTORY", default_value = "knownhosts.json")]
    inventory: PathBuf,

    /// Append-only router log, mirrored to stdout.
    #[arg(long, env = "CLASSNET_LOG_FILE", default_value = "router_log.txt")]
    log_file: PathBuf,

    /// Sequence diagram output (Mermaid dialect).
    #[arg(
        long,
        env = "CLASSNET_SEQUENCE_DIAGRAM",
        default_value = "sequence_diagram.txt"
    )]
    sequence_diagram: PathBuf,

    /// Enable the built-in random-delay manipulation, seeded for run-on-run
    /// determinism. Without a seed every message forwards untouched.
    #[arg(long, env = "CLASSNET_SEED")]
    seed: Option<u64>,

    /// Upper bound for the seeded random delay.
    #[arg(long, env = "CLASSNET_MAX_RANDOM_DELAY_MS", default_value_t = 250)]
    max_random_delay_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_file)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        inventory = %cli.inventory.display(),
        "classnet-router starting"
    );

    let builder = Router::init(&RouterConfig {
        inventory: cli.inventory,
        sequence_diagram: cli.sequence_diagram,
    })
    .context("failed to initialize router")?;

    let router = match cli.seed {
        Some(seed) => {
            let max = Duration::from_millis(cli.max_random_delay_ms);
            tracing::info!(seed, max_ms = cli.max_random_delay_ms, "seeded random delay enabled");
            builder.hook(hooks::RandomDelay::new(max, seed)).build()
        }
        None => builder.build(),
    };

    let run = {
        let router = router.clone();
        tokio::spawn(async move { router.run().await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!("shutting down");
    router.shutdown();

    run.await.context("router task panicked")??;

    Ok(())
}

/// Stdout logging filtered by `RUST_LOG` (default info), mirrored unfiltered
/// at info to the append-only log file.
fn init_logging(log_file: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("failed to open log file at {}", log_file.display()))?;

    tracing_subscriber::registry()
        .with(
            fmt::layer().with_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            ),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .with_filter(LevelFilter::INFO),
        )
        .init();

    Ok(())
}

//! Loop feed & recommendation serving-plane binary.

use clap::{Parser, Subcommand};
use loopcast_core::prelude::*;

#[derive(Parser)]
#[command(name = "loopcast-server")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server until a shutdown signal is received.
    Serve {
        /// Fail startup if the database is unreachable instead of
        /// degrading and retrying in the background.
        #[arg(long)]
        eager_database: bool,

        /// Fail startup if Redis is unreachable instead of degrading and
        /// retrying in the background.
        #[arg(long)]
        eager_cache: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load().context("loading configuration")?;
    init_tracing(&config).context("initializing tracing")?;

    let result = match cli.command {
        Commands::Serve { eager_database, eager_cache } => serve(config, eager_database, eager_cache).await,
    };

    if let Err(e) = &result {
        tracing::error!("loopcast-server exited with an error: {}", e);
    }

    result
}

async fn serve(config: Config, eager_database: bool, eager_cache: bool) -> anyhow::Result<()> {
    let mut builder = Kernel::builder(config.clone());
    if eager_database {
        builder = builder.eager_database();
    }
    if eager_cache {
        builder = builder.eager_cache();
    }

    let kernel = builder.build().await.context("building kernel")?;
    kernel.validate().await.context("validating kernel collaborators")?;

    for warning in kernel.degraded_warnings().await {
        tracing::warn!("{}", warning);
    }

    let app = Router::new()
        .route("/health", get(health))
        .route("/ready", get(readiness))
        .route("/metrics/pools", get(pool_metrics))
        .with_state(kernel.clone());

    let outcome = Server::new(config).serve(app).await.context("running HTTP server");

    kernel.shutdown().await;
    shutdown_tracing();

    outcome.map_err(Into::into)
}

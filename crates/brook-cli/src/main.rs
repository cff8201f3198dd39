//! Brook CLI - run dataflow workers and serve the HTTP/WebSocket boundary

use anyhow::{bail, Context, Result};
use brook_runtime::broker::{Broker, RedisBroker};
use brook_runtime::worker::{Engine, EngineConfig};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod api;
mod demo;

#[derive(Parser)]
#[command(name = "brook")]
#[command(version)]
#[command(about = "Brook - real-time dataflow over Redis streams", long_about = None)]
struct Cli {
    /// Broker endpoint
    #[arg(long, global = true, env = "REDIS_URL", default_value = "redis://localhost")]
    redis_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dataflow workers
    Run {
        /// Workers per role
        #[arg(short, long)]
        workers: Option<usize>,

        /// Per-role worker override as <consumer-group>=<count>
        #[arg(long = "role-workers", value_name = "GROUP=N")]
        role_workers: Vec<String>,
    },

    /// Serve the HTTP/WebSocket boundary
    Serve {
        /// Server port
        #[arg(short, long, default_value = "8000")]
        port: u16,

        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
    },

    /// Compile the model and print the consumer graph
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting tracing subscriber")?;

    let cli = Cli::parse();

    // Compile failures (cycles, unresolved references) exit nonzero here.
    let compiled = demo::model()?.compile()?;

    match cli.command {
        Commands::Check => {
            println!("model ok");
            println!("roles:");
            for group in compiled.groups() {
                println!("  {group}");
            }
            println!("generation order: {}", compiled.generation_order.join(", "));
            Ok(())
        }

        Commands::Run {
            workers,
            role_workers,
        } => {
            let mut config = EngineConfig::from_env();
            if let Some(workers) = workers {
                config.default_workers = workers;
            }
            for spec in &role_workers {
                let Some((group, count)) = spec.split_once('=') else {
                    bail!("--role-workers expects GROUP=N, got '{spec}'");
                };
                let count: usize = count
                    .parse()
                    .with_context(|| format!("bad worker count in '{spec}'"))?;
                config = config.with_workers(group, count);
            }

            let broker: Arc<dyn Broker> =
                Arc::new(RedisBroker::connect(&cli.redis_url).await?);
            let engine = Engine::new(compiled, broker, config);

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutdown requested, draining workers");
                let _ = shutdown_tx.send(true);
            });

            engine.run(shutdown_rx).await;
            Ok(())
        }

        Commands::Serve { port, bind } => {
            let broker: Arc<dyn Broker> =
                Arc::new(RedisBroker::connect(&cli.redis_url).await?);
            let state = api::ApiState::new(&compiled, broker);
            let addr: SocketAddr = format!("{bind}:{port}")
                .parse()
                .with_context(|| format!("bad bind address {bind}:{port}"))?;
            api::serve(state, addr).await;
            Ok(())
        }
    }
}

use clap::Parser;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio_stream::wrappers::LinesStream;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use keygate::config::KeygateConfig;
use keygate::node::Node;
use keygate::ratelimit::LimitCatalog;
use keygate::sidecar::Sidecar;

/// Run one Keygate rate limiting node, driven by JSON lines on stdin.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(long, short)]
    config: Option<String>,

    /// Limit catalog, overrides `catalog_path` from the configuration
    #[arg(long)]
    catalog: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries responses.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);
    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting Keygate rate limiting node");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = KeygateConfig::load(args.config.as_deref())?;
    let catalog = match args.catalog.as_deref().or(config.catalog_path.as_deref()) {
        Some(path) => LimitCatalog::from_file(path)?,
        None => LimitCatalog::new(),
    };
    info!(
        node_id = %config.node.node_id,
        backend = ?config.replication.backend,
        keys = catalog.len(),
        "Configuration loaded"
    );

    let node = Node::start(&config).await?;
    let sidecar = Sidecar::new(node.limiter().clone(), catalog);

    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let mut stdout = tokio::io::stdout();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next() => {
                let line = match line {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => {
                        error!(error = %e, "Failed to read stdin");
                        break;
                    }
                    None => {
                        info!("Stdin closed");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = sidecar.handle_line(&line);
                let mut out = serde_json::to_vec(&response)?;
                out.push(b'\n');
                stdout.write_all(&out).await?;
                stdout.flush().await?;
            }
        }
    }

    node.shutdown().await?;
    info!("Keygate node stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

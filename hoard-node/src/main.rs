//! `hoard`: run a node, publish files, fetch blobs by identifier.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use hoard_node::{config, Gateway, NodeConfig};
use tracing_subscriber::EnvFilter;

/// Content-addressed peer-to-peer blob store
#[derive(Parser)]
#[command(name = "hoard")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path (default: ~/.config/hoard/config.toml, /etc/hoard/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(long, global = true)]
    listen: Option<SocketAddr>,

    /// Extra seed peer, `host:port` or `<device-id>@host:port` (repeatable)
    #[arg(long = "seed", global = true)]
    seeds: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until Ctrl+C
    Serve {
        /// Files to store and serve
        #[arg(long = "publish")]
        publish: Vec<PathBuf>,
    },

    /// Retrieve a blob from the network and write it to a file
    Fetch {
        /// Identifier, e.g. sha256:<hex>
        id: String,

        /// Output file
        #[arg(short, long)]
        out: PathBuf,

        /// Media type to tag the download with
        #[arg(long, default_value = "application/octet-stream")]
        media_type: String,
    },

    /// Print the identifier of a file without storing it
    Hash {
        file: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "hoard=debug,hoard_node=debug"
    } else {
        "hoard=info,hoard_node=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Hash { ref file } => {
            let bytes = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
            println!("{}", hoard_core::hash(&bytes));
            Ok(())
        }
        Commands::Serve { ref publish } => {
            let config = load_config(&cli, None)?;
            serve(config, publish)
        }
        Commands::Fetch {
            ref id,
            ref out,
            ref media_type,
        } => {
            let config = load_config(&cli, Some(SocketAddr::from(([0, 0, 0, 0], 0))))?;
            fetch(config, id, out, media_type)
        }
    }
}

/// File (explicit or default paths), then env, then command-line overrides.
fn load_config(cli: &Cli, default_listen: Option<SocketAddr>) -> anyhow::Result<NodeConfig> {
    let mut config = match &cli.config {
        Some(path) => config::load_from(path)?,
        None => config::load()?,
    };
    if let Some(addr) = cli.listen.or(default_listen) {
        config.listen_addr = addr;
    }
    config.seed_peers.extend(cli.seeds.iter().cloned());
    Ok(config)
}

fn serve(config: NodeConfig, publish: &[PathBuf]) -> anyhow::Result<()> {
    let gateway = Gateway::start(config)?;
    for path in publish {
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let id = gateway.submit(&bytes, "application/octet-stream")?;
        println!("{id}  {}", path.display());
    }
    let node = gateway.node();
    println!("device {} listening on {}", node.device_id(), node.local_addr());
    gateway.block_on(shutdown_signal())?;
    gateway.shutdown();
    Ok(())
}

fn fetch(config: NodeConfig, id: &str, out: &PathBuf, media_type: &str) -> anyhow::Result<()> {
    let gateway = Gateway::start(config)?;
    let result = gateway.fetch(id, media_type);
    gateway.shutdown();
    let handle = result?;
    handle
        .write_to(out)
        .with_context(|| format!("writing {}", out.display()))?;
    println!("{} bytes written to {}", handle.len(), out.display());
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use common::{Depot, DepotMap, ExnodeId, Mode};
use log::info;
use serde::Deserialize;
use session::{CopyOptions, DownloadOptions, Session, SessionConfig, UploadOptions};
use std::{fs, sync::Arc, time::Duration};
use store::DataStore;

#[derive(Parser)]
#[command(name = "strand-ctl", about = "Move files through a strand object store")]
struct Cli {
    /// Metadata registry URL
    #[arg(long, default_value = "sqlite://strand.db?mode=rwc")]
    registry: String,

    /// TOML file listing depot descriptors; when absent the registry's
    /// depot table is used
    #[arg(long)]
    depots: Option<Utf8PathBuf>,

    /// Upload block size, e.g. "5m"
    #[arg(long, default_value = "64k")]
    block_size: String,

    /// Concurrent worker tasks
    #[arg(long, default_value_t = 5)]
    threads: usize,

    /// Replicas per chunk
    #[arg(long, default_value_t = 1)]
    copies: usize,

    /// Driver call timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Allocation lifetime hint in seconds
    #[arg(long, default_value_t = 86400)]
    duration: u64,

    /// Visualization endpoint
    #[arg(long)]
    viz: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload a local file
    Upload {
        path: Utf8PathBuf,
        /// Folder path the exnode is filed under, created on demand
        #[arg(long)]
        folder: Option<String>,
        /// Exnode name; defaults to the file name
        #[arg(long)]
        name: Option<String>,
    },
    /// Download an exnode to a local path
    Download { exnode: ExnodeId, dest: Utf8PathBuf },
    /// Replicate an exnode's data onto the session's depots
    Copy { exnode: ExnodeId },
    /// Create a directory path
    Mkdir { path: String },
    /// List a directory, or the registry root
    Ls { path: Option<String> },
}

#[derive(Deserialize)]
struct DepotFile {
    #[serde(default)]
    depot: Vec<Depot>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = SessionConfig::default()
        .block_size_str(&cli.block_size)?
        .threads(cli.threads)
        .copies(cli.copies)
        .timeout(Duration::from_secs(cli.timeout))
        .duration(Duration::from_secs(cli.duration));
    if let Some(url) = &cli.viz {
        config = config.viz_url(url.clone());
    }

    let registry = Arc::new(
        DataStore::new(&cli.registry)
            .await
            .context("cannot open metadata registry")?,
    );

    let depots = match &cli.depots {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("cannot read depot file {path}"))?;
            let parsed: DepotFile = toml::from_str(&raw)?;
            let mut map = DepotMap::new();
            for depot in parsed.depot {
                map.insert(depot.access_point.clone(), depot);
            }
            Some(map)
        }
        None => None,
    };

    let session = Session::new(registry, depots, config).await?;
    info!("session ready with {} depots", session.depots().len());

    match cli.command {
        Command::Upload { path, folder, name } => {
            let opts = UploadOptions {
                filename: name,
                folder,
                ..Default::default()
            };
            let result = session.upload(&path, opts).await?;
            println!(
                "uploaded {} bytes in {:.2}s -> exnode {}",
                result.bytes, result.duration_s, result.exnode.id
            );
        }
        Command::Download { exnode, dest } => {
            let result = session
                .download(&exnode, &dest, DownloadOptions::default())
                .await?;
            println!(
                "downloaded {} of {} bytes in {:.2}s -> {}",
                result.bytes, result.exnode.size, result.duration_s, dest
            );
        }
        Command::Copy { exnode } => {
            let result = session.copy(&exnode, CopyOptions::default()).await?;
            println!(
                "copied into exnode {} in {:.2}s",
                result.exnode.id, result.duration_s
            );
        }
        Command::Mkdir { path } => {
            let dir = session.mkdir(&path).await?;
            println!("{} {}", dir.id, path);
        }
        Command::Ls { path } => {
            for entry in session.ls(path.as_deref()).await? {
                let marker = match entry.mode {
                    Mode::Directory => "d",
                    Mode::File => "-",
                };
                println!("{marker} {:>12} {} {}", entry.size, entry.id, entry.name);
            }
        }
    }

    session.shutdown().await;
    Ok(())
}

//! depotctl: store, fetch and remove images in OpenStack Swift.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use depot_core::SwiftLocation;
use depot_storage::{ByteSource, HttpSwiftClient, ImageStore, StoreMode, SwiftStore};
use futures::StreamExt;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "depotctl")]
#[command(about = "Store and fetch images in OpenStack Swift")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "DEPOT_CONFIG",
        default_value = config::DEFAULT_CONFIG_PATH
    )]
    config: PathBuf,

    /// Print results as JSON
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload an image from a file, or from stdin with "-"
    Put {
        file: PathBuf,
        /// Image id (default: a random UUID)
        #[arg(long)]
        id: Option<String>,
    },
    /// Download an image to a file or stdout
    Get {
        location: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete an image and any segments backing it
    Delete { location: String },
    /// Show the size, checksum and layout of an image
    Stat { location: String },
}

#[derive(Serialize)]
struct PutOutput {
    location: String,
    size: u64,
    checksum: String,
}

#[derive(Serialize)]
struct StatOutput {
    container: String,
    object: String,
    size: u64,
    checksum: Option<String>,
    segments: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so `get` can stream image data to stdout.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = config::load_config(&cli.config)?;
    let store = SwiftStore::new(&config, Arc::new(HttpSwiftClient::new()))
        .context("failed to initialize Swift store")?;

    match cli.command {
        Commands::Put { file, id } => {
            if let StoreMode::Disabled { missing } = store.mode() {
                anyhow::bail!(
                    "adding images needs {} (set them in {} or DEPOT_* variables)",
                    missing.join(", "),
                    cli.config.display()
                );
            }
            let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let (source, size) = open_source(&file).await?;
            let stored = store
                .add(&id, source, size)
                .await
                .with_context(|| format!("failed to store {}", file.display()))?;

            let output = PutOutput {
                location: stored.location.to_uri(),
                size: stored.size,
                checksum: stored.checksum.to_hex(),
            };
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("location: {}", output.location);
                println!("size:     {}", output.size);
                println!("checksum: {}", output.checksum);
            }
        }
        Commands::Get { location, output } => {
            let image = store
                .get(&location)
                .await
                .context("failed to open image")?;
            let written = match &output {
                Some(path) => {
                    let file = tokio::fs::File::create(path)
                        .await
                        .with_context(|| format!("failed to create {}", path.display()))?;
                    copy_image(image.stream, file).await?
                }
                None => copy_image(image.stream, tokio::io::stdout()).await?,
            };
            if written != image.size {
                tracing::warn!(
                    expected = image.size,
                    written,
                    "Image size differs from the size reported by Swift"
                );
            }
            if let Some(path) = output {
                eprintln!("Wrote {written} bytes to {}", path.display());
            }
        }
        Commands::Delete { location } => {
            store
                .delete(&location)
                .await
                .context("failed to delete image")?;
            eprintln!("Deleted");
        }
        Commands::Stat { location } => {
            let parsed = SwiftLocation::parse(&location).context("invalid location")?;
            let stat = store.stat(&parsed).await.context("failed to stat image")?;
            let output = StatOutput {
                container: parsed.container().to_string(),
                object: parsed.object().to_string(),
                size: stat.size,
                checksum: stat.checksum.map(|c| c.to_hex()),
                segments: stat.segments,
            };
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("object:   {}/{}", output.container, output.object);
                println!("size:     {}", output.size);
                println!(
                    "checksum: {}",
                    output.checksum.as_deref().unwrap_or("unknown")
                );
                println!("segments: {}", output.segments);
            }
        }
    }

    Ok(())
}

/// Open the upload source and its size, or 0 when unknown.
async fn open_source(path: &Path) -> Result<(ByteSource, u64)> {
    if path.as_os_str() == "-" {
        return Ok((ByteSource::from_reader(tokio::io::stdin()), 0));
    }
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let size = file
        .metadata()
        .await
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();
    Ok((ByteSource::from_reader(file), size))
}

async fn copy_image<W>(mut stream: depot_storage::ByteStream, mut writer: W) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;
    while let Some(piece) = stream.next().await {
        let piece = piece.context("failed to read image")?;
        writer
            .write_all(&piece)
            .await
            .context("failed to write image")?;
        written += piece.len() as u64;
    }
    writer.flush().await.context("failed to write image")?;
    Ok(written)
}

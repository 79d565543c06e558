use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use imgsync::{
    AppConfig, ArchiveWriter, ExportEngine, ExportOptions, ImportEngine, DEFAULT_CONCURRENCY,
};
use ociclient::{Client, ClientConfig, Credentials, ImageReference, DEFAULT_CHUNK_SIZE};
use reqwest::Url;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Synchronize container images between tar archives and registries
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CommonArgs {
    /// Archive file to read or write
    #[arg(short, long)]
    file: PathBuf,

    /// SOCKS5 proxy address (host:port)
    #[arg(long)]
    proxy: Option<String>,

    /// JSON configuration file with per-registry endpoints and credentials
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Push every image in an archive to a registry
    Import {
        #[command(flatten)]
        common: CommonArgs,

        /// Registry URL, e.g. https://registry.example.com
        #[arg(long)]
        url: String,

        #[arg(short, long)]
        username: Option<String>,

        #[arg(short, long)]
        password: Option<String>,

        /// Upload chunk size in bytes
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },

    /// Write registry images into an archive
    Export {
        #[command(flatten)]
        common: CommonArgs,

        /// Prefix archive paths with the registry host
        #[arg(long)]
        include_registry: bool,

        /// Keep downloaded blobs in this directory across runs
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Concurrent blob downloads
        #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
        concurrency: usize,

        /// Images as registry/repository:tag or registry/repository@digest
        #[arg(required = true)]
        images: Vec<ImageReference>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_interrupt(cancel.clone()));

    match cli.command {
        Commands::Import {
            common,
            url,
            username,
            password,
            chunk_size,
        } => cmd_import(common, url, username, password, chunk_size, cancel).await,
        Commands::Export {
            common,
            include_registry,
            cache_dir,
            concurrency,
            images,
        } => cmd_export(common, include_registry, cache_dir, concurrency, images, cancel).await,
    }
}

async fn cancel_on_interrupt(cancel: CancellationToken) {
    if let Err(e) = signal::ctrl_c().await {
        warn!("failed to listen for Ctrl+C: {}", e);
        return;
    }
    warn!("interrupted, cancelling");
    cancel.cancel();
}

fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    AppConfig::load(path).with_context(|| match path {
        Some(path) => format!("Failed to load configuration from {}", path.display()),
        None => "Failed to load configuration".to_string(),
    })
}

async fn cmd_import(
    common: CommonArgs,
    url: String,
    username: Option<String>,
    password: Option<String>,
    chunk_size: usize,
    cancel: CancellationToken,
) -> Result<()> {
    let config = load_config(common.config.as_deref())?;
    let registry_url = url.trim_end_matches('/').to_string();

    let credentials = match (username, password) {
        (Some(username), password) => {
            Some(Credentials::new(username, password.unwrap_or_default()))
        }
        (None, _) => {
            let host = Url::parse(&registry_url)
                .with_context(|| format!("Invalid registry URL: {}", registry_url))?;
            let host = match host.port() {
                Some(port) => format!("{}:{}", host.host_str().unwrap_or_default(), port),
                None => host.host_str().unwrap_or_default().to_string(),
            };
            config.resolve(&host).credentials
        }
    };

    let client = Client::from_config(&ClientConfig {
        registry_url: registry_url.clone(),
        credentials,
        proxy: common.proxy,
        chunk_size,
    })
    .context("Failed to create registry client")?;

    client
        .ping()
        .await
        .with_context(|| format!("Registry {} is not reachable", registry_url))?;

    info!(archive = %common.file.display(), registry = %registry_url, "importing");
    let engine = ImportEngine::new(client, cancel);
    let report = engine
        .run(&common.file)
        .await
        .with_context(|| format!("Failed to import {}", common.file.display()))?;

    info!("import summary: {}", report);
    if report.cancelled {
        anyhow::bail!("import cancelled");
    }
    Ok(())
}

async fn cmd_export(
    common: CommonArgs,
    include_registry: bool,
    cache_dir: Option<PathBuf>,
    concurrency: usize,
    images: Vec<ImageReference>,
    cancel: CancellationToken,
) -> Result<()> {
    let config = load_config(common.config.as_deref())?;
    let options = ExportOptions {
        concurrency,
        cache_dir,
        proxy: common.proxy,
    };
    let engine =
        ExportEngine::new(config, options, cancel).context("Failed to prepare blob cache")?;

    let file = File::create(&common.file)
        .with_context(|| format!("Failed to create archive {}", common.file.display()))?;
    let mut writer = ArchiveWriter::new(BufWriter::new(file)).include_registry(include_registry);

    info!(archive = %common.file.display(), images = images.len(), "exporting");
    let report = engine
        .run(&images, &mut writer)
        .await
        .with_context(|| format!("Failed to write archive {}", common.file.display()))?;

    let mut out = writer.finish().context("Failed to finish archive")?;
    std::io::Write::flush(&mut out).context("Failed to flush archive")?;

    info!("export summary: {}", report);
    if report.cancelled {
        anyhow::bail!("export cancelled");
    }
    Ok(())
}

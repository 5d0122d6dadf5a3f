use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ipfeed::api::{create_api_router, AppState};
use ipfeed::auth::AuthService;
use ipfeed::config::{Config, StoreBackend};
use ipfeed::feed::FeedClient;
use ipfeed::ingest::{BatchWriter, WriteMode, WriterSettings};
use ipfeed::rangestore::RangeStore;
use ipfeed::scheduler::{Scheduler, SchedulerSettings};
use ipfeed::storage::{ContextCache, KvStore, MemoryStore, RedisStore, WatermarkStore};

#[derive(Parser)]
#[command(name = "ipfeed")]
#[command(about = "Keeps a key-value store in sync with an IP context feed", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the feed and keep the store up to date
    Daemon {
        /// Also serve the lookup API
        #[arg(long)]
        api: bool,
    },
    /// Load a local snapshot file, replacing stored records
    Insert {
        /// Path to a gzip-compressed feed file
        #[arg(long)]
        file: PathBuf,
    },
    /// Merge a local realtime file into stored records
    Merge {
        /// Path to a gzip-compressed realtime file
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    info!(?config, "Loaded configuration");

    let store: Arc<dyn KvStore> = match config.store.backend {
        StoreBackend::Redis => {
            info!("Using Redis store: {}", config.store.url);
            Arc::new(
                RedisStore::new(&config.store.url)
                    .await
                    .context("failed to connect to redis")?,
            )
        }
        StoreBackend::Memory => {
            info!("Using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let writer = Arc::new(BatchWriter::new(
        Arc::clone(&store),
        WriterSettings {
            workers: config.ingest.workers,
            chunk_size: config.ingest.chunk_size,
            ttl: config.ingest.ttl(),
        },
    ));

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    match cli.command {
        Commands::Daemon { api } => run_daemon(config, store, writer, api, cancel).await,
        Commands::Insert { file } => ingest_file(&writer, &file, WriteMode::Overwrite, &cancel).await,
        Commands::Merge { file } => ingest_file(&writer, &file, WriteMode::Merge, &cancel).await,
    }
}

async fn run_daemon(
    config: Config,
    store: Arc<dyn KvStore>,
    writer: Arc<BatchWriter>,
    api: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let feed = Arc::new(FeedClient::new(
        &config.feed.base_url,
        &config.feed.version,
        &config.feed.api_token,
    )?);
    info!(
        base_url = %config.feed.base_url,
        api_version = %config.feed.version,
        "feed client created"
    );

    let range_store = config.feed.ipv6_enabled.then(|| Arc::new(RangeStore::new()));

    let mut scheduler = Scheduler::new(
        feed,
        writer,
        WatermarkStore::new(Arc::clone(&store)),
        SchedulerSettings {
            feed_type: config.feed.feed_type,
            realtime_enabled: config.feed.realtime_enabled,
            ipv6_enabled: config.feed.ipv6_enabled,
            poll_interval: config.feed.poll_interval(),
        },
    );
    if let Some(range_store) = &range_store {
        scheduler = scheduler.with_range_store(Arc::clone(range_store));
    }

    let api_task = if api {
        let auth_service = AuthService::new(config.auth.local_tokens.clone());
        if !auth_service.has_tokens() {
            bail!("IPFEED_LOCAL_API_TOKENS must be set when the API is enabled");
        }

        let router = create_api_router(
            AppState {
                cache: ContextCache::new(Arc::clone(&store)),
                range_store: range_store.clone(),
            },
            Arc::new(auth_service),
        );

        let api_addr = format!("{}:{}", config.api_server.host, config.api_server.port);
        let listener = tokio::net::TcpListener::bind(&api_addr)
            .await
            .with_context(|| format!("failed to bind {api_addr}"))?;
        info!("🚀 API server listening on http://{}", api_addr);

        let shutdown = cancel.clone();
        Some(tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        }))
    } else {
        None
    };

    let result = scheduler.run(cancel.clone()).await;
    // A scheduler that stops for any reason takes the API down with it
    cancel.cancel();

    if let Some(task) = api_task {
        task.await?.context("API server failed")?;
    }
    result?;

    info!("done");
    Ok(())
}

async fn ingest_file(
    writer: &BatchWriter,
    path: &Path,
    mode: WriteMode,
    cancel: &CancellationToken,
) -> Result<()> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;

    info!(file = %path.display(), ?mode, "processing file");
    let outcome = writer.ingest(file, mode, cancel).await?;
    if outcome.cancelled {
        info!(count = outcome.written, "stopped early, partial file written");
    } else {
        info!(count = outcome.written, "file written to store");
    }
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("received signal to stop");
    cancel.cancel();
}

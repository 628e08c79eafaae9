//! geotrail - location telemetry queue and uploader
//!
//! This tool provides commands for:
//! - Inspecting the configuration and the pending event queue
//! - Queueing location events by hand
//! - Flushing the queue to the collection endpoint
//! - Running the full pipeline (periodic and reachability-driven sync)
//!
//! Uses XDG Base Directory specification for file locations:
//! - Queue: $XDG_DATA_HOME/geotrail/queue.db (~/.local/share/geotrail/queue.db)
//! - Config: $XDG_CONFIG_HOME/geotrail/config.toml (~/.config/geotrail/config.toml)
//! - Logs: $XDG_STATE_HOME/geotrail/ (~/.local/state/geotrail/)

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use geotrail_core::config::StoreKind;
use geotrail_core::format::{format_interval, format_relative_time, format_relative_time_opt};
use geotrail_core::pipeline::PipelineParts;
use geotrail_core::{
    auth, store, BatchUploader, Config, EventQueue, EventType, FixedNetwork, HttpTransport,
    LifecycleTransition, LocationData, LocationEvent, Pipeline, SyncStats,
};

#[derive(Parser)]
#[command(name = "geotrail")]
#[command(about = "Queue location telemetry and deliver it in batches")]
#[command(version)]
struct Args {
    /// Write logs to the XDG state directory
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration and queue status
    Status,

    /// Queue one location event
    Enqueue {
        /// Latitude in degrees
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,

        /// Longitude in degrees
        #[arg(long, allow_negative_numbers = true)]
        lon: f64,

        /// Horizontal accuracy in meters
        #[arg(long, default_value_t = 10.0)]
        accuracy: f64,

        /// Building floor
        #[arg(long, allow_negative_numbers = true)]
        floor: Option<i32>,

        /// Provider name (default: the active provider from config)
        #[arg(long)]
        provider: Option<String>,

        /// position, enter, exit or floor_change
        #[arg(long, default_value = "position")]
        event_type: String,
    },

    /// Upload everything pending, then exit
    Flush {
        /// Give up on a batch after the first failed attempt
        #[arg(long)]
        no_retry: bool,
    },

    /// Run the pipeline until interrupted
    Run,

    /// Drop all pending events
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    // Initialize logging if verbose
    let _log_guard = if args.verbose {
        Some(geotrail_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(&config).await,
        Command::Enqueue {
            lat,
            lon,
            accuracy,
            floor,
            provider,
            event_type,
        } => cmd_enqueue(&config, lat, lon, accuracy, floor, provider, &event_type).await,
        Command::Flush { no_retry } => cmd_flush(&config, no_retry).await,
        Command::Run => cmd_run(config).await,
        Command::Clear => cmd_clear(&config).await,
    }
}

fn open_queue(config: &Config) -> Result<EventQueue> {
    let store = store::open_default(config).context("failed to open queue store")?;
    Ok(EventQueue::open(store, &config.queue))
}

fn queue_location(config: &Config) -> String {
    let path = match config.queue.store {
        StoreKind::Sqlite => Config::queue_database_path(),
        StoreKind::Json => Config::queue_json_path(),
    };
    path.display().to_string()
}

async fn cmd_status(config: &Config) -> Result<()> {
    println!("geotrail Configuration");
    println!("======================");
    println!();
    println!("Endpoint:        {}", config.endpoints.events_batch);
    println!(
        "API Key:         {}",
        if config.auth.api_key.is_some() {
            "<set>"
        } else {
            "<not set>"
        }
    );
    println!(
        "Auth Token:      {}",
        if config.auth.token.is_some() {
            "<set>"
        } else if config.auth.exchange_api_key {
            "<exchanged for API key>"
        } else {
            "<not set>"
        }
    );
    println!(
        "Provider:        {}",
        match config.active_provider() {
            Ok(provider) => provider.kind.as_str().to_string(),
            Err(e) => format!("<{}>", e),
        }
    );
    println!("Batch Size:      {}", config.sync.batch_size);
    println!(
        "Sync Interval:   {}",
        format_interval(config.sync.sync_interval_secs)
    );
    println!(
        "Max Retries:     {} (backoff x{})",
        config.sync.max_retry_attempts, config.sync.retry_backoff_multiplier
    );
    println!("WiFi Only:       {}", config.sync.wifi_only_sync);
    println!(
        "Compression:     {}",
        if config.sync.compression_enabled {
            format!("gzip above {} bytes", config.sync.compression_threshold_bytes)
        } else {
            "off".to_string()
        }
    );
    println!("Queue Store:     {}", queue_location(config));
    println!(
        "Log File:        {}",
        geotrail_core::logging::log_file_path().display()
    );
    println!();

    let store = store::open_default(config).context("failed to open queue store")?;
    let last_saved_at = store.last_saved_at().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to read last persist time");
        None
    });
    let queue = EventQueue::open(store, &config.queue);
    let entries = queue.entries();

    println!("Queue");
    println!("-----");
    println!("Pending:         {}", entries.len());
    println!("Last Persist:    {}", format_relative_time_opt(last_saved_at));
    if let Some(oldest) = entries.first() {
        println!(
            "Oldest:          {}",
            format_relative_time(oldest.enqueued_at)
        );
    }
    if let Some(most_retried) = entries.iter().max_by_key(|e| e.retry_count) {
        if most_retried.retry_count > 0 {
            println!("Max Retries:     {}", most_retried.retry_count);
            println!(
                "Last Retry:      {}",
                format_relative_time_opt(entries.iter().filter_map(|e| e.last_retry_at).max())
            );
        }
    }

    Ok(())
}

async fn cmd_enqueue(
    config: &Config,
    lat: f64,
    lon: f64,
    accuracy: f64,
    floor: Option<i32>,
    provider: Option<String>,
    event_type: &str,
) -> Result<()> {
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        bail!("coordinates out of range: {}, {}", lat, lon);
    }
    let event_type: EventType = event_type.parse().map_err(anyhow::Error::msg)?;

    let provider = match provider {
        Some(provider) => provider,
        None => config
            .active_provider()
            .map(|p| p.kind.as_str().to_string())
            .unwrap_or_else(|_| "manual".to_string()),
    };

    let mut location = LocationData::new(lat, lon, accuracy, provider);
    if let Some(floor) = floor {
        location = location.with_floor(floor);
    }
    let id = location.id;

    let queue = open_queue(config)?;
    queue.enqueue(LocationEvent::new(location, event_type));
    queue.persist_to_disk();
    queue.wait_persisted().await;

    println!("Queued {} event {} ({} pending)", event_type.as_str(), id, queue.count());
    Ok(())
}

async fn cmd_flush(config: &Config, no_retry: bool) -> Result<()> {
    let mut settings = config.sync.clone();
    if no_retry {
        settings.max_retry_attempts = 0;
    }

    let queue = Arc::new(open_queue(config)?);
    let pending = queue.count();

    if pending == 0 {
        println!("Nothing to flush.");
        return Ok(());
    }

    println!("Flushing {} events to {}...", pending, config.endpoints.events_batch);

    let transport = HttpTransport::new(config).context("failed to create HTTP transport")?;
    let tokens = auth::connect(config)
        .await
        .context("failed to set up authentication")?;

    // A flush is an explicit request, so reachability is assumed
    let uploader = BatchUploader::spawn(
        queue.clone(),
        Arc::new(transport),
        Arc::new(FixedNetwork::WIFI),
        tokens,
        config.endpoints.events_batch.clone(),
        settings,
    );
    let stats = uploader.sync_until_idle().await;
    uploader.shutdown().await;
    queue.wait_persisted().await;

    print_stats(&stats);
    println!("Remaining:       {}", queue.count());
    Ok(())
}

fn print_stats(stats: &SyncStats) {
    println!();
    println!("Sync Statistics");
    println!("---------------");
    println!("Batches sent:    {}", stats.batches_uploaded);
    println!("Events sent:     {}", stats.events_uploaded);
    println!("Send attempts:   {}", stats.send_attempts);
    println!("Failures:        {}", stats.send_failures);
    println!("Deferred:        {}", stats.batches_exhausted);
    if let Some(error) = &stats.last_error {
        println!("Last error:      {}", error);
    }
}

async fn cmd_run(config: Config) -> Result<()> {
    let parts = PipelineParts::from_config(config)
        .await
        .context("failed to build pipeline")?;
    let pipeline = Pipeline::new(parts).context("failed to start pipeline")?;
    tracing::info!(pending = pipeline.count(), "geotrail run starting");

    println!(
        "geotrail running: {} pending, syncing every {} (Ctrl-C to stop)",
        pipeline.count(),
        format_interval(pipeline.config().sync.sync_interval_secs)
    );
    pipeline.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    println!("Stopping...");
    tracing::info!("Interrupted, shutting down");
    pipeline.handle_lifecycle(LifecycleTransition::Terminate);
    pipeline.shutdown().await;

    let status = pipeline.status();
    print_stats(&status.stats);
    println!("Pending:         {}", pipeline.count());
    Ok(())
}

async fn cmd_clear(config: &Config) -> Result<()> {
    let queue = open_queue(config)?;
    let count = queue.count();
    queue.clear();
    queue.wait_persisted().await;

    println!("Cleared {} pending events.", count);
    Ok(())
}

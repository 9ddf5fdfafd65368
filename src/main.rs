//! Crawl Conductor main entry point
//!
//! This is the command-line interface for the crawl orchestrator.

use clap::Parser;
use crawl_conductor::config::{load_config_with_hash, Config, LoggingConfig, StorageConfig};
use crawl_conductor::engine::Hooks;
use crawl_conductor::storage::{open_storage, StorageType};
use crawl_conductor::{logging, Client};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Crawl Conductor: schedules, deduplicates, retries and tracks crawl tasks
///
/// Seeds from the configuration are visited, the priority queue (if enabled)
/// is drained, and the run ends once every request and retry has settled.
#[derive(Parser, Debug)]
#[command(name = "crawl-conductor")]
#[command(version)]
#[command(about = "Crawl task orchestration engine", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Clear stored tasks and items before crawling
    #[arg(long)]
    fresh: bool,

    /// Load the saved queue snapshot before crawling
    #[arg(long)]
    resume_queue: bool,

    /// Validate config and show what would be crawled without actually crawling
    #[arg(long, conflicts_with = "progress")]
    dry_run: bool,

    /// Show task progress from storage and exit
    #[arg(long, conflicts_with = "dry_run")]
    progress: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The file sink is configured in the file, so logging starts once it is loaded
    let (config, config_hash) = match load_config_with_hash(&cli.config) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Failed to load configuration from {}: {}", cli.config.display(), e);
            return Err(e.into());
        }
    };

    let _log_guard = setup_logging(cli.verbose, cli.quiet, &config.logging)?;
    tracing::info!(
        "Configuration loaded from {} (hash: {})",
        cli.config.display(),
        config_hash
    );

    if cli.dry_run {
        handle_dry_run(&config);
    } else if cli.progress {
        handle_progress(&config)?;
    } else {
        handle_crawl(config, cli.fresh, cli.resume_queue).await?;
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
///
/// Console verbosity comes from the flags; the JSON file sink from `[logging]`.
fn setup_logging(
    verbose: u8,
    quiet: bool,
    config: &LoggingConfig,
) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("crawl_conductor=info,warn"),
            1 => EnvFilter::new("crawl_conductor=debug,info"),
            2 => EnvFilter::new("crawl_conductor=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    let guard = logging::init(filter, config)?;
    if config.enabled {
        tracing::info!(
            dir = %config.dir.display(),
            level = %config.level,
            "Writing JSON logs to file"
        );
    }
    Ok(guard)
}

/// Handles the --dry-run mode: prints the resolved configuration
fn handle_dry_run(config: &Config) {
    println!("=== Crawl Conductor Dry Run ===\n");

    println!("Fetch engine:");
    println!("  Max depth: {}", config.crawler.max_depth);
    println!("  User agent: {}", config.crawler.user_agent);
    println!("  Parallelism per domain: {}", config.crawler.parallelism);
    println!(
        "  Delay: {}ms (+ up to {}ms jitter)",
        config.crawler.delay_ms, config.crawler.random_delay_ms
    );
    println!("  Request timeout: {}ms", config.crawler.request_timeout_ms);
    println!("  Max redirects: {}", config.crawler.max_redirects);
    println!("  Robots.txt: {}", if config.crawler.ignore_robots_txt { "ignored" } else { "respected" });
    if !config.crawler.allowed_domains.is_empty() {
        println!("  Allowed domains: {}", config.crawler.allowed_domains.join(", "));
    }
    if !config.crawler.disallowed_domains.is_empty() {
        println!("  Disallowed domains: {}", config.crawler.disallowed_domains.join(", "));
    }

    println!("\nRetry:");
    println!("  Max retries: {}", config.retry.max_retries);
    println!("  Retry status codes: {:?}", config.retry.retry_http_codes);
    println!("  Retry on timeout: {}", config.retry.retry_on_timeout);

    println!("\nQueue: {}", if config.queue.enabled { "enabled" } else { "disabled" });
    if let Some(path) = &config.queue.snapshot_path {
        println!("  Snapshot: {}", path.display());
    }

    println!("\nStorage: {}", if config.storage.enabled { "enabled" } else { "disabled" });
    if config.storage.enabled {
        println!("  Type: {}", config.storage.storage_type);
        println!("  Database: {}", database_label(&config.storage));
        println!("  Duplicate strategy: {}", config.storage.duplicate_strategy);
    }

    println!("\nLogging:");
    println!("  Print headers: {}", config.logging.print_headers);
    println!("  Print cookies: {}", config.logging.print_cookies);
    if config.logging.enabled {
        println!(
            "  Log file: {}/{}.<date>.log",
            config.logging.dir.display(),
            config.logging.level.as_str()
        );
    }

    println!("\nSeeds ({}):", config.seeds.len());
    for seed in &config.seeds {
        println!("  - {}", seed);
    }

    println!("\n✓ Configuration is valid");
}

/// Where tasks are stored, with any MySQL password hidden
fn database_label(config: &StorageConfig) -> String {
    match config.storage_type {
        StorageType::MySql => {
            let dsn = config.dsn.as_deref().unwrap_or_default();
            match url::Url::parse(dsn) {
                Ok(mut url) if url.password().is_some() => {
                    let _ = url.set_password(Some("***"));
                    url.to_string()
                }
                _ => dsn.to_string(),
            }
        }
        StorageType::Sqlite => config.database_path().display().to_string(),
        StorageType::Memory => "(in memory)".to_string(),
    }
}

/// Handles the --progress mode: prints task counts from storage
fn handle_progress(config: &Config) -> anyhow::Result<()> {
    let storage = open_storage(&config.storage)?;
    let progress = storage.progress()?;
    storage.close()?;

    println!("Database: {}\n", database_label(&config.storage));
    println!("Tasks:     {}", progress.total);
    println!("Completed: {}", progress.completed);
    println!("Failed:    {}", progress.failed);
    println!("Pending:   {}", progress.pending);
    println!("Running:   {}", progress.running);
    println!("Started:   {}", progress.start_time.to_rfc3339());
    if let Some(done) = progress.completed_at {
        println!("Finished:  {}", done.to_rfc3339());
    }

    Ok(())
}

/// Handles the main crawl operation
async fn handle_crawl(config: Config, fresh: bool, resume_queue: bool) -> anyhow::Result<()> {
    let snapshot_path = config.queue.snapshot_path.clone();
    let client = Client::new(config, Hooks::new())?;

    if fresh {
        if let Some(storage) = client.storage() {
            tracing::info!("Starting fresh crawl (clearing stored tasks and items)");
            storage.clear()?;
        }
    }

    if resume_queue {
        if let (Some(queue), Some(path)) = (client.queue(), &snapshot_path) {
            match queue.load_from_file(path) {
                Ok(count) => tracing::info!(count, "Restored queued requests"),
                Err(e) => tracing::warn!(error = %e, "Could not restore queue snapshot"),
            }
        }
    }

    let interrupted = tokio::select! {
        result = run_crawl(&client) => {
            result?;
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };

    if interrupted {
        tracing::warn!("Interrupted, shutting down");
        client.stop().await;

        if let (Some(queue), Some(path)) = (client.queue(), &snapshot_path) {
            match queue.save_to_file(path) {
                Ok(count) => tracing::info!(count, path = %path.display(), "Saved queue snapshot"),
                Err(e) => tracing::error!(error = %e, "Failed to save queue snapshot"),
            }
        }
    }

    if let Some(stats) = client.stats().await {
        tracing::info!(
            total = stats.total,
            success = stats.success,
            failed = stats.failed,
            "Crawl finished"
        );
    }

    client.close().await?;
    Ok(())
}

async fn run_crawl(client: &Client) -> anyhow::Result<()> {
    let seeds = client.config().seeds.clone();
    tracing::info!("Total seed URLs: {}", seeds.len());

    for seed in &seeds {
        if let Err(e) = client.visit(seed) {
            tracing::warn!(url = %seed, error = %e, "Seed rejected");
        }
    }

    if client.queue().is_some() {
        client.process_queue(true).await?;
    }
    client.wait().await;

    Ok(())
}

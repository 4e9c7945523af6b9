//! Sumi-Harvest main entry point
//!
//! This is the command-line interface for the Sumi-Harvest preservation crawler.

use anyhow::{bail, Context};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sumi_harvest::au::{ArchivalUnit, AuRegistry, ConfiguredAu};
use sumi_harvest::config::{load_config_with_hash, Config};
use sumi_harvest::crawler::{hash_au_content, CrawlManager, CrawlServices, HttpFetcher};
use sumi_harvest::storage::{open_repository, Repository};
use sumi_harvest::HarvestError;
use tracing_subscriber::EnvFilter;

/// Sumi-Harvest: a preservation crawler for archival units
///
/// Crawls the archival units named in the configuration into a local
/// SQLite repository, honoring permission pages, crawl windows and
/// fetch rate limits.
#[derive(Parser, Debug)]
#[command(name = "sumi-harvest")]
#[command(version = "1.0.0")]
#[command(about = "A preservation crawler for archival units", long_about = None)]
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

    /// Crawl only these archival units (by id); default is all
    #[arg(long = "au", value_name = "ID")]
    aus: Vec<String>,

    /// Repair these URLs instead of crawling for new content (needs one --au)
    #[arg(long, value_name = "URL", num_args = 1..)]
    repair: Vec<String>,

    /// Validate config and show what would be crawled without crawling
    #[arg(long, conflicts_with_all = ["hash", "repair"])]
    dry_run: bool,

    /// Print the content hash of each stored archival unit and exit
    #[arg(long, conflicts_with_all = ["dry_run", "repair"])]
    hash: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", hash);

    let registry = Arc::new(build_registry(&config)?);
    let selected = select_aus(&registry, &cli.aus)?;

    if cli.dry_run {
        handle_dry_run(&config, &selected);
        return Ok(());
    }

    let repository = Arc::new(
        open_repository(Path::new(&config.output.database_path))
            .with_context(|| format!("opening {}", config.output.database_path))?,
    );
    if cli.hash {
        return handle_hash(repository.as_ref(), &selected);
    }

    let fetcher = Arc::new(HttpFetcher::new(&config.http, &config.user_agent)?);
    let services = CrawlServices::new(fetcher, repository, registry);
    let manager = CrawlManager::new(Arc::new(config), services)?;

    if cli.repair.is_empty() {
        handle_crawl(&manager, selected).await
    } else {
        let [au] = selected.as_slice() else {
            bail!("--repair needs exactly one --au");
        };
        handle_repair(&manager, au.clone(), cli.repair).await
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("sumi_harvest=info,warn"),
            1 => EnvFilter::new("sumi_harvest=debug,info"),
            2 => EnvFilter::new("sumi_harvest=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

fn build_registry(config: &Config) -> sumi_harvest::Result<AuRegistry> {
    let registry = AuRegistry::new();
    for au_config in &config.archival_units {
        registry.register(Arc::new(ConfiguredAu::from_config(au_config)?));
    }
    Ok(registry)
}

fn select_aus(registry: &AuRegistry, ids: &[String]) -> sumi_harvest::Result<Vec<Arc<dyn ArchivalUnit>>> {
    let ids = if ids.is_empty() {
        registry.ids()
    } else {
        ids.to_vec()
    };
    ids.iter()
        .map(|id| {
            registry
                .get(id)
                .ok_or_else(|| HarvestError::UnknownAu(id.clone()))
        })
        .collect()
}

/// Handles the --dry-run mode: shows what would be crawled
fn handle_dry_run(config: &Config, aus: &[Arc<dyn ArchivalUnit>]) {
    println!("=== Sumi-Harvest Dry Run ===\n");

    println!("Crawler:");
    println!("  Max crawl depth: {}", config.crawler.max_crawl_depth);
    println!("  Refetch depth: {}", config.crawler.refetch_depth);
    println!("  Explode archives: {}", config.crawler.explode_archives);

    println!("\nManager:");
    println!("  Pool size: {}", config.manager.pool_size);
    println!("  New content rate: {}", config.manager.new_content_rate);
    println!("  Repair rate: {}", config.manager.repair_rate);

    println!("\nUser Agent: {}", config.user_agent.header_value());
    println!("Database: {}", config.output.database_path);

    println!("\nArchival Units ({}):", aus.len());
    for au in aus {
        println!("  - {} ({})", au.id(), au.name());
        for url in au.start_urls() {
            println!("    start: {}", url);
        }
        for url in au.permission_urls() {
            println!("    permission: {}", url);
        }
    }

    println!("\n✓ Configuration is valid");
}

/// Handles the --hash mode: prints the stored content digest of each AU
fn handle_hash(repository: &dyn Repository, aus: &[Arc<dyn ArchivalUnit>]) -> anyhow::Result<()> {
    for au in aus {
        let (hash, count) = hash_au_content(repository, au.id())?;
        println!("{}  {} ({} urls)", hash, au.id(), count);
    }
    Ok(())
}

/// Crawls every selected AU for new content and waits for all of them
async fn handle_crawl(manager: &CrawlManager, aus: Vec<Arc<dyn ArchivalUnit>>) -> anyhow::Result<()> {
    let mut handles = Vec::new();
    let mut failed = 0;
    for au in aus {
        match manager.start_new_content_crawl(au, None) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                tracing::warn!("{}", e);
                failed += 1;
            }
        }
    }

    for handle in handles {
        let outcome = handle.wait().await;
        println!("{}", outcome.status.summary());
        if !outcome.success {
            failed += 1;
        }
    }

    if failed > 0 {
        bail!("{} crawl(s) did not succeed", failed);
    }
    tracing::info!("All crawls completed successfully");
    Ok(())
}

async fn handle_repair(
    manager: &CrawlManager,
    au: Arc<dyn ArchivalUnit>,
    urls: Vec<String>,
) -> anyhow::Result<()> {
    let handle = manager.start_repair(au, urls, None)?;
    let outcome = handle.wait().await;
    println!("{}", outcome.status.summary());
    if !outcome.success {
        bail!("repair did not succeed: {}", outcome.status.message());
    }
    Ok(())
}

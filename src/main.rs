mod cli;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

// mimalloc keeps memory flat under the batch-churn of concurrent fetch/parse
// workloads; glibc malloc doesn't reliably release it back.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use crawlsite::RunDriver;
use crawlsite_core::{AppConfig, CrawlConfig};
use crawlsite_store::Store;

use crate::cli::{Cli, Commands};

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config_str = std::fs::read_to_string(&cli.config).unwrap_or_else(|_| {
        warn!(path = %cli.config, "config file not found, using defaults");
        include_str!("../config/default.toml").to_string()
    });
    let config: AppConfig = toml::from_str(&config_str)?;

    let store = Arc::new(Store::new(&config.database.postgres_url).await?);
    store.run_migrations().await?;

    match cli.command {
        Commands::Analyze {
            seed,
            application_id,
            max_depth,
            max_pages,
        } => run_analyze(store, config.default_crawl, seed, application_id, max_depth, max_pages).await,
        Commands::Status { run_id } => run_status_cmd(store, run_id).await,
        Commands::Source { run_id, url } => run_source_cmd(store, config.default_crawl, run_id, url).await,
        Commands::Delete { run_id } => run_delete_cmd(store, run_id).await,
    }
}

async fn run_analyze(
    store: Arc<Store>,
    mut config: CrawlConfig,
    seed: String,
    application_id: Option<uuid::Uuid>,
    max_depth: Option<u32>,
    max_pages: Option<usize>,
) -> Result<()> {
    if let Some(d) = max_depth {
        config.max_crawl_depth = d;
    }
    if let Some(p) = max_pages {
        config.max_pages_to_crawl = p;
    }

    let seed_url = url::Url::parse(&seed)?;
    let application_id = application_id.unwrap_or_else(uuid::Uuid::new_v4);

    let driver = RunDriver::new(store);
    let handle = driver.start_run(application_id, seed_url, config).await?;
    info!(run_id = %handle.run_id, "run started");

    let outcome = handle.join().await?;
    let run = outcome.run;

    println!("run {} finished as {:?}", run.id, run.state);
    println!(
        "pages_analyzed={} links_found={} broken={} blank={} content={} score={:.1}",
        run.pages_analyzed,
        run.links_found,
        run.broken_count,
        run.blank_count,
        run.content_page_count,
        run.score
    );
    if let Some(msg) = run.error_message {
        println!("error: {msg}");
    }

    Ok(())
}

async fn run_status_cmd(store: Arc<Store>, run_id: uuid::Uuid) -> Result<()> {
    let bundle = store.get_run(run_id).await?;
    let run = bundle.run;

    println!("run {} state={:?}", run.id, run.state);
    println!(
        "pages_analyzed={} links_found={} broken={} blank={} content={} score={:.1}",
        run.pages_analyzed,
        run.links_found,
        run.broken_count,
        run.blank_count,
        run.content_page_count,
        run.score
    );
    println!("pages recorded: {}", bundle.pages.len());
    println!("edges recorded: {}", bundle.edges.len());
    if let Some(msg) = run.error_message {
        println!("error: {msg}");
    }

    Ok(())
}

async fn run_source_cmd(
    store: Arc<Store>,
    config: CrawlConfig,
    run_id: uuid::Uuid,
    url: String,
) -> Result<()> {
    let read = store.get_source(run_id, &url, config.max_crawl_depth).await?;

    println!("actual_source_page: {}", read.actual_source_page);
    println!("is_source_from_parent: {}", read.is_source_from_parent);
    println!("hierarchy_depth: {}", read.hierarchy_depth);
    println!("traversal_path: {}", read.traversal_path.join(" -> "));
    println!("highlighted_links: {}", read.highlighted_links.len());
    println!("{}", read.html);

    Ok(())
}

async fn run_delete_cmd(store: Arc<Store>, run_id: uuid::Uuid) -> Result<()> {
    store.delete_run(run_id).await?;
    println!("deleted run {run_id}");
    Ok(())
}

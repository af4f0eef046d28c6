use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use estate_adapters::SourceScraper;
use estate_core::{JobPriority, JobTrigger, RunType, ScrapeJobRequest, SourceId};
use estate_storage::{BronzeStore, Browser, ListingStore, PgListingStore};
use estate_sync::{
    connect_pool, default_schedules, load_sold_patterns, run_migrations, schedule_views, HttpProber,
    Ingestor, PgBroker, QueueBroker, QueueWorker, ReconcileDaemon, ReconcileOptions, ScrapeJobHandler,
    ScrapeQueue, ScrapeScheduler, ScraperManager, SourceSyncAgent, SyncConfig, WorkerConfig,
    SOURCE_SYNC_SCHEDULE_ID,
};
use estate_web::AppState;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "estate-cli")]
#[command(about = "Listing scrape, queue and reconciliation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Consume scrape jobs from the queue until Ctrl-C.
    Worker,
    /// Enqueue jobs on the cron schedule until Ctrl-C.
    Scheduler,
    /// Re-probe stored listings against their origin sites.
    Reconcile {
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        batch_size: Option<usize>,
        /// Delete gone listings instead of updating their status.
        #[arg(long)]
        delete: bool,
        /// Keep running on the source-sync cron.
        #[arg(long)]
        daemon: bool,
    },
    /// Scrape sources inline, without the queue.
    Scrape {
        #[arg(long = "source")]
        sources: Vec<SourceId>,
        #[arg(long, default_value_t = estate_core::DEFAULT_MAX_PAGES)]
        max_pages: u32,
        #[arg(long = "governorate")]
        governorates: Vec<String>,
        #[arg(long = "property-type")]
        property_types: Vec<String>,
    },
    /// Add a scrape job to the queue.
    Enqueue {
        #[arg(long = "source")]
        sources: Vec<SourceId>,
        #[arg(long = "type")]
        run_type: Option<RunType>,
        #[arg(long)]
        max_pages: Option<u32>,
        #[arg(long)]
        priority: Option<JobPriority>,
        #[arg(long = "governorate")]
        governorates: Vec<String>,
        #[arg(long = "property-type")]
        property_types: Vec<String>,
    },
    Status {
        job_id: Uuid,
    },
    /// Ingest one bronze file, or every bronze file in a directory.
    Ingest {
        path: PathBuf,
    },
    Schedules,
    Migrate,
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}

fn non_empty<T>(values: Vec<T>) -> Option<Vec<T>> {
    (!values.is_empty()).then_some(values)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn browser() -> Arc<dyn Browser> {
    #[cfg(feature = "chrome")]
    {
        Arc::new(estate_storage::chrome::ChromeBrowser::default())
    }
    #[cfg(not(feature = "chrome"))]
    {
        Arc::new(estate_storage::HttpBrowser)
    }
}

fn scraper_manager(config: &SyncConfig) -> ScraperManager {
    let scraper = SourceScraper::new(browser(), BronzeStore::new(&config.bronze_dir))
        .with_navigation_timeout(config.page_timeout());
    ScraperManager::new(Arc::new(scraper))
}

fn pg_queue(pool: &PgPool) -> (Arc<dyn QueueBroker>, ScrapeQueue) {
    let broker: Arc<dyn QueueBroker> = Arc::new(PgBroker::new(pool.clone()));
    (broker.clone(), ScrapeQueue::new(broker))
}

async fn source_sync_agent(config: &SyncConfig, pool: &PgPool, delete: bool) -> Result<SourceSyncAgent> {
    let store: Arc<dyn ListingStore> = Arc::new(PgListingStore::new(pool.clone()));
    let prober = Arc::new(HttpProber::new(config.probe_timeout())?);
    let mut agent = SourceSyncAgent::new(store, prober).with_delete_mode(delete || config.source_sync_delete);
    if let Some(path) = &config.source_sync_patterns {
        agent = agent.with_patterns(load_sold_patterns(path).await?);
    }
    Ok(agent)
}

/// Cancelled on the first Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        trigger.cancel();
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Worker => {
            let pool = connect_pool(&config.database_url).await?;
            let (broker, _) = pg_queue(&pool);
            let handler = ScrapeJobHandler::new(
                scraper_manager(&config),
                config.scraper_template(SourceId::Tayara),
            );
            let worker = QueueWorker::new(
                broker,
                Arc::new(handler),
                WorkerConfig {
                    poll_interval: std::time::Duration::from_secs(config.poll_interval_secs.max(1)),
                    lease: config.lease(),
                    ..WorkerConfig::default()
                },
            );
            worker.run(shutdown_token()).await?;
        }
        Commands::Scheduler => {
            let pool = connect_pool(&config.database_url).await?;
            let (_, queue) = pg_queue(&pool);
            let mut scheduler = ScrapeScheduler::new(queue);
            scheduler.start().await?;
            shutdown_token().cancelled().await;
            scheduler.shutdown().await?;
        }
        Commands::Reconcile {
            dry_run,
            batch_size,
            delete,
            daemon,
        } => {
            let pool = connect_pool(&config.database_url).await?;
            let agent = source_sync_agent(&config, &pool, delete).await?;
            let defaults = config.reconcile_options();
            let options = ReconcileOptions {
                dry_run: dry_run || defaults.dry_run,
                batch_size: batch_size.filter(|n| *n > 0).unwrap_or(defaults.batch_size),
            };

            if daemon {
                let cron = default_schedules()
                    .into_iter()
                    .find(|s| s.id == SOURCE_SYNC_SCHEDULE_ID)
                    .map(|s| s.cron)
                    .context("source-sync schedule missing")?;
                let mut daemon = ReconcileDaemon::new(Arc::new(agent), options, cron);
                daemon.start().await?;
                shutdown_token().cancelled().await;
                daemon.shutdown().await?;
            } else {
                let summary = agent.run(options).await?;
                print_json(&summary)?;
            }
        }
        Commands::Scrape {
            sources,
            max_pages,
            governorates,
            property_types,
        } => {
            let sources = if sources.is_empty() {
                SourceId::ALL.to_vec()
            } else {
                sources
            };
            let configs = sources
                .into_iter()
                .map(|source| {
                    config
                        .scraper_template(source)
                        .with_max_pages(max_pages)
                        .with_scope(governorates.clone(), property_types.clone())
                })
                .collect::<Vec<_>>();
            let results = scraper_manager(&config).scrape_all(&configs).await;
            print_json(&results)?;
        }
        Commands::Enqueue {
            sources,
            run_type,
            max_pages,
            priority,
            governorates,
            property_types,
        } => {
            let pool = connect_pool(&config.database_url).await?;
            let (_, queue) = pg_queue(&pool);
            let handle = queue
                .enqueue(ScrapeJobRequest {
                    sources: non_empty(sources),
                    run_type,
                    governorates: non_empty(governorates),
                    property_types: non_empty(property_types),
                    max_pages,
                    priority,
                    trigger: Some(JobTrigger::Manual),
                    schedule_id: None,
                })
                .await?;
            println!("queued job {}", handle.id);
            print_json(&handle.data)?;
        }
        Commands::Status { job_id } => {
            let pool = connect_pool(&config.database_url).await?;
            let (_, queue) = pg_queue(&pool);
            match queue.get_status(job_id).await? {
                Some(status) => print_json(&status)?,
                None => anyhow::bail!("job {job_id} not found"),
            }
        }
        Commands::Ingest { path } => {
            let pool = connect_pool(&config.database_url).await?;
            let ingestor = Ingestor::new(Arc::new(PgListingStore::new(pool)));
            let reports = if path.is_dir() {
                ingestor.ingest_dir(&path).await?
            } else {
                vec![ingestor.ingest_file(&path).await?]
            };
            print_json(&reports)?;
        }
        Commands::Schedules => {
            print_json(&schedule_views(&default_schedules(), Utc::now()))?;
        }
        Commands::Migrate => {
            let pool = connect_pool(&config.database_url).await?;
            run_migrations(&pool).await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let pool = connect_pool(&config.database_url).await?;
            let (_, queue) = pg_queue(&pool);
            let agent = source_sync_agent(&config, &pool, false).await?;
            let state = AppState::new(queue, config.api_key.clone())
                .with_reconciler(Arc::new(agent), config.reconcile_options());
            estate_web::serve(&config.web_bind, state).await?;
        }
    }

    Ok(())
}

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, error, info};

use postqueue::cli::{Cli, Command};
use postqueue::clock::{Clock, SystemClock};
use postqueue::config::Config;
use postqueue::graph::GraphClient;
use postqueue::logging;
use postqueue::publish::{PollSettings, PublishWorkflow, Publisher};
use postqueue::queue::{JobStore, NewJob, SqliteJobStore};
use postqueue::scheduler::{Scheduler, SchedulerSettings};
use postqueue::ui::{self, Progress};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_json || logging::json_from_env());

    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    debug!(?config, "configuration loaded");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match cli.command {
        Command::Enqueue {
            image_url,
            caption,
            publish_at,
        } => {
            let job = NewJob::new(&image_url, &caption, &publish_at)?;
            let store = open_store(&config, clock)?;
            let outcome = store.enqueue(job).await?;
            info!(key = %outcome.key, queued = outcome.queued, "enqueue");
            ui::print_enqueue(&outcome)?;
        }
        Command::Tick => {
            let scheduler = build_scheduler(&config, clock)?;
            let progress = Progress::start("Publishing due jobs...");
            let outcome = scheduler.run().await;
            progress.finish();
            ui::print_tick(&outcome?)?;
        }
        Command::Serve { interval_secs } => {
            let scheduler = build_scheduler(&config, clock)?;
            let secs = interval_secs.unwrap_or(config.scheduler.tick_interval_secs).max(1);
            info!(interval_secs = secs, store = %config.store.path.display(), "scheduler started");
            scheduler
                .run_every(Duration::from_secs(secs), shutdown_signal())
                .await;
        }
        Command::Status { status, limit } => {
            let store = open_store(&config, clock)?;
            let stats = store.stats().await?;
            let jobs = store.list(status.map(Into::into), limit).await?;
            ui::print_status(&stats, &jobs);
        }
        Command::Publish { image_url, caption } => {
            let publisher = build_publisher(&config, clock)?;
            let progress = Progress::start("Publishing...");
            let result = publisher.publish(&image_url, &caption).await;
            progress.finish();
            match result {
                Ok(published_id) => ui::print_published(&published_id),
                Err(err) => {
                    ui::print_failure(&err.to_string());
                    return Err(err.into());
                }
            }
        }
        Command::Profile => {
            let client = GraphClient::new(&config.graph)?;
            let profile = client.profile().await?;
            ui::print_profile(&profile)?;
        }
        Command::Purge => {
            let store = open_store(&config, clock)?;
            let purged = store.purge_expired().await?;
            info!(purged, "purge finished");
            println!("{purged}");
        }
    }

    Ok(())
}

fn open_store(config: &Config, clock: Arc<dyn Clock>) -> Result<Arc<dyn JobStore>> {
    let store = SqliteJobStore::open(&config.store.path, clock, config.queue_policy())
        .with_context(|| format!("failed to open job store {}", config.store.path.display()))?;
    Ok(Arc::new(store))
}

fn build_publisher(config: &Config, clock: Arc<dyn Clock>) -> Result<Arc<dyn Publisher>> {
    let client = GraphClient::new(&config.graph)?;
    let workflow = PublishWorkflow::new(
        Arc::new(client),
        config.http_retry.policy(),
        PollSettings {
            max_polls: config.polling.max_polls,
            interval: config.polling.interval(),
        },
        config.graph.caption_limit,
        clock,
    );
    Ok(Arc::new(workflow))
}

fn build_scheduler(config: &Config, clock: Arc<dyn Clock>) -> Result<Scheduler> {
    let store = open_store(config, Arc::clone(&clock))?;
    let publisher = build_publisher(config, clock)?;
    Ok(Scheduler::new(
        store,
        publisher,
        SchedulerSettings {
            batch_size: config.scheduler.batch_size,
            concurrency: config.scheduler.concurrency,
            lease: config.lease(),
        },
    ))
}

fn shutdown_signal() -> impl Future<Output = ()> {
    async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "cannot listen for Ctrl-C, running until killed");
            std::future::pending::<()>().await;
        }
    }
}

//! PriceWatch: price & stock tracking for arbitrary e-commerce URLs.
//! Layered extraction (site APIs, static HTML, rendered pages, LLM fallback),
//! durable check runs, and at-most-once webhook notifications.

use anyhow::{anyhow, Context, Result};
use dotenv::dotenv;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_cron_scheduler::{Job, JobScheduler};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pricewatch_backend::{
    api::{self, AppState},
    checker::CheckRunner,
    extract::{
        ai::{AiExtractor, OpenAiClient},
        rendered::{HttpRenderService, NoRenderer, RenderedFetcher},
        ExtractionPipeline,
    },
    models::Config,
    notifier::Notifier,
    storage::TrackerStore,
    sweep::DailySweep,
};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    init_tracing();

    let config = Config::from_env();
    let store = Arc::new(TrackerStore::new(&config.database_path)?);

    let renderer: Arc<dyn RenderedFetcher> =
        match (&config.render_service_url, config.enable_playwright) {
            (Some(endpoint), true) => {
                info!("🖥️  Rendered fetch enabled via {}", endpoint);
                Arc::new(HttpRenderService::new(endpoint.clone()))
            }
            _ => {
                info!("Rendered fetch disabled");
                Arc::new(NoRenderer)
            }
        };

    let ai = config.openai_api_key.clone().map(|api_key| {
        info!("🤖 AI fallback enabled (model {})", config.model_small);
        AiExtractor::new(
            Arc::new(OpenAiClient::new(api_key, config.openai_base_url.clone())),
            &config,
        )
    });
    if ai.is_none() {
        warn!("OPENAI_API_KEY not set; AI fallback disabled");
    }

    let pipeline = Arc::new(ExtractionPipeline::new(&config, renderer, ai));
    let notifier = Arc::new(Notifier::new(
        store.clone(),
        config.discord_webhook_url.clone(),
    ));
    let runner = Arc::new(CheckRunner::new(
        store.clone(),
        pipeline,
        notifier.clone(),
        config.clone(),
    ));
    let sweep = Arc::new(DailySweep::new(runner.clone(), store.clone()));

    if config.worker_run_on_boot {
        let boot_sweep = sweep.clone();
        tokio::spawn(async move {
            if let Err(e) = boot_sweep.run().await {
                error!("boot sweep failed: {:#}", e);
            }
        });
    }

    start_scheduler(&config.check_schedule_cron, sweep.clone()).await?;

    let state = Arc::new(AppState {
        store,
        runner,
        notifier,
        config: config.clone(),
        started: std::time::Instant::now(),
    });
    let app = api::router(state).layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

/// Wire the daily sweep onto the configured cron expression. The env var uses
/// classic 5-field cron; the scheduler wants a seconds field in front.
async fn start_scheduler(cron_expr: &str, sweep: Arc<DailySweep>) -> Result<()> {
    let schedule = format!("0 {}", cron_expr.trim());

    let scheduler = JobScheduler::new()
        .await
        .map_err(|e| anyhow!("scheduler init: {}", e))?;

    let job = Job::new_async(schedule.as_str(), move |_id, _lock| {
        let sweep = sweep.clone();
        Box::pin(async move {
            match sweep.run().await {
                Ok(summary) => info!(
                    "scheduled sweep finished: {} checked, {} ok",
                    summary.checked, summary.success
                ),
                Err(e) => error!("scheduled sweep failed: {:#}", e),
            }
        })
    })
    .map_err(|e| anyhow!("invalid CHECK_SCHEDULE_CRON '{}': {}", cron_expr, e))?;

    scheduler
        .add(job)
        .await
        .map_err(|e| anyhow!("scheduler add: {}", e))?;
    scheduler
        .start()
        .await
        .map_err(|e| anyhow!("scheduler start: {}", e))?;

    info!("⏰ Sweep scheduled at '{}'", cron_expr);
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "pricewatch_backend=info,pricewatch=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

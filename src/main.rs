// This is the entry point of the Matrix moderation bot.
//
// **Architecture Overview:**
// - `core/` = Business logic (platform-agnostic)
// - `infra/` = Implementations of core traits (stores, HTTP clients)
// - `matrix/` = Matrix-specific adapters (sync loop, event translation)
//
// This file's job is to:
// 1. Load configuration
// 2. Initialize services (dependency injection)
// 3. Log in and run the sync loop until Ctrl-C
// 4. Drain the cleanup queue on the way out

mod config;

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with half a dozen mod.rs files that all look the same.
#[path = "core/core_layer.rs"]
mod core;
#[path = "infra/infra_layer.rs"]
mod infra;
#[path = "matrix/matrix_layer.rs"]
mod matrix;

use crate::config::{BotConfig, StoreBackend};
use crate::core::moderation::{
    ActionGateway, ClassifierModels, CleanupQueue, ContentClassifier, EngineContext,
    FallbackFilter, ModerationService, ModerationState, Pacing, ProcessEpoch, RetryPolicy,
    VerdictStore,
};
use crate::infra::ai::OpenAiClient;
use crate::infra::matrix::MatrixHttpClient;
use crate::infra::moderation::{InMemoryVerdictStore, SqliteVerdictStore};
use crate::matrix::SyncDispatcher;
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;

/// How often expired verdicts are physically removed.
const PURGE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Upper bound on draining queued cleanups at shutdown.
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    let config = BotConfig::from_env().context("Invalid configuration")?;

    // Initialize logging so we can see what's happening
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .init();
    if let Some(level) = &config.unknown_log_level {
        tracing::warn!("Unknown LOG_LEVEL {:?}, using info", level);
    }

    // Everything stamped at or before this instant belongs to an earlier run.
    let epoch = ProcessEpoch::now();

    match config.store_backend {
        StoreBackend::Sqlite => {
            let path = config.data_dir.join("moderation.db");
            let store = SqliteVerdictStore::open(&path)
                .await
                .with_context(|| format!("Failed to open verdict store at {}", path.display()))?;
            tracing::info!("Using SQLite verdict store at {}", path.display());
            run(config, epoch, store).await
        }
        StoreBackend::Memory => {
            tracing::info!("Using in-memory verdict store; state is lost on restart");
            run(config, epoch, InMemoryVerdictStore::new()).await
        }
    }
}

async fn run<S: VerdictStore + 'static>(
    config: BotConfig,
    epoch: ProcessEpoch,
    store: S,
) -> anyhow::Result<()> {
    // ========================================================================
    // DEPENDENCY INJECTION
    // ========================================================================
    // This is the "composition root" where we wire everything together.

    let state = ModerationState::new(Arc::new(store));
    state
        .record_process_start(epoch)
        .await
        .context("Failed to record start time")?;

    let client = Arc::new(
        MatrixHttpClient::login(
            &config.matrix.homeserver_url,
            &config.matrix.username,
            &config.matrix.password,
        )
        .await
        .context("Failed to log in to Matrix")?,
    );

    let provider = OpenAiClient::new(config.openai.api_key.clone(), config.openai.api_url.clone())
        .context("Failed to create OpenAI client")?;
    let classifier = ContentClassifier::new(
        provider,
        ClassifierModels {
            text: config.openai.text_model.clone(),
            vision: config.openai.vision_model.clone(),
        },
        client.clone(),
        client.homeserver_url(),
        config.matrix.room_language.clone(),
    );

    if config.debug_mode {
        tracing::warn!("DEBUG_MODE is on: bans will be logged, not executed");
    }
    let actions = Arc::new(ActionGateway::new(
        Arc::clone(&client),
        RetryPolicy::default(),
        config.debug_mode,
    ));

    let pacing = Pacing::default();
    let (cleanup, cleanup_worker) =
        CleanupQueue::spawn(Arc::clone(&actions), state.clone(), pacing.inter_deletion_delay);

    let context = EngineContext {
        epoch,
        bot_user_id: client.user_id().to_string(),
        config: config.moderation.clone(),
        pacing,
    };
    let engine = Arc::new(ModerationService::new(
        context,
        state.clone(),
        classifier,
        actions,
        cleanup.clone(),
        FallbackFilter::new().context("Failed to compile fallback filter")?,
    ));

    let sweeper = spawn_sweeper(state);

    tracing::info!(room_id = %config.matrix.room_id, "Bot started successfully!");

    let dispatcher = SyncDispatcher::new(client, engine, config.matrix.room_id.clone());
    let result = dispatcher
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    sweeper.abort();
    drain_cleanup(&cleanup).await;
    drop(cleanup);
    cleanup_worker.abort();

    result.context("Sync loop stopped")
}

fn spawn_sweeper<S: VerdictStore + 'static>(
    state: ModerationState<S>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        // The first tick fires immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            match state.purge_expired().await {
                Ok(removed) if removed > 0 => {
                    tracing::debug!("Purged {} expired verdicts", removed)
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Failed to purge expired verdicts: {}", e),
            }
        }
    })
}

async fn drain_cleanup(cleanup: &CleanupQueue) {
    tracing::info!("Waiting for queued cleanups to finish");
    if tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, cleanup.flush())
        .await
        .is_err()
    {
        tracing::warn!("Gave up waiting for cleanups after {:?}", SHUTDOWN_FLUSH_TIMEOUT);
    }
}

use std::{io::Write, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio_util::sync::CancellationToken;
use tradutor::{
    job::{JobStatus, TranslationRequest},
    polling::{PollEvent, PollingClient},
    supervisor::ConnectionSupervisor,
    worker::Worker,
};
use tradutor_server::{
    cli::{Cli, Commands, TranslateArgs},
    config::Settings,
    create_router,
    gemini::GeminiTranslator,
    http_client::ApiClient,
    telemetry::{init_tracing, join_background},
    AppState,
};
use tradutor_sqlx::{PgBroker, PgJobStore};

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_env().context("Invalid configuration")?;
    init_tracing(settings.log_format);

    match cli.command {
        Commands::Api => run_api(settings).await,
        Commands::Worker => run_worker(settings).await,
        Commands::Translate(args) => translate(settings, args).await,
    }
}

/// Pools are opened lazily: reaching the database, and migrating it, happens in
/// [`PgBroker`]'s connect, under the queue's reconnect policy.
fn pools(settings: &Settings) -> anyhow::Result<(PgPool, PgPool)> {
    let options = || {
        PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(ACQUIRE_TIMEOUT)
    };
    let pool = options()
        .connect_lazy(&settings.database_url)
        .context("Invalid DATABASE_URL")?;
    let queue_pool = if settings.queue_database_url == settings.database_url {
        pool.clone()
    } else {
        options()
            .connect_lazy(&settings.queue_database_url)
            .context("Invalid QUEUE_DATABASE_URL")?
    };
    Ok((pool, queue_pool))
}

fn supervisor(
    settings: &Settings,
    pool: &PgPool,
    queue_pool: PgPool,
) -> Arc<ConnectionSupervisor<PgBroker>> {
    let migrations = if settings.queue_database_url == settings.database_url {
        vec![pool.clone()]
    } else {
        vec![pool.clone(), queue_pool.clone()]
    };
    let broker = PgBroker::new(queue_pool, &settings.queue_name)
        .with_lease(settings.queue_lease)
        .with_migrations(migrations);
    Arc::new(ConnectionSupervisor::new(broker, settings.reconnect_policy()))
}

fn shutdown_on_ctrl_c(cancellation_token: CancellationToken) {
    tokio::spawn(async move {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(?error, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Shutdown signal received");
        cancellation_token.cancel();
    });
}

async fn run_api(settings: Settings) -> anyhow::Result<()> {
    let (pool, queue_pool) = pools(&settings)?;
    let supervisor = supervisor(&settings, &pool, queue_pool);
    if let Err(error) = supervisor.connect().await {
        // Submissions fail with 500 until the monitor reconnects.
        tracing::error!(?error, "Queue unavailable at startup");
    }

    let cancellation_token = CancellationToken::new();
    shutdown_on_ctrl_c(cancellation_token.clone());
    let monitor = supervisor.spawn_monitor(cancellation_token.clone());

    let app = create_router(AppState::new(
        Arc::new(PgJobStore::from(pool)),
        supervisor.clone(),
    ));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", settings.port))
        .await
        .with_context(|| format!("Failed to bind port {}", settings.port))?;
    tracing::info!(port = settings.port, "Translation API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancellation_token.clone().cancelled_owned())
        .await
        .context("HTTP server failed")?;

    cancellation_token.cancel();
    join_background("queue connection monitor", monitor).await;
    supervisor.shutdown().await;
    Ok(())
}

async fn run_worker(settings: Settings) -> anyhow::Result<()> {
    let translator = GeminiTranslator::new(
        settings.require_google_api_key()?.to_owned(),
        settings.gemini_model.clone(),
    );
    let (pool, queue_pool) = pools(&settings)?;

    let cancellation_token = CancellationToken::new();
    shutdown_on_ctrl_c(cancellation_token.clone());

    tracing::info!(queue = %settings.queue_name, model = %settings.gemini_model, "Starting translation worker");
    Worker::new(
        supervisor(&settings, &pool, queue_pool),
        Arc::new(PgJobStore::from(pool)),
        translator,
    )
    .with_translation_timeout(settings.translation_timeout)
    .run(cancellation_token)
    .await
    .context("Translation worker stopped")
}

async fn translate(settings: Settings, args: TranslateArgs) -> anyhow::Result<()> {
    let client = ApiClient::new(args.api_url.unwrap_or(settings.api_url));
    let id = client
        .submit(TranslationRequest::new(
            args.text,
            args.source_language,
            args.target_language,
        ))
        .await
        .context("Failed to submit translation")?;
    println!("Submitted request {id}");

    let view = PollingClient::new(client)
        .wait_with_progress(id, |event| {
            match event {
                PollEvent::NotFound { attempt } => eprint!("\r[{attempt}] waiting for the request"),
                PollEvent::Observed { attempt, view } => eprint!("\r[{attempt}] {}", view.status),
            }
            let _ = std::io::stderr().flush();
        })
        .await;
    eprintln!();

    let view = view.context("Failed to get the translation")?;
    match view.status {
        JobStatus::Completed => {
            println!("{}", view.translated_text.unwrap_or_default());
            Ok(())
        }
        _ => anyhow::bail!(
            "Translation failed: {}",
            view.failure_reason.as_deref().unwrap_or("unknown error")
        ),
    }
}

use std::sync::Arc;

use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use guild_relay::api;
use guild_relay::chat::discord::DiscordRest;
use guild_relay::chat::ChatBoundary;
use guild_relay::config::Config;
use guild_relay::duel::DuelManager;
use guild_relay::gateway::{Backend, HttpBackend};
use guild_relay::identity::{GlyphRegistry, NicknameReconciler};
use guild_relay::ledger::ActivityLedger;
use guild_relay::metrics;
use guild_relay::presence::PresenceScheduler;
use guild_relay::relay::Relay;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Configuration error: {e}");
            std::process::exit(1);
        }
    };
    metrics::register_metrics();

    let chat: Arc<dyn ChatBoundary> = match DiscordRest::connect(
        &config.chat_api_base,
        &config.bot_token,
        config.backend_timeout,
    )
    .await
    {
        Ok(c) => Arc::new(c),
        Err(e) => {
            tracing::error!("Could not connect to the chat platform: {e}");
            std::process::exit(1);
        }
    };
    let backend: Arc<dyn Backend> = match HttpBackend::new(
        &config.scoring_url,
        &config.duel_url,
        config.backend_timeout,
    ) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            tracing::error!("Could not build the backend client: {e}");
            std::process::exit(1);
        }
    };

    let ledger = ActivityLedger::new();
    let presence = Arc::new(PresenceScheduler::new(
        ledger.clone(),
        backend.clone(),
        chat.clone(),
        config.presence_settings(),
    ));
    let duels = DuelManager::new(chat.clone(), backend.clone(), config.duel_settings());
    let identity = NicknameReconciler::new(backend.clone(), chat.clone(), GlyphRegistry::builtin());
    let relay = Arc::new(Relay::new(
        ledger,
        backend,
        chat,
        duels.clone(),
        identity,
        presence.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let presence_task = presence.spawn(shutdown_rx.clone());
    let sweeper_task = duels.spawn_sweeper(shutdown_rx);

    let app = api::router(relay)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {addr}: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!("Guild relay listening on {addr}");
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await
    {
        tracing::error!("Server error: {e}");
    }

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(presence_task, sweeper_task);
    tracing::info!("Guild relay stopped");
}

//! Concierge Server
//!
//! Customer-support chat orchestration: AI-fronted rooms, keyword and
//! AI-triggered handoff to human agents, and real-time delivery over
//! WebSocket.

mod ai_chat;
mod clock;
mod logging;
mod paths;
mod persistence;
mod presence;
mod rating;
mod room;
mod room_actor;
mod room_command;
mod router;
mod scheduler;
mod state;
mod transfer;
mod transition;
mod websocket;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use concierge_responder::{AiResponder, HttpResponder, StaticResponder, FALLBACK_TEXT};

use crate::persistence::PersistenceWriter;
use crate::state::RoomRegistry;

#[derive(Parser, Debug)]
#[command(name = "concierge", about = "Concierge support-chat orchestration server")]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "CONCIERGE_BIND", default_value = "127.0.0.1:4000")]
    bind: SocketAddr,

    /// Data directory (database, logs)
    #[arg(long, env = "CONCIERGE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// AI model service endpoint. Without it every AI reply is the
    /// fixed fallback text.
    #[arg(long, env = "CONCIERGE_AI_URL")]
    ai_url: Option<String>,

    /// Per-request AI timeout in seconds
    #[arg(long, env = "CONCIERGE_AI_TIMEOUT_SECS", default_value_t = 8)]
    ai_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    paths::init_data_dir(cli.data_dir.as_deref());
    paths::ensure_dirs()?;
    let logging = logging::init_logging()?;
    info!(
        component = "main",
        event = "server.starting",
        run_id = %logging.run_id,
        "Concierge server starting"
    );

    persistence::init_schema_at_data_dir().await?;

    // Persistence writer
    let (persist_tx, persist_rx) = persistence::create_persistence_channel();
    tokio::spawn(PersistenceWriter::new(persist_rx).run());

    // AI responder adapter
    let responder: Arc<dyn AiResponder> = match cli.ai_url {
        Some(url) => {
            info!(
                component = "main",
                event = "responder.http",
                endpoint = %url,
                "Using HTTP AI responder"
            );
            Arc::new(HttpResponder::new(
                url,
                Duration::from_secs(cli.ai_timeout_secs),
            ))
        }
        None => {
            warn!(
                component = "main",
                event = "responder.fallback_only",
                "No AI endpoint configured; every AI reply will be the fallback text"
            );
            Arc::new(StaticResponder::new(FALLBACK_TEXT))
        }
    };

    let registry = Arc::new(RoomRegistry::new(persist_tx, paths::db_path(), responder));
    restore_open_rooms(&registry).await?;

    // Build router
    let app = Router::new()
        .route("/ws", get(websocket::ws_handler))
        .route("/health", get(health_handler))
        .route("/ai-chat/messages", post(ai_chat::ai_chat_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(registry);

    info!(
        component = "main",
        event = "server.listening",
        bind = %cli.bind,
        "Concierge server listening"
    );

    let listener = tokio::net::TcpListener::bind(cli.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Bring non-closed rooms back to life after a restart. A half-finished
/// transfer restores as a usable waiting human room; its AI room, if it
/// was never retired, restores too and the user can trigger the
/// handoff again.
async fn restore_open_rooms(registry: &Arc<RoomRegistry>) -> anyhow::Result<()> {
    let rooms = persistence::load_open_rooms(registry.db_path()).await?;
    let count = rooms.len();

    for room in rooms {
        let messages = persistence::load_messages(registry.db_path(), room.id.clone()).await?;
        registry.restore(room, messages);
    }

    if count > 0 {
        info!(
            component = "main",
            event = "rooms.restored",
            rooms = count,
            "Restored open rooms from database"
        );
    }
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::State,
    routing::{delete, get, post},
    Router,
};
use relay::{MembershipRegistry, RelayContext};
use storage::ChatStore;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

mod auth;
mod config;
mod http;
mod ws;

use auth::TokenVerifier;
use config::{load_settings, prepare_database_url};

#[derive(Clone)]
struct AppState {
    relay: RelayContext,
    verifier: TokenVerifier,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let store = ChatStore::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify that the parent directory exists and is writable"
        );
        error
    })?;

    let state = AppState {
        relay: RelayContext {
            store,
            registry: MembershipRegistry::new(),
        },
        verifier: TokenVerifier::new(settings.jwt_secret.as_bytes()),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "relay listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/messages", post(http::create_message))
        .route("/v1/messages/:chat_id", delete(http::delete_message))
        .route("/v1/conversations/:peer", get(http::list_conversation))
        .route("/ws", get(ws::ws_handler))
        .fallback(http::not_found)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, http::HttpError> {
    state
        .relay
        .store
        .health_check()
        .await
        .map_err(http::internal)?;
    Ok("ok")
}

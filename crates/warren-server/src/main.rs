use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{get, post, put},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use warren_api::middleware::require_auth;
use warren_api::{auth, messages, users, AppState, AppStateInner};
use warren_gateway::dispatcher::Dispatcher;
use warren_gateway::session;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warren=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let secret =
        std::env::var("WARREN_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("WARREN_DB_PATH").unwrap_or_else(|_| "warren.db".into());
    let host = std::env::var("WARREN_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("WARREN_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init database
    let db = Arc::new(warren_db::Database::open(&PathBuf::from(&db_path))?);

    // Shared state
    let dispatcher = Dispatcher::new();
    let state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        dispatcher: dispatcher.clone(),
        secret,
    });

    // Routes
    let public_routes = Router::new()
        .route("/api/users", post(auth::create_user))
        .route("/api/tokens", post(auth::issue_token))
        .route("/api/reset-password", post(auth::reset_password))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/api/tokens", axum::routing::delete(auth::revoke_token))
        .route("/api/users", get(users::list_users))
        .route(
            "/api/users/{username}",
            get(users::get_user).put(users::update_user),
        )
        .route(
            "/api/users/{username}/picture",
            axum::routing::delete(users::delete_picture),
        )
        .route("/api/users/{username}/pov", put(users::upsert_pov))
        .route(
            "/api/messages/{username}",
            get(messages::get_conversation).post(messages::send_message),
        )
        .route(
            "/api/messages/by-id/{id}",
            put(messages::edit_message).delete(messages::delete_message),
        )
        .route("/api/messages/by-id/{id}/status", put(messages::set_status))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state.clone());

    let ws_route = Router::new()
        .route("/chat", get(ws_upgrade))
        .with_state(state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Warren server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let db = state.db.clone();
    let dispatcher = state.dispatcher.clone();
    ws.on_upgrade(move |socket| session::handle_socket(socket, db, dispatcher))
}

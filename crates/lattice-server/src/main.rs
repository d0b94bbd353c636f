use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{delete, get, patch, post},
};
use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use lattice_api::auth::{self, AppState, AppStateInner};
use lattice_api::middleware::require_auth;
use lattice_api::{conversations, groups};
use lattice_gateway::{ConnectionRegistry, GatewayContext, connection};
use lattice_messaging::{DirectMessaging, GroupMessaging, LogEmitter, NotificationEmitter};
use lattice_types::api::Claims;

#[derive(Clone)]
struct ServerState {
    gateway: GatewayContext,
    jwt_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lattice=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("LATTICE_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("LATTICE_DB_PATH").unwrap_or_else(|_| "lattice.db".into());
    let host = std::env::var("LATTICE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("LATTICE_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init database and services
    let db = Arc::new(lattice_db::Database::open(&PathBuf::from(&db_path))?);
    let emitter: Arc<dyn NotificationEmitter> = Arc::new(LogEmitter);
    let registry = ConnectionRegistry::new();
    let direct = DirectMessaging::new(db.clone(), emitter.clone());
    let group_messaging = GroupMessaging::new(db.clone(), emitter);

    let gateway = GatewayContext {
        registry: registry.clone(),
        direct: direct.clone(),
        groups: group_messaging.clone(),
    };

    let app_state: AppState = Arc::new(AppStateInner {
        db,
        jwt_secret: jwt_secret.clone(),
        registry,
        direct,
        groups: group_messaging,
    });

    // Routes
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/conversations", post(conversations::create_conversation))
        .route("/conversations", get(conversations::list_conversations))
        .route("/conversations/unread-count", get(conversations::unread_count))
        .route("/conversations/{conversation_id}/messages", get(conversations::list_messages))
        .route("/conversations/{conversation_id}/messages", post(conversations::send_message))
        .route("/messages/{message_id}/read", post(conversations::mark_read))
        .route("/groups/{group_id}/messages", get(groups::list_messages))
        .route("/groups/{group_id}/messages", post(groups::send_message))
        .route("/groups/{group_id}/pins", get(groups::list_pinned))
        .route("/groups/{group_id}/messages/{message_id}", patch(groups::edit_message))
        .route("/groups/{group_id}/messages/{message_id}", delete(groups::delete_message))
        .route("/groups/{group_id}/messages/{message_id}/reactions", post(groups::add_reaction))
        .route(
            "/groups/{group_id}/messages/{message_id}/reactions/{emoji}",
            delete(groups::remove_reaction),
        )
        .route("/groups/{group_id}/messages/{message_id}/pin", post(groups::pin_message))
        .route("/groups/{group_id}/messages/{message_id}/pin", delete(groups::unpin_message))
        .route("/groups/{group_id}/messages/{message_id}/replies", post(groups::reply_to_thread))
        .route("/groups/{group_id}/messages/{message_id}/replies", get(groups::list_thread))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_auth))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(ServerState {
            gateway,
            jwt_secret,
        });

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Lattice messaging server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Deserialize)]
struct WsQuery {
    token: String,
}

/// Authenticates the handshake *before* the WebSocket upgrade. A missing or
/// invalid token is rejected with 401; the connection is never silently
/// accepted and never reaches the registry.
async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token_data = match decode::<Claims>(
        &query.token,
        &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
        &Validation::default(),
    ) {
        Ok(data) => data,
        Err(e) => {
            warn!("Gateway handshake rejected: {}", e);
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    let Claims { sub, username, .. } = token_data.claims;
    ws.on_upgrade(move |socket| connection::handle_connection(socket, state.gateway, sub, username))
        .into_response()
}

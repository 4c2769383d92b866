mod handlers;
pub mod middleware;

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, FromRef},
    routing::{delete, get, post, put},
    Router,
};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, trace::TraceLayer};

use crate::auth::Authenticator;
use crate::collab::CollabHub;
use crate::config::ServerConfig;
use crate::db::Database;

/// Shared state handed to every handler.
///
/// Handlers extract only the part they need, e.g. `State<Database>`.
#[derive(Clone, FromRef)]
pub struct AppState {
    pub db: Database,
    pub hub: CollabHub,
    pub auth: Authenticator,
    pub config: Arc<ServerConfig>,
    pub origin: middleware::AllowedOrigin,
}

impl AppState {
    pub fn new(db: Database, config: ServerConfig) -> Self {
        let hub = CollabHub::new(db.clone(), config.realtime.clone());
        let auth = Authenticator::new(&config.auth);
        let origin = middleware::AllowedOrigin::from_client_url(&config.client_url);
        Self {
            db,
            hub,
            auth,
            config: Arc::new(config),
            origin,
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    let config = state.config.clone();
    let origin = state.origin.clone();

    let mut router = Router::new()
        // Health
        .route("/health", get(handlers::health))
        // Auth
        .route("/api/auth/register", post(handlers::auth::register))
        .route("/api/auth/login", post(handlers::auth::login))
        .route("/api/auth/me", get(handlers::auth::me))
        // Documents
        .route("/api/documents", get(handlers::documents::list_documents))
        .route("/api/documents", post(handlers::documents::create_document))
        .route("/api/documents/{id}", get(handlers::documents::get_document))
        .route("/api/documents/{id}", put(handlers::documents::update_document))
        .route("/api/documents/{id}", delete(handlers::documents::delete_document))
        .route("/api/documents/{id}/collaborators", get(handlers::documents::list_collaborators))
        .route("/api/documents/{id}/collaborators", post(handlers::documents::add_collaborator))
        .route(
            "/api/documents/{id}/collaborators/{user_id}",
            delete(handlers::documents::remove_collaborator),
        )
        .route("/api/documents/{id}/participants", get(handlers::documents::list_participants))
        // Versions
        .route("/api/versions/document/{document_id}", get(handlers::versions::list_versions))
        .route("/api/versions/document/{document_id}", post(handlers::versions::create_version))
        .route("/api/versions/{id}", get(handlers::versions::get_version))
        .route("/api/versions/{id}/restore", post(handlers::versions::restore_version))
        // Realtime
        .route("/ws", get(handlers::realtime::upgrade))
        .fallback(handlers::not_found)
        .method_not_allowed_fallback(handlers::not_found);

    if config.environment.is_development() {
        router = router.layer(axum::middleware::from_fn(middleware::log_requests));
    }

    // Outermost first.
    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(middleware::security_headers))
                .layer(CompressionLayer::new())
                .layer(middleware::cors_layer(&origin))
                .layer(DefaultBodyLimit::max(config.body_limit)),
        )
        .with_state(state)
}

/// Open the configured store and bring its schema up to date.
pub fn open_store(config: &ServerConfig) -> anyhow::Result<Database> {
    let db = match &config.database_path {
        Some(path) => Database::open(path.clone())?,
        None => Database::open_default()?,
    };
    db.migrate()?;
    Ok(db)
}

/// Open the store and run the server until it fails.
pub async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let db = open_store(&config)?;

    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    serve_with(listener, AppState::new(db, config)).await
}

/// Serve on an already bound listener.
///
/// If the server or the background flush task stops, live sessions are
/// written back and the error is returned.
pub async fn serve_with(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    let config = state.config.clone();
    let hub = state.hub.clone();
    let app = create_router(state);

    log_banner(&config, listener.local_addr()?);
    let mut flusher = tokio::spawn(hub.clone().run_flusher());

    let result = tokio::select! {
        served = axum::serve(listener, app).into_future() => {
            served.context("HTTP server failed")
        }
        joined = &mut flusher => match joined {
            Ok(()) => Err(anyhow::anyhow!("Document flush task stopped")),
            Err(e) => Err(anyhow::Error::from(e).context("Document flush task failed")),
        },
    };

    flusher.abort();
    if let Err(e) = &result {
        tracing::error!("Server error: {:#}", e);
        hub.shutdown().await;
    }
    result
}

fn log_banner(config: &ServerConfig, addr: SocketAddr) {
    let rule = "=".repeat(50);
    tracing::info!("{}", rule);
    tracing::info!("docsync server running");
    tracing::info!("Environment: {}", config.environment.as_str());
    tracing::info!("Port: {}", addr.port());
    tracing::info!("URL: http://localhost:{}", addr.port());
    tracing::info!("Realtime channel initialized");
    tracing::info!("{}", rule);
}

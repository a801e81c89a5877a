use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::middleware::{require_bearer, AuthState};
use crate::auth::rate_limit::RateLimiter;
use crate::auth::token_store::TokenStore;
use crate::auth::user_store::UserStore;
use crate::auth::watcher::FileWatcher;
use crate::auth::RequestContext;
use crate::config::AppConfig;
use crate::db::{AccessChecker, ConnectionManager, SavedConnectionRegistry};
use crate::mcp::tools::{
    DatabaseCatalogResource, ListConnectionsTool, LoginTool, LogoutTool, RegisterConnectionTool,
    UnregisterConnectionTool, UpdateConnectionTool,
};
use crate::mcp::Dispatcher;

const SERVER_NAME: &str = env!("CARGO_PKG_NAME");
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Process-wide state: the two credential stores, the rate limiter, the
/// pool manager, and the dispatcher wired to the built-in providers.
pub struct AppState {
    pub config: AppConfig,
    pub tokens: Arc<TokenStore>,
    pub users: Arc<UserStore>,
    pub limiter: Arc<RateLimiter>,
    pub manager: Arc<ConnectionManager>,
    pub connections: Arc<SavedConnectionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
}

/// Open the stores and wire up the dispatcher.
pub fn build_state(config: AppConfig) -> Result<Arc<AppState>, Box<dyn std::error::Error>> {
    let tokens = Arc::new(TokenStore::open(&config.auth.token_file)?);
    let users = Arc::new(UserStore::open(&config.auth.user_file)?);
    let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
    let manager = Arc::new(ConnectionManager::new(config.pool.clone()));
    let connections = Arc::new(SavedConnectionRegistry::new());
    let access = Arc::new(AccessChecker::new(config.auth.enabled, tokens.clone()));

    let mut dispatcher = Dispatcher::new(access.clone(), config.databases.clone());
    dispatcher.register_tool(Arc::new(LoginTool::new(
        users.clone(),
        limiter.clone(),
        manager.clone(),
        &config.auth,
    )));
    dispatcher.register_tool(Arc::new(LogoutTool::new(users.clone(), manager.clone())));
    dispatcher.register_tool(Arc::new(RegisterConnectionTool::new(connections.clone())));
    dispatcher.register_tool(Arc::new(UpdateConnectionTool::new(connections.clone())));
    dispatcher.register_tool(Arc::new(UnregisterConnectionTool::new(connections.clone())));
    dispatcher.register_tool(Arc::new(ListConnectionsTool::new(connections.clone())));
    dispatcher.register_resource(Arc::new(DatabaseCatalogResource::new(
        access,
        config.databases.clone(),
    )));

    Ok(Arc::new(AppState {
        config,
        tokens,
        users,
        limiter,
        manager,
        connections,
        dispatcher: Arc::new(dispatcher),
    }))
}

/// Assemble the HTTP router with the auth middleware layered over every
/// route; public-path bypass happens inside the middleware.
pub fn build_router(state: Arc<AppState>) -> Router {
    let auth_state = Arc::new(AuthState {
        config: state.config.auth.clone(),
        tokens: state.tokens.clone(),
        users: state.users.clone(),
        limiter: state.limiter.clone(),
    });

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([axum::http::header::CONTENT_TYPE, AUTHORIZATION]);

    Router::new()
        .route("/mcp/v1", post(mcp_handler))
        .route("/health", get(health))
        .route("/api/user/info", get(user_info))
        .layer(middleware::from_fn_with_state(auth_state, require_bearer))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// POST /mcp/v1: JSON-RPC 2.0. Always HTTP 200 once past the middleware;
/// notifications produce an empty body.
async fn mcp_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let ctx = request
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_default();
    let body = match axum::body::to_bytes(
        request.into_body(),
        crate::auth::middleware::MAX_PEEK_BYTES,
    )
    .await
    {
        Ok(bytes) => bytes,
        Err(_) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };
    match state.dispatcher.handle(&ctx, &body).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::OK.into_response(),
    }
}

/// GET /health, the public liveness probe.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "server": SERVER_NAME,
        "version": SERVER_VERSION,
    }))
}

/// GET /api/user/info, public; reports whether auth is required and, when
/// a valid session token is presented, who it belongs to.
async fn user_info(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Json<serde_json::Value> {
    let username = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .and_then(|token| state.users.validate_session_token(token.trim()).ok());
    Json(json!({
        "auth_required": state.config.auth.enabled,
        "authenticated": username.is_some(),
        "username": username,
    }))
}

/// Hot-reload watcher for the token file: reload the store, then close
/// pools for any hashes that disappeared.
fn watch_token_file(state: &Arc<AppState>) -> Option<FileWatcher> {
    let tokens = state.tokens.clone();
    let manager = state.manager.clone();
    let path = state.config.auth.token_file.clone();
    match FileWatcher::watch(
        &path,
        Box::new(move || {
            let removed = tokens.reload()?;
            tracing::info!(tokens = tokens.len(), "token store reloaded");
            if !removed.is_empty() {
                let manager = manager.clone();
                tokio::spawn(async move {
                    for hash in removed {
                        manager.purge_by_hash(&hash).await;
                    }
                });
            }
            Ok(())
        }),
    ) {
        Ok(w) => Some(w),
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "token file watch unavailable");
            None
        }
    }
}

/// Hot-reload watcher for the user file: sessions survive for usernames
/// that still exist; dropped sessions lose their pools.
fn watch_user_file(state: &Arc<AppState>) -> Option<FileWatcher> {
    let users = state.users.clone();
    let manager = state.manager.clone();
    let path = state.config.auth.user_file.clone();
    match FileWatcher::watch(
        &path,
        Box::new(move || {
            let dropped = users.reload()?;
            tracing::info!(users = users.len(), "user store reloaded");
            if !dropped.is_empty() {
                let manager = manager.clone();
                tokio::spawn(async move {
                    for hash in dropped {
                        manager.purge_by_hash(&hash).await;
                    }
                });
            }
            Ok(())
        }),
    ) {
        Ok(w) => Some(w),
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "user file watch unavailable");
            None
        }
    }
}

/// Periodic sweep: evict idle pools and purge expired service tokens
/// along with their pools.
async fn sweeper_loop(state: Arc<AppState>) {
    let interval = Duration::from_secs(state.config.pool.sweep_interval_secs.max(1));
    let idle = Duration::from_secs(state.config.pool.idle_timeout_secs);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let idle_purged = state.manager.purge_idle(idle).await;
        if idle_purged > 0 {
            tracing::debug!(count = idle_purged, "closed idle connection pools");
        }
        match state.tokens.cleanup_expired() {
            Ok((count, hashes)) => {
                if count > 0 {
                    tracing::info!(count, "removed expired service tokens");
                    for hash in hashes {
                        state.manager.purge_by_hash(&hash).await;
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "expired-token cleanup failed"),
        }
    }
}

/// Run the server until SIGINT/SIGTERM.
pub async fn serve(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let state = build_state(config)?;

    let _token_watcher = if state.config.auth.enabled {
        watch_token_file(&state)
    } else {
        None
    };
    let _user_watcher = if state.config.auth.enabled {
        watch_user_file(&state)
    } else {
        None
    };

    let sweeper = tokio::spawn(sweeper_loop(state.clone()));

    let app = build_router(state.clone())
        .into_make_service_with_connect_info::<SocketAddr>();
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);

    if state.config.server.tls.enabled {
        let tls = &state.config.server.tls;
        let mut cert = std::fs::read(tls.cert_file.as_ref().expect("validated at startup"))?;
        if let Some(chain) = &tls.chain_file {
            cert.extend(std::fs::read(chain)?);
        }
        let key = std::fs::read(tls.key_file.as_ref().expect("validated at startup"))?;
        // rustls negotiates TLS 1.2 as the floor.
        let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem(cert, key).await?;

        let socket_addr: SocketAddr = addr.parse()?;
        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
        });

        tracing::info!(addr = %addr, tls = true, "listening");
        axum_server::bind_rustls(socket_addr, rustls_config)
            .handle(handle)
            .serve(app)
            .await?;
    } else {
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, tls = false, "listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    }

    sweeper.abort();
    state.manager.purge_all().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }

    tracing::info!("shutting down...");
}

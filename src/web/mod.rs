//! Web server module

mod auth;
mod display;
mod middleware;
mod routes;

use anyhow::{Context, Result};
use axum::{
    extract::{Request, State},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};
use tower::ServiceExt;
use tower_http::{
    cors::{Any, CorsLayer},
    services::{ServeDir, ServeFile},
};
use tracing::info;

use crate::config::Config;
use crate::service::TrafficService;
use auth::JwtKeys;
use middleware::AuthLayer;

pub struct AppState {
    pub service: TrafficService,
    pub keys: Arc<JwtKeys>,
    pub static_dir: PathBuf,
}

/// Single-page frontend: existing files as is, every other path gets index.html
async fn frontend(State(state): State<Arc<AppState>>, request: Request) -> Response {
    if request.uri().path().starts_with("/api") {
        return routes::api_not_found().await;
    }
    let dir: &Path = &state.static_dir;
    let serve = ServeDir::new(dir).not_found_service(ServeFile::new(dir.join("index.html")));
    match serve.oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(never) => match never {},
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Everything under /api/db requires a bearer token
    let dashboard = Router::new()
        .route("/services", get(routes::list_services))
        .route(
            "/services/:id",
            get(routes::service_detail).delete(routes::delete_service),
        )
        .route("/services/:id/custom-name", put(routes::rename_service))
        .route("/traffic/summary", get(routes::traffic_summary))
        .route("/traffic/history", get(routes::traffic_history))
        .route("/raw-requests", get(routes::list_raw_requests))
        .route("/raw-requests/:id", get(routes::raw_request_detail))
        .route("/traffic/weekly/:service_id", get(routes::weekly_traffic))
        .route("/traffic/monthly/:service_id", get(routes::monthly_traffic))
        .route("/daily-summary", post(routes::trigger_rollover))
        .route("/port-detail/:service_id/:tag", get(routes::port_detail))
        .route("/port-detail/:service_id/:tag/export", get(routes::export_port))
        .route("/user-detail/:service_id/:email", get(routes::user_detail))
        .route("/user-detail/:service_id/:email/export", get(routes::export_user))
        .route("/inbound/:service_id/:tag/custom-name", put(routes::rename_inbound))
        .route("/client/:service_id/:email/custom-name", put(routes::rename_client))
        .layer(AuthLayer::new(state.keys.clone()));

    Router::new()
        .route("/health", get(routes::health))
        .route("/api/health", get(routes::health))
        .route("/api/auth/login", post(routes::login))
        .route("/api/auth/verify", get(routes::verify))
        .route("/api/traffic", post(routes::ingest))
        .nest("/api/db", dashboard)
        .fallback(frontend)
        .layer(cors)
        .with_state(state)
}

pub async fn start_server(config: &Config, service: TrafficService) -> Result<()> {
    let state = Arc::new(AppState {
        service,
        keys: Arc::new(JwtKeys::new(&config.auth)),
        static_dir: PathBuf::from(&config.server.static_dir),
    });
    let app = create_router(state).into_make_service_with_connect_info::<SocketAddr>();

    let bind = format!("{}:{}", config.server.host, config.server.port);
    let addr = tokio::net::lookup_host(&bind)
        .await?
        .next()
        .with_context(|| format!("cannot resolve listen address {}", bind))?;

    if config.tls_enabled() {
        let tls = RustlsConfig::from_pem_file(&config.server.tls_cert, &config.server.tls_key)
            .await
            .context("failed to load TLS certificate")?;
        info!("Web server starting on https://{}", addr);
        axum_server::bind_rustls(addr, tls).serve(app).await?;
    } else {
        info!("Web server starting on http://{}", addr);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
    }

    Ok(())
}

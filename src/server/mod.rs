pub mod handlers;
pub mod items;
pub mod state;
pub mod url_validation;

use crate::{config::Config, error::Result};
use axum::{
    Router,
    extract::Request,
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use state::AppState;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

/// Response header carrying the crate version
pub const VERSION_HEADER: &str = "x-rangecache-version";

/// Build the router with fresh state for `config`
pub async fn build_router(config: Config) -> Result<Router> {
    let state = AppState::new(config)?;
    Ok(router(state))
}

/// Build the router around existing state
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    Router::new()
        .route("/", get(handlers::health::health_check))
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::health::metrics))
        .route(
            "/media",
            get(handlers::media::serve_media).head(handlers::media::serve_media),
        )
        .route("/cache/clean", post(handlers::cache::clean))
        .route("/cache/clean-all", post(handlers::cache::clean_all))
        .route(
            "/cache/config",
            get(handlers::cache::get_config).put(handlers::cache::update_config),
        )
        .route("/cache/items", get(handlers::cache::list_items))
        .layer(middleware::from_fn(version_header))
        .layer(cors)
        .with_state(state)
}

async fn version_header(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        VERSION_HEADER,
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    response
}

/// Expire idle player items and run periodic cache sweeps
fn spawn_maintenance(state: &AppState) {
    let items = state.items.clone();
    let ttl = Duration::from_secs(state.config.item_ttl_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ttl);
        ticker.tick().await; // first tick is immediate
        loop {
            ticker.tick().await;
            let removed = items.cleanup_expired();
            if removed > 0 {
                debug!("Expired {} idle player items", removed);
            }
            crate::metrics::set_active_items(items.len());
        }
    });

    if state.config.clean_interval_secs == 0 {
        info!("Periodic cache sweeps disabled");
        return;
    }

    let cache = state.cache.clone();
    let every = Duration::from_secs(state.config.clean_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match cache.clean_cache().await {
                Ok(report) if report.deleted_files > 0 => info!(
                    "Periodic sweep removed {} files ({} bytes)",
                    report.deleted_files, report.freed_bytes
                ),
                Ok(_) => {}
                Err(_) => warn!("Periodic sweep did not complete"),
            }
        }
    });
}

/// Start the Axum HTTP server
pub async fn start(config: Config) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let addr = format!("0.0.0.0:{}", config.port);
    let base_url = config.base_url.clone();

    let state = AppState::new(config)?;
    spawn_maintenance(&state);
    let app = router(state);

    // Bind TCP listener
    let listener = match tokio::net::TcpListener::bind(addr.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            return Err(e.into());
        }
    };

    info!("Caching proxy listening on http://{}", addr);
    info!("Play through {}/media?url=<encoded media url>", base_url);

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}

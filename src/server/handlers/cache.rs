//! Cache administration endpoints.

use crate::{
    cache::{manager::SweepReport, settings::CacheConfigUpdate, CacheConfiguration},
    error::{CacheError, Result},
    metrics,
    server::{items::ItemSummary, state::AppState},
};
use axum::{Json, extract::State};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::info;

async fn await_sweep(receiver: oneshot::Receiver<SweepReport>) -> Result<SweepReport> {
    receiver
        .await
        .map_err(|_| CacheError::Internal("cache sweep failed; see logs".to_string()))
}

/// Run a budgeted sweep now and report what it removed
pub async fn clean(State(state): State<AppState>) -> Result<Json<SweepReport>> {
    let start = Instant::now();
    let report = await_sweep(state.cache.clean_cache()).await?;
    info!(
        "Manual sweep removed {} files ({} bytes)",
        report.deleted_files, report.freed_bytes
    );
    metrics::record_request("cache_clean", 200);
    metrics::record_duration("cache_clean", start);
    Ok(Json(report))
}

/// Remove every cache file not currently in use
pub async fn clean_all(State(state): State<AppState>) -> Result<Json<SweepReport>> {
    let start = Instant::now();
    let report = await_sweep(state.cache.clean_all_cache()).await?;
    info!(
        "Cache cleared: {} files removed, {} skipped while open",
        report.deleted_files, report.skipped_open
    );
    metrics::record_request("cache_clean_all", 200);
    metrics::record_duration("cache_clean_all", start);
    Ok(Json(report))
}

pub async fn get_config(State(state): State<AppState>) -> Json<CacheConfiguration> {
    Json(state.cache.config())
}

/// Apply a partial configuration update and persist it
pub async fn update_config(
    State(state): State<AppState>,
    Json(update): Json<CacheConfigUpdate>,
) -> Result<Json<CacheConfiguration>> {
    if update.is_empty() {
        return Ok(Json(state.cache.config()));
    }
    let updated = state.cache.update_config(&update)?;
    info!("Cache configuration updated: {:?}", updated);
    metrics::record_request("cache_config", 200);
    Ok(Json(updated))
}

/// Player items currently held by the proxy
pub async fn list_items(State(state): State<AppState>) -> Json<Vec<ItemSummary>> {
    Json(state.items.summaries())
}

// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Operator routes: backfill triggering and job inspection.
//!
//! Mounted behind `require_admin`.

use crate::error::{AppError, Result};
use crate::models::{IngestJob, JobStatus};
use crate::services::BackfillResult;
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use validator::Validate;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/sync/activities", post(sync_activities))
        .route("/admin/jobs", get(list_jobs))
        .route("/admin/jobs/{id}", get(get_job))
}

// ─── Backfill ────────────────────────────────────────────────

#[derive(Debug, Deserialize, Validate)]
struct SyncQuery {
    user_id: i64,
    /// Unix seconds; only activities starting after this
    after: Option<i64>,
    /// Unix seconds; only activities starting before this
    before: Option<i64>,
    #[serde(default = "default_page")]
    #[validate(range(min = 1))]
    page: u32,
    #[serde(default = "default_per_page")]
    #[validate(range(min = 1, max = 200))]
    per_page: u32,
    /// Walk pages from 1 until a short page; `page` is ignored
    #[serde(default)]
    all_pages: bool,
}

fn default_page() -> u32 {
    1
}
fn default_per_page() -> u32 {
    30
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub enqueued_count: u32,
    pub listed_count: u32,
    pub failed_count: usize,
    pub message: String,
}

async fn sync_activities(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SyncQuery>,
) -> Result<Json<SyncResponse>> {
    params
        .validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    if let (Some(after), Some(before)) = (params.after, params.before) {
        if after >= before {
            return Err(AppError::BadRequest(
                "'after' must be earlier than 'before'".to_string(),
            ));
        }
    }

    let result = if params.all_pages {
        state
            .backfill
            .enqueue_all(params.user_id, params.after, params.before, params.per_page)
            .await?
    } else {
        state
            .backfill
            .enqueue_window(
                params.user_id,
                params.after,
                params.before,
                params.page,
                params.per_page,
            )
            .await?
    };

    if result.is_complete_failure() {
        return Err(AppError::Internal(anyhow::anyhow!(
            "Failed to enqueue any of {} listed activities",
            result.listed_count
        )));
    }

    Ok(Json(SyncResponse {
        enqueued_count: result.enqueued_count,
        listed_count: result.listed_count,
        failed_count: result.failed_ids.len(),
        message: sync_message(&result, &params),
    }))
}

fn sync_message(result: &BackfillResult, params: &SyncQuery) -> String {
    let window = if params.all_pages {
        format!("{} pages, perPage={}", result.pages, params.per_page)
    } else {
        format!("page={}, perPage={}", params.page, params.per_page)
    };
    format!(
        "Enqueued {} of {} activities for ingestion, {} failed ({})",
        result.enqueued_count,
        result.listed_count,
        result.failed_ids.len(),
        window
    )
}

// ─── Jobs ────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Validate)]
struct JobsQuery {
    status: Option<String>,
    #[serde(default = "default_jobs_limit")]
    #[validate(range(min = 1, max = 500))]
    limit: u32,
}

fn default_jobs_limit() -> u32 {
    50
}

#[derive(Debug, Serialize)]
pub struct JobsResponse {
    pub jobs: Vec<IngestJob>,
}

async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<JobsQuery>,
) -> Result<Json<JobsResponse>> {
    params
        .validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let status = params
        .status
        .as_deref()
        .map(|s| s.to_ascii_uppercase().parse::<JobStatus>())
        .transpose()
        .map_err(|e| AppError::BadRequest(format!("Invalid status: {}", e.0)))?;

    let jobs = state.db.list_jobs(status, params.limit).await?;
    Ok(Json(JobsResponse { jobs }))
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<IngestJob>> {
    state
        .db
        .get_job(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Job {}", id)))
}

// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Webhook routes for Strava events.

use crate::middleware::admin_auth::tokens_match;
use crate::models::WebhookPayload;
use crate::services::IntakeOutcome;
use crate::AppState;
use axum::{
    body::Bytes,
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Webhook routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/webhook", get(verify).post(handle_event))
}

/// Strava webhook verification query params.
#[derive(Deserialize)]
struct VerifyParams {
    #[serde(rename = "hub.mode", default)]
    mode: String,
    #[serde(rename = "hub.challenge", default)]
    challenge: String,
    #[serde(rename = "hub.verify_token", default)]
    verify_token: String,
}

/// Verification response.
#[derive(Serialize, Default)]
struct VerifyResponse {
    #[serde(rename = "hub.challenge")]
    challenge: String,
}

/// Verify webhook subscription (GET).
async fn verify(
    State(state): State<Arc<AppState>>,
    Query(params): Query<VerifyParams>,
) -> impl IntoResponse {
    if params.mode == "subscribe"
        && tokens_match(&params.verify_token, &state.config.webhook_verify_token)
    {
        tracing::info!("Webhook subscription verified");
        (
            StatusCode::OK,
            Json(VerifyResponse {
                challenge: params.challenge,
            }),
        )
    } else {
        tracing::warn!(
            mode = %params.mode,
            "Webhook verification failed: invalid token"
        );
        (StatusCode::FORBIDDEN, Json(VerifyResponse::default()))
    }
}

/// Handle incoming webhook events (POST).
///
/// Strava retries anything that is not a quick 200, so every outcome other
/// than a foreign subscription is acknowledged.
async fn handle_event(State(state): State<Arc<AppState>>, body: Bytes) -> StatusCode {
    let raw: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error = %e, "Webhook body is not JSON");
            return StatusCode::OK;
        }
    };

    let payload: WebhookPayload = match serde_json::from_value(raw.clone()) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, payload = %raw, "Failed to parse webhook event");
            return StatusCode::OK;
        }
    };

    if let Some(expected) = state.config.strava_subscription_id {
        if payload.subscription_id != Some(expected) {
            tracing::warn!(
                received_id = ?payload.subscription_id,
                expected_id = expected,
                "Security Alert: Webhook subscription ID mismatch"
            );
            return StatusCode::FORBIDDEN;
        }
    }

    tracing::info!(
        object_type = %payload.object_type,
        object_id = payload.object_id,
        aspect_type = %payload.aspect_type,
        owner_id = payload.owner_id,
        "Webhook event received"
    );

    match state.intake.handle(&payload, raw, Utc::now()).await {
        Ok(IntakeOutcome::Enqueued { event_id, job }) => {
            tracing::debug!(event_id, ?job, "Webhook intake enqueued job");
        }
        Ok(outcome) => {
            tracing::debug!(?outcome, "Webhook intake complete");
        }
        Err(e) => {
            tracing::error!(
                error = %e,
                object_id = payload.object_id,
                owner_id = payload.owner_id,
                "Webhook intake failed"
            );
        }
    }

    StatusCode::OK
}

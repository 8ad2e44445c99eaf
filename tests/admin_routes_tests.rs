// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Admin route authentication, validation and backfill behavior.

mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use chrono::Utc;
use stride_ingest::db::{JobStore, LinkStore};
use stride_ingest::models::{JobType, Provider};
use tower::ServiceExt;

const ADMIN_TOKEN: &str = "test_admin_token"; // Matches Config::test_default()

fn admin_request(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_admin_requires_token() {
    let app = common::create_test_app();

    let response = app
        .router
        .oneshot(admin_request("GET", "/admin/jobs", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_admin_rejects_wrong_token() {
    let app = common::create_test_app();

    let response = app
        .router
        .oneshot(admin_request("GET", "/admin/jobs", Some("not-the-token")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = json_body(response).await;
    assert_eq!(json["error"], "unauthorized");
}

#[tokio::test]
async fn test_sync_enqueues_listed_activities() {
    let app = common::create_test_app();
    app.store.upsert_link(1, 4242, Utc::now()).await.unwrap();
    app.fetcher.set_listing(vec![101, 102, 103]);

    let response = app
        .router
        .oneshot(admin_request(
            "POST",
            "/admin/sync/activities?user_id=1&page=1&per_page=30",
            Some(ADMIN_TOKEN),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["enqueued_count"], 3);
    assert_eq!(json["listed_count"], 3);
    assert_eq!(json["failed_count"], 0);
    assert!(json["message"].as_str().unwrap().contains("page=1"));
    assert!(json["message"].as_str().unwrap().contains("0 failed"));

    assert_eq!(app.store.list_jobs(None, 10).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_sync_counts_only_new_jobs() {
    let app = common::create_test_app();
    app.store.upsert_link(1, 4242, Utc::now()).await.unwrap();
    app.fetcher.set_listing(vec![101, 102]);
    app.store
        .enqueue(Provider::Strava, 101, Some(1), JobType::ActivityUpsert, Utc::now())
        .await
        .unwrap();

    let response = app
        .router
        .oneshot(admin_request(
            "POST",
            "/admin/sync/activities?user_id=1",
            Some(ADMIN_TOKEN),
        ))
        .await
        .unwrap();

    let json = json_body(response).await;
    assert_eq!(json["enqueued_count"], 1);
    assert_eq!(json["listed_count"], 2);
    assert_eq!(app.store.list_jobs(None, 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_sync_all_pages_walks_until_short_page() {
    let app = common::create_test_app();
    app.store.upsert_link(1, 4242, Utc::now()).await.unwrap();
    app.fetcher.set_listing((1..=5).collect());

    let response = app
        .router
        .oneshot(admin_request(
            "POST",
            "/admin/sync/activities?user_id=1&per_page=2&all_pages=true",
            Some(ADMIN_TOKEN),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["enqueued_count"], 5);
    assert_eq!(json["listed_count"], 5);
    assert!(json["message"].as_str().unwrap().contains("3 pages"));
}

#[tokio::test]
async fn test_sync_rejects_out_of_range_per_page() {
    let app = common::create_test_app();
    app.store.upsert_link(1, 4242, Utc::now()).await.unwrap();

    let response = app
        .router
        .oneshot(admin_request(
            "POST",
            "/admin/sync/activities?user_id=1&per_page=500",
            Some(ADMIN_TOKEN),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_sync_rejects_page_zero() {
    let app = common::create_test_app();
    app.store.upsert_link(1, 4242, Utc::now()).await.unwrap();

    let response = app
        .router
        .oneshot(admin_request(
            "POST",
            "/admin/sync/activities?user_id=1&page=0",
            Some(ADMIN_TOKEN),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_sync_rejects_inverted_window() {
    let app = common::create_test_app();
    app.store.upsert_link(1, 4242, Utc::now()).await.unwrap();

    let response = app
        .router
        .oneshot(admin_request(
            "POST",
            "/admin/sync/activities?user_id=1&after=2000&before=1000",
            Some(ADMIN_TOKEN),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_sync_requires_linked_athlete() {
    let app = common::create_test_app();
    app.fetcher.set_listing(vec![101]);

    let response = app
        .router
        .oneshot(admin_request(
            "POST",
            "/admin/sync/activities?user_id=77",
            Some(ADMIN_TOKEN),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(app.store.list_jobs(None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_list_jobs_filters_by_status() {
    let app = common::create_test_app();
    let now = Utc::now();
    for id in [1, 2, 3] {
        app.store
            .enqueue(Provider::Strava, id, Some(1), JobType::ActivityUpsert, now)
            .await
            .unwrap();
    }
    let claimed = app
        .store
        .claim_due(1, now, chrono::Duration::minutes(15))
        .await
        .unwrap();
    app.store.mark_running(claimed[0].id, now).await.unwrap();
    app.store.mark_done(claimed[0].id, now).await.unwrap();

    let response = app
        .router
        .clone()
        .oneshot(admin_request(
            "GET",
            "/admin/jobs?status=pending&limit=10",
            Some(ADMIN_TOKEN),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    let jobs = json["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|j| j["status"] == "PENDING"));

    let response = app
        .router
        .oneshot(admin_request(
            "GET",
            &format!("/admin/jobs/{}", claimed[0].id),
            Some(ADMIN_TOKEN),
        ))
        .await
        .unwrap();
    let json = json_body(response).await;
    assert_eq!(json["status"], "DONE");
    assert_eq!(json["retry_count"], 1);
}

#[tokio::test]
async fn test_list_jobs_rejects_unknown_status() {
    let app = common::create_test_app();

    let response = app
        .router
        .oneshot(admin_request(
            "GET",
            "/admin/jobs?status=EXPLODED",
            Some(ADMIN_TOKEN),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_missing_job_is_404() {
    let app = common::create_test_app();

    let response = app
        .router
        .oneshot(admin_request("GET", "/admin/jobs/9999", Some(ADMIN_TOKEN)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_is_public() {
    let app = common::create_test_app();

    let response = app
        .router
        .oneshot(admin_request("GET", "/health", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["status"], "ok");
}

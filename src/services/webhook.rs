// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Webhook intake: dedupe, persist, enqueue.

use crate::db::Database;
use crate::error::AppError;
use crate::models::webhook::WebhookEventError;
use crate::models::{EnqueueOutcome, JobType, Provider, WebhookEvent, WebhookPayload};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Which branch intake took for one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// Not an event this service stores (e.g. athlete deauthorization).
    Ignored(WebhookEventError),
    /// Same delivery already stored.
    Duplicate,
    /// Stored; the aspect does not trigger ingestion.
    Stored { event_id: i64 },
    /// Stored; no local user owns the athlete.
    Unlinked { event_id: i64 },
    /// Stored and an ingest job requested.
    Enqueued { event_id: i64, job: EnqueueOutcome },
}

#[derive(Clone)]
pub struct WebhookIntake {
    db: Arc<dyn Database>,
}

impl WebhookIntake {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub async fn handle(
        &self,
        payload: &WebhookPayload,
        raw_payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<IntakeOutcome, AppError> {
        let event = match WebhookEvent::new(payload, raw_payload, now) {
            Ok(event) => event,
            Err(e) => {
                tracing::info!(
                    object_type = %payload.object_type,
                    aspect_type = %payload.aspect_type,
                    owner_id = payload.owner_id,
                    reason = %e,
                    "Ignoring webhook event"
                );
                return Ok(IntakeOutcome::Ignored(e));
            }
        };

        // The store rejects a repeated delivery key atomically, so concurrent
        // retries of one delivery store a single row.
        let Some(event_id) = self.db.save_event(&event).await? else {
            tracing::debug!(
                owner_id = event.owner_id,
                object_id = event.object_id,
                aspect_type = %event.aspect_type,
                "Duplicate webhook delivery"
            );
            return Ok(IntakeOutcome::Duplicate);
        };

        if !event.aspect().is_some_and(|a| a.triggers_ingest()) {
            return Ok(IntakeOutcome::Stored { event_id });
        }

        let Some(user_id) = self.db.find_user_by_athlete(event.owner_id).await? else {
            tracing::info!(
                owner_id = event.owner_id,
                object_id = event.object_id,
                "Webhook for unlinked athlete, not enqueuing"
            );
            return Ok(IntakeOutcome::Unlinked { event_id });
        };

        let job = self
            .db
            .enqueue(
                Provider::Strava,
                event.object_id,
                Some(user_id),
                JobType::ActivityUpsert,
                now,
            )
            .await?;

        tracing::info!(
            event_id,
            user_id,
            activity_id = event.object_id,
            aspect_type = %event.aspect_type,
            new_job = job.is_new(),
            "Webhook event enqueued"
        );

        Ok(IntakeOutcome::Enqueued { event_id, job })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{JobStore, LinkStore, MemoryStore, WebhookStore};
    use crate::models::JobStatus;

    fn payload(aspect_type: &str, event_time: i64) -> WebhookPayload {
        WebhookPayload {
            object_type: "activity".to_string(),
            object_id: 555,
            aspect_type: aspect_type.to_string(),
            owner_id: 42,
            event_time,
            subscription_id: None,
        }
    }

    async fn linked_store() -> MemoryStore {
        let store = MemoryStore::new();
        store.upsert_link(7, 42, Utc::now()).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_absorbed() {
        let store = linked_store().await;
        let intake = WebhookIntake::new(Arc::new(store.clone()));
        let p = payload("create", 1_700_000_000);

        let first = intake.handle(&p, serde_json::json!({}), Utc::now()).await.unwrap();
        let second = intake.handle(&p, serde_json::json!({}), Utc::now()).await.unwrap();

        assert!(matches!(
            first,
            IntakeOutcome::Enqueued { job: EnqueueOutcome::Enqueued(_), .. }
        ));
        assert_eq!(second, IntakeOutcome::Duplicate);
        assert_eq!(store.find_events(42, 555).await.unwrap().len(), 1);
        assert_eq!(store.list_jobs(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_identical_deliveries_store_one_event() {
        let store = linked_store().await;
        let intake = WebhookIntake::new(Arc::new(store.clone()));
        let p = payload("create", 1_700_000_000);
        let now = Utc::now();

        let (a, b) = tokio::join!(
            intake.handle(&p, serde_json::json!({}), now),
            intake.handle(&p, serde_json::json!({}), now),
        );
        let outcomes = [a.unwrap(), b.unwrap()];

        let duplicates = outcomes
            .iter()
            .filter(|o| **o == IntakeOutcome::Duplicate)
            .count();
        assert_eq!(duplicates, 1);
        assert_eq!(store.find_events(42, 555).await.unwrap().len(), 1);
        assert_eq!(store.list_jobs(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_while_pending_does_not_add_job() {
        let store = linked_store().await;
        let intake = WebhookIntake::new(Arc::new(store.clone()));

        intake
            .handle(&payload("create", 1_700_000_000), serde_json::json!({}), Utc::now())
            .await
            .unwrap();
        let outcome = intake
            .handle(&payload("update", 1_700_000_060), serde_json::json!({}), Utc::now())
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            IntakeOutcome::Enqueued { job: EnqueueOutcome::AlreadyActive(_), .. }
        ));
        assert_eq!(store.find_events(42, 555).await.unwrap().len(), 2);
        let pending = store.list_jobs(Some(JobStatus::Pending), 10).await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_unlinked_owner_stored_without_job() {
        let store = MemoryStore::new();
        let intake = WebhookIntake::new(Arc::new(store.clone()));

        let outcome = intake
            .handle(&payload("create", 1_700_000_000), serde_json::json!({}), Utc::now())
            .await
            .unwrap();

        assert!(matches!(outcome, IntakeOutcome::Unlinked { .. }));
        assert_eq!(store.find_events(42, 555).await.unwrap().len(), 1);
        assert!(store.list_jobs(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_is_stored_only() {
        let store = linked_store().await;
        let intake = WebhookIntake::new(Arc::new(store.clone()));

        let outcome = intake
            .handle(&payload("delete", 1_700_000_000), serde_json::json!({}), Utc::now())
            .await
            .unwrap();

        assert!(matches!(outcome, IntakeOutcome::Stored { .. }));
        assert!(store.list_jobs(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_athlete_event_ignored() {
        let store = linked_store().await;
        let intake = WebhookIntake::new(Arc::new(store.clone()));

        let mut p = payload("update", 1_700_000_000);
        p.object_type = "athlete".to_string();
        p.object_id = 42;

        let outcome = intake.handle(&p, serde_json::json!({}), Utc::now()).await.unwrap();
        assert!(matches!(outcome, IntakeOutcome::Ignored(_)));
        assert!(store.find_events(42, 42).await.unwrap().is_empty());
    }
}

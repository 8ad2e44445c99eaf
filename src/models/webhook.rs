// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Stored Strava push notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The only object type this service ingests.
pub const OBJECT_TYPE_ACTIVITY: &str = "activity";

/// Raw webhook body as Strava posts it.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub object_type: String,
    pub object_id: i64,
    pub aspect_type: String,
    pub owner_id: i64,
    /// Unix seconds.
    pub event_time: i64,
    #[serde(default)]
    pub subscription_id: Option<u64>,
}

/// Aspect of a change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspectType {
    Create,
    Update,
    Delete,
}

impl AspectType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(AspectType::Create),
            "update" => Some(AspectType::Update),
            "delete" => Some(AspectType::Delete),
            _ => None,
        }
    }

    /// Whether the event should trigger a fetch.
    pub fn triggers_ingest(&self) -> bool {
        matches!(self, AspectType::Create | AspectType::Update)
    }
}

/// Reasons a payload cannot become a `WebhookEvent`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WebhookEventError {
    #[error("unsupported object type: {0}")]
    UnsupportedObjectType(String),

    #[error("invalid event time: {0}")]
    InvalidEventTime(i64),
}

/// A push notification accepted for storage.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookEvent {
    pub id: i64,
    pub object_type: String,
    pub aspect_type: String,
    pub object_id: i64,
    pub owner_id: i64,
    pub event_time: DateTime<Utc>,
    #[sqlx(json)]
    pub raw_payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl WebhookEvent {
    /// Validate a payload. Only activity events can be constructed.
    pub fn new(
        payload: &WebhookPayload,
        raw_payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Self, WebhookEventError> {
        if payload.object_type != OBJECT_TYPE_ACTIVITY {
            return Err(WebhookEventError::UnsupportedObjectType(
                payload.object_type.clone(),
            ));
        }

        let event_time = DateTime::from_timestamp(payload.event_time, 0)
            .ok_or(WebhookEventError::InvalidEventTime(payload.event_time))?;

        Ok(Self {
            id: 0,
            object_type: payload.object_type.clone(),
            aspect_type: payload.aspect_type.clone(),
            object_id: payload.object_id,
            owner_id: payload.owner_id,
            event_time,
            raw_payload,
            created_at: now,
        })
    }

    pub fn aspect(&self) -> Option<AspectType> {
        AspectType::parse(&self.aspect_type)
    }

    /// Same delivery as `other`: every field of the unique delivery key matches.
    pub fn is_same_delivery(&self, other: &WebhookEvent) -> bool {
        self.owner_id == other.owner_id
            && self.object_id == other.object_id
            && self.object_type == other.object_type
            && self.aspect_type == other.aspect_type
            && self.event_time == other.event_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(object_type: &str, aspect_type: &str) -> WebhookPayload {
        WebhookPayload {
            object_type: object_type.to_string(),
            object_id: 111,
            aspect_type: aspect_type.to_string(),
            owner_id: 222,
            event_time: 1_700_000_000,
            subscription_id: Some(12345),
        }
    }

    #[test]
    fn test_activity_event_constructs() {
        let event =
            WebhookEvent::new(&payload("activity", "create"), serde_json::json!({}), Utc::now())
                .unwrap();
        assert_eq!(event.object_id, 111);
        assert_eq!(event.owner_id, 222);
        assert_eq!(event.event_time.timestamp(), 1_700_000_000);
        assert_eq!(event.aspect(), Some(AspectType::Create));
    }

    #[test]
    fn test_athlete_event_rejected() {
        let err =
            WebhookEvent::new(&payload("athlete", "update"), serde_json::json!({}), Utc::now())
                .unwrap_err();
        assert_eq!(
            err,
            WebhookEventError::UnsupportedObjectType("athlete".to_string())
        );
    }

    #[test]
    fn test_same_delivery_requires_matching_time_and_aspect() {
        let now = Utc::now();
        let a = WebhookEvent::new(&payload("activity", "create"), serde_json::json!({}), now)
            .unwrap();
        let b = WebhookEvent::new(&payload("activity", "create"), serde_json::json!({}), now)
            .unwrap();
        assert!(a.is_same_delivery(&b));

        let update = WebhookEvent::new(&payload("activity", "update"), serde_json::json!({}), now)
            .unwrap();
        assert!(!a.is_same_delivery(&update));

        let mut later = payload("activity", "create");
        later.event_time += 60;
        let c = WebhookEvent::new(&later, serde_json::json!({}), now).unwrap();
        assert!(!a.is_same_delivery(&c));

        let mut other_object = payload("activity", "create");
        other_object.object_id += 1;
        let d = WebhookEvent::new(&other_object, serde_json::json!({}), now).unwrap();
        assert!(!a.is_same_delivery(&d));
    }

    #[test]
    fn test_aspect_triggers_ingest() {
        assert!(AspectType::Create.triggers_ingest());
        assert!(AspectType::Update.triggers_ingest());
        assert!(!AspectType::Delete.triggers_ingest());
        assert_eq!(AspectType::parse("archive"), None);
    }
}

// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Data models for the application.

pub mod activity;
pub mod job;
pub mod stats;
pub mod user;
pub mod webhook;

pub use activity::{
    Activity, ActivityStreams, Lap, NewActivity, PayloadType, RawPayload, Weather,
};
pub use job::{EnqueueOutcome, IngestJob, JobKind, JobStatus, JobType, Provider};
pub use stats::{DailyContribution, DailyStat};
pub use user::{ProviderLink, ProviderTokens};
pub use webhook::{WebhookEvent, WebhookPayload};

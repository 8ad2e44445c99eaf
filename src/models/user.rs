//! Links between local users and Strava athletes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maps a Strava athlete (webhook `owner_id`) to a local user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProviderLink {
    pub user_id: i64,
    /// Strava athlete ID
    pub athlete_id: i64,
    pub created_at: DateTime<Utc>,
}

/// OAuth tokens for a linked athlete.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProviderTokens {
    pub user_id: i64,
    pub access_token: String,
    pub refresh_token: String,
    /// Unix seconds
    pub expires_at: i64,
    pub updated_at: DateTime<Utc>,
}

impl ProviderTokens {
    pub fn expires_at_utc(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.expires_at, 0).unwrap_or_default()
    }

    /// True when the access token expires within `margin` of `now`.
    pub fn expires_within(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        now + margin >= self.expires_at_utc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(expires_at: i64) -> ProviderTokens {
        ProviderTokens {
            user_id: 1,
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_expires_within_margin() {
        let now = Utc::now();
        let margin = chrono::Duration::minutes(5);

        assert!(tokens(now.timestamp() + 60).expires_within(now, margin));
        assert!(tokens(now.timestamp() - 60).expires_within(now, margin));
        assert!(!tokens(now.timestamp() + 3600).expires_within(now, margin));
    }
}

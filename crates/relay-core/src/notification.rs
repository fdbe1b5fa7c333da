use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::CorrelationId;

/// Status used in the frame sent to a replaying client when nothing is stored.
pub const NOT_FOUND_STATUS: &str = "NOT FOUND";

/// Notification body as producers publish it and subscribers receive it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub date: String,
    #[serde(default)]
    pub order_id: String,
}

impl Notification {
    /// Explicit not-found frame for a replay miss.
    pub fn not_found(correlation_id: &CorrelationId) -> Self {
        Self {
            id: String::new(),
            status: NOT_FOUND_STATUS.to_string(),
            date: String::new(),
            order_id: correlation_id.as_str().to_string(),
        }
    }

    /// Rewrite the self-describing `order_id` to the id it is published under.
    pub fn normalized(mut self, correlation_id: &CorrelationId) -> Self {
        self.order_id = correlation_id.as_str().to_string();
        self
    }
}

/// The single latest notification stored for a correlation id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NotificationRecord {
    pub correlation_id: CorrelationId,
    pub payload: Notification,
    pub expires_at: DateTime<Utc>,
}

impl NotificationRecord {
    pub fn new(
        correlation_id: CorrelationId,
        payload: Notification,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            correlation_id,
            payload,
            expires_at,
        }
    }

    /// Rows at or past their expiry are logically absent.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

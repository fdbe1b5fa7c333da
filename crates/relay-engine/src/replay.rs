use std::sync::Arc;

use relay_core::{Notification, NotificationRecord};
use relay_store::NotificationStore;
use tracing::{debug, instrument};

use crate::clock::Clock;
use crate::context::Invocation;
use crate::delivery::{encode_frame, Deliverer};
use crate::error::{require_correlation_id, RelayError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplayOutcome {
    Found(NotificationRecord),
    NotFound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckOutcome {
    Removed,
    /// Nothing live was stored. Still a success.
    NotFound,
}

/// Lets a late subscriber pull the last notification and then mark it consumed.
pub struct ReplayService {
    notifications: Arc<dyn NotificationStore>,
    deliverer: Deliverer,
    clock: Arc<dyn Clock>,
}

impl ReplayService {
    pub fn new(
        notifications: Arc<dyn NotificationStore>,
        deliverer: Deliverer,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            notifications,
            deliverer,
            clock,
        }
    }

    /// Non-destructive read of the stored notification.
    ///
    /// When the invocation came in on a connection, that connection is sent the
    /// payload, or a `NOT FOUND` frame on a miss. A failed send fails the call.
    #[instrument(skip(self, inv), fields(correlation_id = raw_id))]
    pub async fn replay(&self, inv: &Invocation, raw_id: &str) -> Result<ReplayOutcome, RelayError> {
        let correlation_id = require_correlation_id(raw_id)?;
        inv.ensure_active()?;

        let record = self.notifications.get(&correlation_id, self.clock.now())?;
        if let Some(requester) = &inv.origin {
            let frame = match &record {
                Some(found) => encode_frame(&found.payload)?,
                None => encode_frame(&Notification::not_found(&correlation_id))?,
            };
            inv.run(self.deliverer.post(requester, frame)).await?;
        }

        debug!(found = record.is_some(), "replay served");
        Ok(match record {
            Some(found) => ReplayOutcome::Found(found),
            None => ReplayOutcome::NotFound,
        })
    }

    /// Delete the stored notification. Deleting an absent or expired row is a no-op.
    #[instrument(skip(self, inv), fields(correlation_id = raw_id))]
    pub fn acknowledge(&self, inv: &Invocation, raw_id: &str) -> Result<AckOutcome, RelayError> {
        let correlation_id = require_correlation_id(raw_id)?;
        inv.ensure_active()?;

        let removed = self.notifications.delete(&correlation_id, self.clock.now())?;
        debug!(removed, "acknowledged");
        Ok(if removed {
            AckOutcome::Removed
        } else {
            AckOutcome::NotFound
        })
    }
}

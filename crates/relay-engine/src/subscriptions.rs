use std::collections::HashMap;
use std::sync::Arc;

use relay_core::{ConnectionId, ConnectionRecord, CorrelationId};
use relay_store::ConnectionStore;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::error::{require_correlation_id, RelayError};

/// Query parameter carrying the correlation id on connect.
pub const CORRELATION_PARAM: &str = "order_id";

/// Pick the correlation id for a connect or subscribe event.
///
/// The query parameter wins; otherwise the JSON body's `order_id` is used.
/// A body that is present but not JSON is `MalformedBody`.
pub fn resolve_correlation_id(
    query: &HashMap<String, String>,
    body: Option<&str>,
) -> Result<CorrelationId, RelayError> {
    if let Some(id) = query
        .get(CORRELATION_PARAM)
        .and_then(|raw| CorrelationId::parse(raw.as_str()))
    {
        return Ok(id);
    }

    #[derive(Deserialize)]
    struct SubscribeBody {
        #[serde(default)]
        order_id: Option<String>,
    }

    let body = match body.map(str::trim) {
        Some(text) if !text.is_empty() => text,
        _ => return Err(RelayError::MissingCorrelationId),
    };
    let parsed: SubscribeBody =
        serde_json::from_str(body).map_err(|e| RelayError::MalformedBody(e.to_string()))?;
    parsed
        .order_id
        .and_then(CorrelationId::parse)
        .ok_or(RelayError::MissingCorrelationId)
}

/// Inserts and removes registry rows as connections open and close.
pub struct SubscriptionManager {
    connections: Arc<dyn ConnectionStore>,
}

impl SubscriptionManager {
    pub fn new(connections: Arc<dyn ConnectionStore>) -> Self {
        Self { connections }
    }

    /// Register `connection_id` under `raw_id`.
    ///
    /// Subscribing the same handle to the same id again overwrites the row.
    /// A handle's id never changes, so a different id is rejected.
    #[instrument(skip(self), fields(connection_id = %connection_id, correlation_id = raw_id))]
    pub fn subscribe(
        &self,
        connection_id: &ConnectionId,
        raw_id: &str,
    ) -> Result<ConnectionRecord, RelayError> {
        let correlation_id = require_correlation_id(raw_id)?;
        if let Some(existing) = self.connections.get(connection_id)? {
            if existing.correlation_id != correlation_id {
                return Err(RelayError::AlreadySubscribed {
                    connection_id: connection_id.clone(),
                    current: existing.correlation_id,
                });
            }
        }

        let record = ConnectionRecord::new(connection_id.clone(), correlation_id);
        self.connections.put(&record)?;
        debug!("connection subscribed");
        Ok(record)
    }

    /// Remove the registry row. Absence is not an error; returns whether a row existed.
    #[instrument(skip(self), fields(connection_id = %connection_id))]
    pub fn unsubscribe(&self, connection_id: &ConnectionId) -> Result<bool, RelayError> {
        let removed = self.connections.delete(connection_id)?;
        debug!(removed, "connection unsubscribed");
        Ok(removed)
    }

    /// The id a connection is currently registered under, if any.
    pub fn subscription_of(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Option<CorrelationId>, RelayError> {
        Ok(self
            .connections
            .get(connection_id)?
            .map(|record| record.correlation_id))
    }
}

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use relay_core::{ConnectionId, Transport};
use serde::Serialize;

use crate::error::RelayError;

/// Timeout-bounded wrapper around the transport's post-to-connection call.
/// Failures are reported, never retried here.
#[derive(Clone)]
pub struct Deliverer {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl Deliverer {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub async fn post(&self, connection_id: &ConnectionId, frame: Bytes) -> Result<(), RelayError> {
        match tokio::time::timeout(
            self.timeout,
            self.transport.post_to_connection(connection_id, frame),
        )
        .await
        {
            Ok(result) => result.map_err(RelayError::from),
            Err(_) => Err(RelayError::Timeout(self.timeout)),
        }
    }
}

/// Serialize a payload once so every recipient gets the same bytes.
pub fn encode_frame<T: Serialize>(payload: &T) -> Result<Bytes, RelayError> {
    Ok(Bytes::from(serde_json::to_vec(payload)?))
}

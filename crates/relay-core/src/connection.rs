use serde::Serialize;

use crate::ids::{ConnectionId, CorrelationId};

/// A live connection subscribed to one correlation id.
///
/// Created when the connection opens (or on its first subscribing message),
/// deleted when it closes. There is no update path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionRecord {
    pub connection_id: ConnectionId,
    pub correlation_id: CorrelationId,
    pub connected_at: String,
}

impl ConnectionRecord {
    pub fn new(connection_id: ConnectionId, correlation_id: CorrelationId) -> Self {
        Self {
            connection_id,
            correlation_id,
            connected_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

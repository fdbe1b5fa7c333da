use async_trait::async_trait;
use bytes::Bytes;

use crate::ids::ConnectionId;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection no longer exists on the transport.
    #[error("connection gone: {0}")]
    Gone(ConnectionId),

    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

impl TransportError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Gone(_) => "connection_gone",
            Self::Unavailable(_) => "unavailable",
        }
    }
}

/// Outbound half of the connection transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Push one frame to a single connection.
    async fn post_to_connection(
        &self,
        connection_id: &ConnectionId,
        data: Bytes,
    ) -> Result<(), TransportError>;
}

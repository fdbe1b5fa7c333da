use std::time::Duration;

use relay_core::{ConnectionId, CorrelationId, TransportError};
use relay_store::StoreError;

/// Failure of a single relay invocation.
///
/// Validation variants are client faults and map to 400; everything else is a
/// dependency failure (500). "Nothing stored" is not an error: it is reported
/// through [`crate::ReplayOutcome`] and [`crate::AckOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("missing order_id")]
    MissingCorrelationId,

    #[error("malformed body: {0}")]
    MalformedBody(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("connection {connection_id} is already subscribed to {current}")]
    AlreadySubscribed {
        connection_id: ConnectionId,
        current: CorrelationId,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RelayError {
    /// Client-fault errors: never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::MissingCorrelationId
                | Self::MalformedBody(_)
                | Self::UnknownAction(_)
                | Self::AlreadySubscribed { .. }
        )
    }

    /// HTTP-style status code reported back to the caller.
    pub fn status_code(&self) -> u16 {
        if self.is_validation() {
            400
        } else {
            500
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::MissingCorrelationId => "missing_correlation_id",
            Self::MalformedBody(_) => "malformed_body",
            Self::UnknownAction(_) => "unknown_action",
            Self::AlreadySubscribed { .. } => "already_subscribed",
            Self::Store(_) => "store_unavailable",
            Self::Transport(e) => e.error_kind(),
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Serialization(_) => "serialization",
        }
    }
}

/// Validate a raw id taken from a request.
pub(crate) fn require_correlation_id(raw: &str) -> Result<CorrelationId, RelayError> {
    CorrelationId::parse(raw).ok_or(RelayError::MissingCorrelationId)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_400() {
        assert_eq!(RelayError::MissingCorrelationId.status_code(), 400);
        assert_eq!(RelayError::MalformedBody("eof".into()).status_code(), 400);
        assert_eq!(RelayError::UnknownAction("dance".into()).status_code(), 400);
    }

    #[test]
    fn dependency_failures_map_to_500() {
        assert_eq!(
            RelayError::Store(StoreError::Database("locked".into())).status_code(),
            500
        );
        assert_eq!(
            RelayError::Transport(TransportError::Unavailable("down".into())).status_code(),
            500
        );
        assert_eq!(RelayError::Timeout(Duration::from_secs(5)).status_code(), 500);
        assert_eq!(RelayError::Cancelled.status_code(), 500);
    }

    #[test]
    fn error_kinds() {
        assert_eq!(RelayError::Cancelled.error_kind(), "cancelled");
        assert_eq!(
            RelayError::Transport(TransportError::Gone(ConnectionId::from_raw("conn_x"))).error_kind(),
            "connection_gone"
        );
    }

    #[test]
    fn require_rejects_blank() {
        assert!(matches!(
            require_correlation_id(""),
            Err(RelayError::MissingCorrelationId)
        ));
        assert_eq!(require_correlation_id("42").unwrap().as_str(), "42");
    }
}

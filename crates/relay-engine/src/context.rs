use std::future::Future;

use relay_core::ConnectionId;
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;

/// Per-invocation context: who sent the event and when to give up.
#[derive(Clone, Debug)]
pub struct Invocation {
    /// Connection the event arrived on. `None` for producers without a connection.
    pub origin: Option<ConnectionId>,
    pub cancel: CancellationToken,
}

impl Invocation {
    pub fn from_connection(connection_id: ConnectionId, cancel: CancellationToken) -> Self {
        Self {
            origin: Some(connection_id),
            cancel,
        }
    }

    pub fn detached(cancel: CancellationToken) -> Self {
        Self {
            origin: None,
            cancel,
        }
    }

    pub fn ensure_active(&self) -> Result<(), RelayError> {
        if self.cancel.is_cancelled() {
            Err(RelayError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Drive `fut` unless the invocation is cancelled first.
    /// Work already committed by `fut` before cancellation stays committed.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, RelayError>
    where
        F: Future<Output = Result<T, RelayError>>,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(RelayError::Cancelled),
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn run_completes_when_active() {
        let inv = Invocation::detached(CancellationToken::new());
        let value = inv.run(async { Ok::<_, RelayError>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn run_aborts_on_cancel() {
        let cancel = CancellationToken::new();
        let inv = Invocation::detached(cancel.clone());
        cancel.cancel();
        let result = inv
            .run(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, RelayError>(())
            })
            .await;
        assert!(matches!(result, Err(RelayError::Cancelled)));
        assert!(inv.ensure_active().is_err());
    }
}

//! Maps inbound frames to relay operations and their results to response envelopes.

use relay_core::{ConnectionId, CorrelationId, Notification};
use relay_engine::{AckOutcome, Invocation, PublishOutcome, Relay, RelayError, ReplayOutcome};
use serde_json::json;
use tracing::{debug, warn};

use crate::protocol::{Action, InboundFrame, ResponseEnvelope};

/// Handle one text frame. Subscribes need the invocation's origin connection.
pub async fn route_frame(relay: &Relay, inv: &Invocation, raw: &str) -> ResponseEnvelope {
    let result = match InboundFrame::parse(raw) {
        Ok(frame) => dispatch(relay, inv, raw, frame).await,
        Err(e) => Err(e),
    };
    into_envelope(result)
}

async fn dispatch(
    relay: &Relay,
    inv: &Invocation,
    raw: &str,
    frame: InboundFrame,
) -> Result<ResponseEnvelope, RelayError> {
    match frame.action()? {
        Action::Subscribe => {
            let Some(connection_id) = inv.origin.as_ref() else {
                return Err(RelayError::UnknownAction(Action::Subscribe.as_str().into()));
            };
            subscribe(relay, inv, connection_id, raw)
        }
        Action::Publish => {
            let payload = frame.message.clone().unwrap_or_default();
            publish(relay, inv, frame.order_id(), payload).await
        }
        Action::Replay => replay(relay, inv, frame.order_id()).await,
        Action::Ack => acknowledge(relay, inv, frame.order_id()),
    }
}

/// Subscribe the origin connection. The invocation token fires when that
/// connection closes, and a close that lands mid-write would otherwise miss
/// the new row, so the write is undone.
fn subscribe(
    relay: &Relay,
    inv: &Invocation,
    connection_id: &ConnectionId,
    raw: &str,
) -> Result<ResponseEnvelope, RelayError> {
    let correlation_id = relay_engine::resolve_correlation_id(&Default::default(), Some(raw))?;
    inv.ensure_active()?;
    let record = relay.subscribe(connection_id, correlation_id.as_str())?;
    if let Err(cancelled) = inv.ensure_active() {
        relay.unsubscribe(connection_id)?;
        return Err(cancelled);
    }
    Ok(ResponseEnvelope::ok(json!({
        "order_id": record.correlation_id,
        "connection_id": record.connection_id,
    })))
}

/// Publish and map the outcome: 200 when every delivery landed, 207 otherwise.
pub async fn publish(
    relay: &Relay,
    inv: &Invocation,
    order_id: &str,
    payload: Notification,
) -> Result<ResponseEnvelope, RelayError> {
    let outcome = relay.publish(inv, order_id, payload).await?;
    let status = match outcome {
        PublishOutcome::Delivered(_) => 200,
        PublishOutcome::Degraded(_) => 207,
    };
    Ok(ResponseEnvelope::new(
        status,
        json!({ "order_id": order_id, "delivery": outcome.report() }),
    ))
}

pub async fn replay(
    relay: &Relay,
    inv: &Invocation,
    order_id: &str,
) -> Result<ResponseEnvelope, RelayError> {
    Ok(match relay.replay(inv, order_id).await? {
        ReplayOutcome::Found(record) => ResponseEnvelope::ok(json!(record.payload)),
        ReplayOutcome::NotFound => {
            let missing = CorrelationId::from_raw(order_id);
            ResponseEnvelope::new(404, json!(Notification::not_found(&missing)))
        }
    })
}

pub fn acknowledge(
    relay: &Relay,
    inv: &Invocation,
    order_id: &str,
) -> Result<ResponseEnvelope, RelayError> {
    let removed = matches!(relay.acknowledge(inv, order_id)?, AckOutcome::Removed);
    Ok(ResponseEnvelope::ok(json!({ "order_id": order_id, "removed": removed })))
}

/// Collapse an operation result into the envelope sent back to the caller.
pub fn into_envelope(result: Result<ResponseEnvelope, RelayError>) -> ResponseEnvelope {
    match result {
        Ok(envelope) => envelope,
        Err(error) if error.is_validation() => {
            debug!(error_kind = error.error_kind(), %error, "rejected request");
            ResponseEnvelope::from_error(&error)
        }
        Err(error) => {
            warn!(error_kind = error.error_kind(), %error, "request failed");
            ResponseEnvelope::from_error(&error)
        }
    }
}

//! Wire shapes for frames exchanged over the WebSocket and the HTTP publish route.

use relay_core::Notification;
use relay_engine::RelayError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Inbound request frame. Every field is optional on the wire; the router
/// decides what each action requires.
#[derive(Debug, Default, Deserialize)]
pub struct InboundFrame {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub message: Option<Notification>,
}

impl InboundFrame {
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        serde_json::from_str(raw).map_err(|e| RelayError::MalformedBody(e.to_string()))
    }

    pub fn action(&self) -> Result<Action, RelayError> {
        Action::parse(self.action.as_deref())
    }

    pub fn order_id(&self) -> &str {
        self.order_id.as_deref().unwrap_or_default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Subscribe,
    Publish,
    Replay,
    Ack,
}

impl Action {
    /// A frame without an action is a subscribe.
    pub fn parse(action: Option<&str>) -> Result<Self, RelayError> {
        match action {
            None | Some("subscribe") => Ok(Self::Subscribe),
            Some("sendmessage") => Ok(Self::Publish),
            Some("request") => Ok(Self::Replay),
            Some("ack") => Ok(Self::Ack),
            Some(other) => Err(RelayError::UnknownAction(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Publish => "sendmessage",
            Self::Replay => "request",
            Self::Ack => "ack",
        }
    }
}

/// Reply to every request frame: `{"statusCode": u16, "body": {...}}`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: Value,
}

impl ResponseEnvelope {
    pub fn new(status_code: u16, body: Value) -> Self {
        Self { status_code, body }
    }

    pub fn ok(body: Value) -> Self {
        Self::new(200, body)
    }

    pub fn from_error(error: &RelayError) -> Self {
        Self::new(
            error.status_code(),
            json!({ "error": error.error_kind(), "message": error.to_string() }),
        )
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"statusCode":{},"body":{{}}}}"#, self.status_code)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parses_publish_frame() {
        let frame = InboundFrame::parse(
            r#"{"action":"sendmessage","order_id":"42","message":{"id":"u1","status":"DONE","date":"d","order_id":"42"}}"#,
        )
        .unwrap();
        assert_eq!(frame.action().unwrap(), Action::Publish);
        assert_eq!(frame.order_id(), "42");
        assert_eq!(frame.message.unwrap().status, "DONE");
    }

    #[test]
    fn missing_action_is_subscribe() {
        let frame = InboundFrame::parse(r#"{"order_id":"42"}"#).unwrap();
        assert_eq!(frame.action().unwrap(), Action::Subscribe);
    }

    #[test]
    fn unknown_action() {
        let frame = InboundFrame::parse(r#"{"action":"dance"}"#).unwrap();
        assert_matches!(frame.action(), Err(RelayError::UnknownAction(ref a)) if a == "dance");
    }

    #[test]
    fn malformed_json() {
        assert_matches!(InboundFrame::parse("{"), Err(RelayError::MalformedBody(_)));
        assert_matches!(InboundFrame::parse("[1,2]"), Err(RelayError::MalformedBody(_)));
    }

    #[test]
    fn envelope_wire_shape() {
        let env = ResponseEnvelope::ok(json!({"removed": true}));
        let value: Value = serde_json::from_str(&env.to_json()).unwrap();
        assert_eq!(value, json!({"statusCode": 200, "body": {"removed": true}}));
    }

    #[test]
    fn error_envelope() {
        let env = ResponseEnvelope::from_error(&RelayError::MissingCorrelationId);
        assert_eq!(env.status_code, 400);
        assert_eq!(env.body["error"], "missing_correlation_id");
    }

    #[test]
    fn action_names_round_trip() {
        for action in [Action::Subscribe, Action::Publish, Action::Replay, Action::Ack] {
            assert_eq!(Action::parse(Some(action.as_str())).unwrap(), action);
        }
    }
}

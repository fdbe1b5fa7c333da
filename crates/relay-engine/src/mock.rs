//! Scriptable collaborators for tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_core::{ConnectionId, Transport, TransportError};

use crate::clock::Clock;

/// How the mock reacts to a post for one connection.
#[derive(Clone, Debug)]
pub enum MockBehavior {
    Gone,
    Unavailable(String),
    /// Sleep before accepting the frame.
    Delay(Duration),
}

#[derive(Default)]
struct MockState {
    sent: Vec<(ConnectionId, Bytes)>,
    scripted: HashMap<ConnectionId, MockBehavior>,
    calls: usize,
}

/// In-memory transport that records every accepted frame.
/// Connections without a scripted behavior accept immediately.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, connection_id: &ConnectionId, behavior: MockBehavior) {
        let _ = self
            .state
            .lock()
            .scripted
            .insert(connection_id.clone(), behavior);
    }

    /// Posts attempted, including failed ones.
    pub fn call_count(&self) -> usize {
        self.state.lock().calls
    }

    /// Frames accepted for `connection_id`, decoded as JSON.
    pub fn frames_for(&self, connection_id: &ConnectionId) -> Vec<serde_json::Value> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|(id, _)| id == connection_id)
            .filter_map(|(_, data)| serde_json::from_slice(data).ok())
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn post_to_connection(
        &self,
        connection_id: &ConnectionId,
        data: Bytes,
    ) -> Result<(), TransportError> {
        let behavior = {
            let mut state = self.state.lock();
            state.calls += 1;
            state.scripted.get(connection_id).cloned()
        };
        match behavior {
            Some(MockBehavior::Gone) => return Err(TransportError::Gone(connection_id.clone())),
            Some(MockBehavior::Unavailable(reason)) => {
                return Err(TransportError::Unavailable(reason))
            }
            Some(MockBehavior::Delay(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }
        self.state.lock().sent.push((connection_id.clone(), data));
        Ok(())
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

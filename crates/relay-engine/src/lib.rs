pub mod broadcast;
pub mod clock;
pub mod context;
pub mod delivery;
pub mod error;
pub mod relay;
pub mod replay;
pub mod subscriptions;

pub mod mock;

pub use broadcast::{PublishOutcome, Publisher};
pub use clock::{Clock, SystemClock};
pub use context::Invocation;
pub use error::RelayError;
pub use relay::{Relay, RelayConfig, RelayDeps};
pub use replay::{AckOutcome, ReplayOutcome, ReplayService};
pub use subscriptions::{resolve_correlation_id, SubscriptionManager};

pub mod connection;
pub mod delivery;
pub mod ids;
pub mod notification;
pub mod transport;

pub use connection::ConnectionRecord;
pub use delivery::DeliveryReport;
pub use ids::{ConnectionId, CorrelationId};
pub use notification::{Notification, NotificationRecord};
pub use transport::{Transport, TransportError};

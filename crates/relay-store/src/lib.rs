pub mod connections;
pub mod database;
pub mod error;
pub mod notifications;
pub mod row_helpers;
pub mod schema;

pub use connections::{ConnectionRepo, ConnectionStore};
pub use database::Database;
pub use error::StoreError;
pub use notifications::{NotificationRepo, NotificationStore};

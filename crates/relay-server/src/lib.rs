pub mod client;
pub mod config;
pub mod protocol;
pub mod router;
pub mod server;
pub mod sweeper;

pub use client::ClientRegistry;
pub use config::ServerConfig;
pub use server::{build_router, start, AppState, ServerHandle};

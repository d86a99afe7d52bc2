pub mod broadcaster;
pub mod client;
pub mod event_source;
pub mod lifecycle;
pub mod server;

#[cfg(test)]
mod test_support;

pub use broadcaster::{BroadcastConfig, BroadcastError, BroadcastReport, Broadcaster, DeliveryOutcome};
pub use client::ClientRegistry;
pub use lifecycle::{LifecycleError, LifecycleHandler};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};

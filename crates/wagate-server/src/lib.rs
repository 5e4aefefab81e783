use std::sync::Arc;

pub mod apps;
pub mod auth;
pub mod dirs;
pub mod handlers;
pub mod migrations;
pub mod queue;
pub mod server;
pub mod session;
pub mod store;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: store::Store,
    pub sessions: session::SessionManager,
    /// App bindings, fixed at startup.
    pub runtime: Arc<apps::CapabilityRuntime>,
    pub resolver: auth::SessionAuthResolver,
}

pub use server::{read_key_file, run, ServerConfig};

pub mod config;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod mailaddr;
pub mod stats;

pub use tracing;

/// Control signal broadcast to long-running components.
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
}

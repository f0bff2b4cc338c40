//! # PasteBeam
//!
//! Clipboard capture, classification and peer replication service.
//!
//! PasteBeam watches the local system clipboard, turns native clipboard
//! contents into typed, persisted records, and replicates new records to
//! paired peer devices over an authenticated, encrypted channel. Slow
//! side-effects (file transfer, preview rendering, cleanup) run through
//! a durable background task queue with bounded concurrency and retry.

pub mod cli;
pub mod clipboard;
pub mod collect;
pub mod config;
pub mod discovery;
pub mod monitor;
pub mod net;
pub mod pairing;
pub mod peers;
pub mod plugins;
pub mod postprocess;
pub mod record;
pub mod render;
pub mod store;
pub mod sync;
pub mod tasks;
pub mod util;

pub use config::Config;

/// Result type alias for PasteBeam operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for PasteBeam operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Clipboard port error
    #[error("Clipboard error: {0}")]
    Clipboard(#[from] clipboard::ClipboardError),

    /// Collection pipeline error
    #[error("Collection error: {0}")]
    Collect(#[from] collect::CollectError),

    /// Storage error
    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),

    /// Pairing or key error
    #[error("Pairing error: {0}")]
    Pairing(#[from] pairing::PairingError),

    /// Sync error
    #[error("Sync error: {0}")]
    Sync(#[from] sync::SyncError),

    /// Transport error
    #[error("Transport error: {0}")]
    Net(#[from] net::NetError),

    /// Task execution error
    #[error("Task error: {0}")]
    Task(#[from] tasks::TaskError),

    /// Discovery error
    #[error("Discovery error: {0}")]
    Discovery(#[from] discovery::DiscoveryError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

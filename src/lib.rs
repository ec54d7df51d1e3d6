// GamePatcher - applies xdelta patches to 3DS game containers
//
// This is the library crate containing the resolver, the patching pipeline and its
// collaborators. The binary crate (main.rs) provides the command line entry point.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod services;
pub mod state;

// Re-export commonly used types for convenience
pub use config::ConfigManager;
pub use metrics::Metrics;
pub use models::{ContainerKind, FileEntry, FileListing, Mapping, PatcherConfig, VersionCode};
pub use state::{StateChange, StateManager};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

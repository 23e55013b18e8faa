//! Deckhouse Mirror Core - Foundational Types
//!
//! Error taxonomy, operation context, module filters, progress events and
//! logging helpers shared by the mirror engine.

pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod log;

// Re-export commonly used types
pub use config::{LogLevel, MirrorContext, RegistryAuth, RetryConfig, ValidationMode};
pub use error::{MirrorError, Result, ResultExt};
pub use event::{EventEmitter, MirrorEvent};
pub use filter::ModuleFilter;

/// Mirror core version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

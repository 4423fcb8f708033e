//! Real-time sync and resource data access for the portfolio dashboard.
//!
//! Modules are feature gated the same way the rest of the workspace is; the
//! `full` feature (on by default) enables everything.

#[cfg(feature = "configs")]
pub mod configs;
#[cfg(feature = "loggers")]
pub mod loggers;
#[cfg(feature = "provider")]
pub mod provider;
#[cfg(feature = "retrieve")]
pub mod retrieve;
#[cfg(feature = "sync")]
pub mod sync;

#[cfg(feature = "configs")]
pub use configs::config_sync::{load_config, SyncConfig, SyncSettings};
#[cfg(feature = "sync")]
pub use sync::{ConnectionManager, ConnectionState, MessageRouter, ReconnectPolicy, Subscription};
#[cfg(feature = "loggers")]
pub use loggers::setup::setup_logging;
#[cfg(feature = "provider")]
pub use provider::{DataProvider, ProviderError, Resource};

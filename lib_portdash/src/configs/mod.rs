//! # Configuration Modules
//!
//! Layered configuration for the sync client (defaults, JSON file,
//! environment and command line).

/// Provides the `SyncConfig` layers and the validated `SyncSettings`.
pub mod config_sync;

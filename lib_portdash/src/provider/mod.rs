//! # Resource Data Provider
//!
//! Generic `list` / `get` / `get_related` / `update` access to the dashboard
//! REST backend.
//!
//! - **`resources`**: Canonical resource names, the verb set and the static
//!   endpoint table.
//! - **`record`**: Normalization of backend payloads into records with a
//!   guaranteed `id`.
//! - **`data_provider`**: The async `DataProvider` issuing the requests.
//! - **`error`**: `ProviderError`.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Async provider over the REST backend.
pub mod data_provider;
/// Provider failures.
pub mod error;
/// Record normalization.
pub mod record;
/// Resource names and the endpoint table.
pub mod resources;

pub use data_provider::DataProvider;
pub use error::{ProviderError, ProviderResult};
pub use record::{Record, RecordSet};
pub use resources::{ConfigType, ListParams, Resource, Verb};

//! # Data Retrieval Module
//!
//! Generic HTTP plumbing shared by the resource data provider.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: A generic HTTP `ApiClient` built on `reqwest` and
//!   `reqwest-middleware`, featuring automatic retries with exponential
//!   backoff. Non-2xx answers are returned as data, not errors, so callers
//!   decide how to surface them.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Generic HTTP API client with retry middleware for resilient network requests.
pub mod ky_http;

//! Vigil Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared data model, utilities, and error handling for the Vigil pipeline.
//!
//! # Overview
//!
//! Every stage of the pipeline exchanges the records defined here:
//!
//! - **Types**: [`types::RawEnvelope`], [`types::ParsedRecord`],
//!   [`types::CanonicalRecord`], [`types::FailureRecord`] and the [`types::Channel`]
//!   routing key
//! - **Checksums**: sha256 helpers used for payload integrity checks
//! - **Logging**: tracing subscriber setup shared by every process
//! - **Error Handling**: [`VigilError`] and the crate [`Result`] alias
//!
//! # Example
//!
//! ```no_run
//! use vigil_common::types::RawEnvelope;
//!
//! fn route(envelope: &RawEnvelope) -> String {
//!     envelope.channel.raw_topic()
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{Result, VigilError};

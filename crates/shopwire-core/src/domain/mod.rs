//! # Domain Models
//!
//! Types shared between provider adapters and the orchestration layer.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ProductRecord`] | Normalized product returned by every adapter |
//! | [`UtcDateTime`] | UTC wall-clock timestamp for display fields |
//!
//! The orchestration layer never interprets a [`ProductRecord`] beyond its
//! `(source, id)` identity, which is used to de-duplicate merged searches.

mod product;
mod timestamp;

pub use product::{validate_currency_code, ProductRecord};
pub use timestamp::UtcDateTime;

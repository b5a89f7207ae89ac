//! Reference provider adapters.

mod fixture;
mod http_json;

pub use fixture::FixtureSource;
pub use http_json::JsonApiSource;

//! HTTP client for the payment processor's REST API.

pub mod processor;

pub use processor::{ProcessorClient, ProviderError};

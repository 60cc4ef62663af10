//! Stream handlers that deliver payloads to external systems.

pub mod http;

pub use http::{DeliveryMode, HttpProcessor, HttpProcessorConfig, HttpProcessorError};

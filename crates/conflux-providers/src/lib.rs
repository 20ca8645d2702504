//! Provider loading and the built-in integration handlers for Conflux.
//!
//! This crate implements the whitelist-gated side of the execution
//! subsystem: the `ProviderHandler` contract, the fixed `ProviderKind`
//! registry, the caching `ProviderLoader`, and the three built-in
//! integrations (generic HTTP endpoint, cloud function, external workflow).

pub mod cloud_function;
pub mod handler;
pub mod http_endpoint;
pub mod loader;
pub mod registry;
pub mod workflow;

pub use cloud_function::CloudFunctionHandler;
pub use handler::{DynProvider, ProviderHandler};
pub use http_endpoint::HttpEndpointHandler;
pub use loader::ProviderLoader;
pub use registry::ProviderKind;
pub use workflow::ExternalWorkflowHandler;

/// Names accepted for remote functions and workflows: non-empty,
/// alphanumeric plus `-` and `_`. Anything else would end up in a URL path.
pub(crate) fn valid_resource_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------

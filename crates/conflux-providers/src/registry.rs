//! The closed provider whitelist.
//!
//! The set of loadable integrations is fixed in code: a key resolves to a
//! constructor only through this enum, never through configuration, a
//! database row, or a request payload. Adding a provider means adding a
//! variant here and is reviewed like any other code change.

use conflux_types::{ProviderDescriptor, Result};

use crate::cloud_function::CloudFunctionHandler;
use crate::handler::DynProvider;
use crate::http_endpoint::HttpEndpointHandler;
use crate::workflow::ExternalWorkflowHandler;

// ---------------------------------------------------------------------------
// ProviderKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    HttpEndpoint,
    CloudFunction,
    ExternalWorkflow,
}

impl ProviderKind {
    pub const fn key(&self) -> &'static str {
        match self {
            ProviderKind::HttpEndpoint => "http_endpoint",
            ProviderKind::CloudFunction => "cloud_function",
            ProviderKind::ExternalWorkflow => "external_workflow",
        }
    }

    pub const fn display_name(&self) -> &'static str {
        match self {
            ProviderKind::HttpEndpoint => "Generic HTTP Endpoint",
            ProviderKind::CloudFunction => "Cloud Function Invocation",
            ProviderKind::ExternalWorkflow => "External Workflow Trigger",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "http_endpoint" => Some(ProviderKind::HttpEndpoint),
            "cloud_function" => Some(ProviderKind::CloudFunction),
            "external_workflow" => Some(ProviderKind::ExternalWorkflow),
            _ => None,
        }
    }

    pub const fn all() -> &'static [ProviderKind] {
        &[
            ProviderKind::HttpEndpoint,
            ProviderKind::CloudFunction,
            ProviderKind::ExternalWorkflow,
        ]
    }

    /// Construct a fresh handler instance with the descriptor's runtime
    /// parameters. Construction failures classify as `LoadFailed`.
    pub fn construct(&self, descriptor: &ProviderDescriptor) -> Result<DynProvider> {
        match self {
            ProviderKind::HttpEndpoint => {
                Ok(DynProvider::new(HttpEndpointHandler::from_descriptor(descriptor)?))
            }
            ProviderKind::CloudFunction => {
                Ok(DynProvider::new(CloudFunctionHandler::from_descriptor(descriptor)?))
            }
            ProviderKind::ExternalWorkflow => {
                Ok(DynProvider::new(ExternalWorkflowHandler::from_descriptor(descriptor)?))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips_through_from_key() {
        for kind in ProviderKind::all() {
            assert_eq!(ProviderKind::from_key(kind.key()), Some(*kind));
        }
    }

    #[test]
    fn unknown_keys_resolve_to_none() {
        assert_eq!(ProviderKind::from_key("MALICIOUS_PROVIDER"), None);
        assert_eq!(ProviderKind::from_key(""), None);
        // Keys are exact; no case folding
        assert_eq!(ProviderKind::from_key("HTTP_ENDPOINT"), None);
    }

    #[test]
    fn whitelist_is_exactly_three_kinds() {
        assert_eq!(ProviderKind::all().len(), 3);
    }

    #[test]
    fn display_names_are_populated() {
        for kind in ProviderKind::all() {
            assert!(!kind.display_name().is_empty());
        }
    }

    #[test]
    fn construct_http_endpoint_with_default_descriptor() {
        let descriptor = conflux_types::ProviderDescriptor::for_key("http_endpoint");
        let provider = ProviderKind::HttpEndpoint.construct(&descriptor).unwrap();
        assert_eq!(provider.key(), "http_endpoint");
    }
}

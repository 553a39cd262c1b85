//! Middleware shared by every HTTP-facing binary (currently just the ingress, C11)

pub mod request_tracking;
pub mod resilience;
pub mod security_headers;

pub use request_tracking::{
    request_id_layer, request_id_propagation_layer, sensitive_headers_layer,
    RequestTrackingConfig, PROPAGATE_HEADERS, SENSITIVE_HEADERS,
};
pub use resilience::ResilienceConfig;
pub use security_headers::apply_security_headers;

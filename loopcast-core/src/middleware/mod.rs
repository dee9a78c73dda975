//! Middleware modules for authentication, request tracking and observability.

// Token abstraction layer (always available)
pub mod token;

// PASETO authentication (default)
pub mod paseto;

pub mod request_tracking;

pub mod admin_impersonation;
pub mod correlation;

#[cfg(feature = "otel-metrics")]
pub mod metrics;

// Token abstraction exports (always available)
pub use token::{Claims, TokenValidator};

// PASETO exports (default)
pub use paseto::PasetoAuth;

pub use request_tracking::{
    request_id_layer, request_id_propagation_layer, sensitive_headers_layer,
    RequestTrackingConfig, PROPAGATE_HEADERS, SENSITIVE_HEADERS,
};

pub use admin_impersonation::middleware as admin_impersonation_layer;
pub use correlation::{middleware as correlation_layer, CorrelationId, CORRELATION_ID_HEADER};

#[cfg(feature = "otel-metrics")]
pub use metrics::{metric_labels, metric_names, MetricsConfig};

//! Correlation-id tracking, independent of the per-hop request id
//! ([`crate::ids::RequestId`]): a single correlation id follows a logical
//! operation across every request it causes, including background work
//! spawned mid-request (audio submission, impression tracking), which
//! picks it back up via `tracing::Span::current()` rather than needing it
//! threaded through explicitly.

use axum::{body::Body, extract::Request, middleware::Next, response::Response};
use uuid::Uuid;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// A correlation id, reused from an inbound header when present or
/// generated fresh otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    fn from_header_value(value: &str) -> Option<Self> {
        Uuid::parse_str(value).ok().map(Self)
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Attach a [`CorrelationId`] to the request's extensions and to a
/// `tracing` span wrapping the rest of the request, then echo it back on
/// the response so callers can correlate across retries.
pub async fn middleware(mut request: Request<Body>, next: Next) -> Response {
    let correlation_id = request
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(CorrelationId::from_header_value)
        .unwrap_or_else(CorrelationId::generate);

    request.extensions_mut().insert(correlation_id);

    let span = tracing::info_span!("request", correlation_id = %correlation_id);
    let mut response = tracing::Instrument::instrument(next.run(request), span).await;

    if let Ok(header_value) = http::HeaderValue::from_str(&correlation_id.to_string()) {
        response.headers_mut().insert(
            http::HeaderName::from_static(CORRELATION_ID_HEADER),
            header_value,
        );
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_a_well_formed_inbound_header() {
        let id = Uuid::now_v7();
        let parsed = CorrelationId::from_header_value(&id.to_string()).unwrap();
        assert_eq!(parsed.to_string(), id.to_string());
    }

    #[test]
    fn rejects_a_malformed_header() {
        assert!(CorrelationId::from_header_value("not-a-uuid").is_none());
    }

    #[test]
    fn generated_ids_are_distinct() {
        let a = CorrelationId::generate();
        let b = CorrelationId::generate();
        assert_ne!(a, b);
    }
}

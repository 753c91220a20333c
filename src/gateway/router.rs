//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use super::lookup::{DeviceGateway, LookupOutcome};

/// Shared application state
pub struct AppState {
    /// Device lookup orchestration
    pub gateway: Arc<DeviceGateway>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(device_handler))
        .route("/device", get(device_handler))
        .route("/health", get(health_handler))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Look up the calling device from its forwarded certificate headers
async fn device_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let outcome = state.gateway.lookup(&headers).await;
    if wants_html(&headers) {
        render_html(&outcome)
    } else {
        render_json(outcome)
    }
}

/// Liveness and cache counters
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "caches": state.gateway.stats(),
    }))
}

/// HTTP status for each terminal outcome
pub fn status_for(outcome: &LookupOutcome) -> StatusCode {
    match outcome {
        LookupOutcome::Found(_) => StatusCode::OK,
        LookupOutcome::Forbidden(_) => StatusCode::FORBIDDEN,
        LookupOutcome::NotFound(_) => StatusCode::NOT_FOUND,
        LookupOutcome::BadGateway(_) => StatusCode::BAD_GATEWAY,
    }
}

/// Error class and caller-facing message for a failed outcome
fn failure_parts(outcome: &LookupOutcome) -> Option<(&'static str, String)> {
    match outcome {
        LookupOutcome::Found(_) => None,
        LookupOutcome::Forbidden(e) => Some((
            "forbidden",
            format!("{e}. Please ensure the client certificate is forwarded by the TLS terminator."),
        )),
        LookupOutcome::NotFound(id) => {
            Some(("not_found", format!("Device {id} is not a managed device")))
        }
        LookupOutcome::BadGateway(e) => Some(("bad_gateway", e.to_string())),
    }
}

fn render_json(outcome: LookupOutcome) -> Response {
    let status = status_for(&outcome);
    match failure_parts(&outcome) {
        Some((error, message)) => {
            (status, Json(json!({ "error": error, "message": message }))).into_response()
        }
        None => match outcome {
            LookupOutcome::Found(device) => (status, Json(device)).into_response(),
            _ => status.into_response(),
        },
    }
}

fn render_html(outcome: &LookupOutcome) -> Response {
    let status = status_for(outcome);
    let body = match (outcome, failure_parts(outcome)) {
        (LookupOutcome::Found(device), _) => {
            let mut rows = String::new();
            for (key, value) in device.iter() {
                rows.push_str("<tr><td>");
                rows.push_str(&escape_html(key));
                rows.push_str("</td><td>");
                rows.push_str(&escape_html(value));
                rows.push_str("</td></tr>");
            }
            format!("<h1>Device Information</h1><table>{rows}</table>")
        }
        (_, Some((_, message))) => format!(
            "<h1>{}</h1><p>{}</p>",
            status.canonical_reason().unwrap_or("Error"),
            escape_html(&message)
        ),
        (_, None) => String::new(),
    };
    (status, Html(body)).into_response()
}

/// HTML only when the client asks for it and does not also accept JSON
fn wants_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/html") && !accept.contains("application/json"))
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    use crate::error::{FetchError, IdentityError, TokenError};
    use crate::gateway::UpstreamFailure;
    use crate::graph::DeviceMetadata;

    #[test]
    fn outcome_status_mapping() {
        let found = LookupOutcome::Found(DeviceMetadata::default());
        let forbidden = LookupOutcome::Forbidden(IdentityError::Missing("x".to_string()));
        let not_found = LookupOutcome::NotFound("d".to_string());
        let token = LookupOutcome::BadGateway(UpstreamFailure::Token(
            TokenError::AcquisitionFailed("HTTP 401".to_string()),
        ));
        let device = LookupOutcome::BadGateway(UpstreamFailure::Device(FetchError::Timeout));

        assert_eq!(status_for(&found), StatusCode::OK);
        assert_eq!(status_for(&forbidden), StatusCode::FORBIDDEN);
        assert_eq!(status_for(&not_found), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&token), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(&device), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn escape_html_neutralises_markup() {
        assert_eq!(
            escape_html(r#"<script>alert("x&y")</script>'"#),
            "&lt;script&gt;alert(&quot;x&amp;y&quot;)&lt;/script&gt;&#39;"
        );
    }

    #[test]
    fn html_requested_only_without_json() {
        let mut headers = HeaderMap::new();
        assert!(!wants_html(&headers));

        headers.insert(header::ACCEPT, HeaderValue::from_static("text/html,*/*;q=0.8"));
        assert!(wants_html(&headers));

        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/json, text/html"),
        );
        assert!(!wants_html(&headers));
    }
}

//! HTTP response building module
//!
//! Builders for the responses the server produces on its own, decoupled from
//! any application logic.

use http_body_util::Full;
use hyper::body::Bytes;
use http::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use http::StatusCode;

use super::Response;

/// Build a `text/plain` response with the given status and body
pub fn build_text_response(status: StatusCode, body: impl Into<Bytes>) -> Response {
    let body = body.into();
    http::Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(body.clone()))
        .unwrap_or_else(|e| {
            log_build_error(status, &e);
            http::Response::new(Full::new(body))
        })
}

/// Build an error response whose body is the canonical reason phrase,
/// e.g. `500 Internal Server Error`
pub fn build_error_response(status: StatusCode) -> Response {
    let reason = status.canonical_reason().unwrap_or("Error");
    build_text_response(status, format!("{} {reason}", status.as_u16()))
}

/// Build 404 Not Found response
pub fn build_404_response() -> Response {
    build_error_response(StatusCode::NOT_FOUND)
}

/// Build 405 Method Not Allowed response
pub fn build_405_response(allow: &'static str) -> Response {
    let mut response = build_error_response(StatusCode::METHOD_NOT_ALLOWED);
    response
        .headers_mut()
        .insert(ALLOW, HeaderValue::from_static(allow));
    response
}

fn log_build_error(status: StatusCode, err: &http::Error) {
    tracing::error!("failed to build {status} response: {err}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn error_response_carries_reason_phrase() {
        let response = build_error_response(StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"413 Payload Too Large");
    }

    #[test]
    fn method_not_allowed_lists_allowed_methods() {
        let response = build_405_response("GET, HEAD");
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[ALLOW], "GET, HEAD");
    }
}

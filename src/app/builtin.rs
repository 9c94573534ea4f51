//! Applications shipped with the binary.

use http::header::CONTENT_TYPE;
use http::{Method, StatusCode};
use http_body_util::Full;

use super::{response, Request, RequestError, Response};

/// `builtin:echo`: answers with the request body and content type.
pub async fn echo(request: Request) -> Result<Response, RequestError> {
    let (parts, body) = request.into_parts();
    let mut builder = http::Response::builder().status(StatusCode::OK);
    if let Some(content_type) = parts.headers.get(CONTENT_TYPE) {
        builder = builder.header(CONTENT_TYPE, content_type);
    }
    builder
        .body(Full::new(body))
        .map_err(|e| RequestError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// `builtin:hello`: a plain-text greeting on `/`.
pub async fn hello(request: Request) -> Result<Response, RequestError> {
    if request.uri().path() != "/" {
        return Ok(response::build_404_response());
    }
    match *request.method() {
        Method::GET | Method::HEAD => Ok(response::build_text_response(
            StatusCode::OK,
            "Hello world",
        )),
        _ => Ok(response::build_405_response("GET, HEAD")),
    }
}

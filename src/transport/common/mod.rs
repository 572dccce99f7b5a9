pub mod http_header;
pub mod sse;

use axum::{
    body::Body,
    http::{header, Response, StatusCode},
};

use crate::model::ErrorData;

/// `404` carrying the JSON-RPC `-32001` payload the peer SDKs expect when a
/// presented session id is unknown.
pub fn session_not_found_response() -> Response<Body> {
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "error": ErrorData::session_not_found(),
    });
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(header::CONTENT_TYPE, http_header::JSON_MIME_TYPE)
        .body(Body::from(body.to_string()))
        .expect("static response must build")
}

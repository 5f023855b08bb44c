//! Panic recovery.
//!
//! A panicking handler task must not tear down the connection silently; the
//! catch-panic layer converts it to a 500 with the recovered message, and the
//! full payload is logged.

use std::any::Any;

use axum::body::Body;
use axum::http::{header, Response, StatusCode};
use serde_json::json;
use tracing::error;

/// Response builder handed to `tower_http::catch_panic::CatchPanicLayer`.
pub fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let message = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic".to_string()
    };

    error!(panic = %message, "handler panicked");

    let body = json!({
        "error": "Internal Server Error",
        "message": message,
    });

    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

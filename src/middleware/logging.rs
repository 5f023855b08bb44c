//! Structured request logging.

use std::time::Instant;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use tracing::info;

use super::ClientIp;

pub async fn middleware(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let client_ip = req.extensions().get::<ClientIp>().map(|c| c.0);
    let start = Instant::now();

    let response = next.run(req).await;

    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        client_ip = ?client_ip,
        elapsed_ms = start.elapsed().as_millis() as u64,
        cache = response
            .headers()
            .get("x-cache")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-"),
        "request"
    );

    response
}

//! Metrics and health endpoint
//!
//! Minimal HTTP surface: `/metrics` serves the prometheus exposition,
//! `/health` a one-line JSON status. The admin dashboard proper lives
//! elsewhere; this exists so the process can be scraped and probed.

use anyhow::Result;
use prometheus::Encoder;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::metrics;

/// Serve metrics and health checks until the process exits
pub async fn endpoint_server(port: u16) -> Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("metrics endpoint listening on {addr}");

    loop {
        match listener.accept().await {
            Ok((mut socket, _peer)) => {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1_024];
                    let Ok(n) = socket.read(&mut buf).await else {
                        return;
                    };
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let response = route(&request);
                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!(error = %e, "endpoint write failed");
                    }
                });
            }
            Err(e) => error!(error = %e, "endpoint accept failed"),
        }
    }
}

fn route(request: &str) -> String {
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    match path {
        "/metrics" => {
            let encoder = prometheus::TextEncoder::new();
            let families = metrics::metrics().registry().gather();
            let mut body = Vec::new();
            if encoder.encode(&families, &mut body).is_err() {
                return http_response(500, "text/plain", "encode error");
            }
            http_response(
                200,
                "text/plain; version=0.0.4",
                &String::from_utf8_lossy(&body),
            )
        }
        "/health" => {
            let saturated = metrics::metrics().flush_saturated();
            let errors: Vec<String> = metrics::metrics()
                .error_counts_by_class()
                .into_iter()
                .map(|(class, count)| format!("\"{class}\":{count}"))
                .collect();
            let body = format!(
                "{{\"status\":\"{}\",\"flush_error_rate\":{:.3},\"errors_5m\":{{{}}}}}",
                if saturated { "degraded" } else { "ok" },
                metrics::metrics().flush_error_rate(),
                errors.join(",")
            );
            http_response(if saturated { 503 } else { 200 }, "application/json", &body)
        }
        _ => http_response(404, "text/plain", "not found"),
    }
}

fn http_response(status: u16, content_type: &str, body: &str) -> String {
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    };
    format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_route_serves_exposition() {
        let response = route("GET /metrics HTTP/1.1\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 200"));
    }

    #[test]
    fn health_route_reports_status() {
        let response = route("GET /health HTTP/1.1\r\n\r\n");
        assert!(response.contains("\"status\""));
    }

    #[test]
    fn unknown_route_is_404() {
        let response = route("GET /nope HTTP/1.1\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 404"));
    }
}

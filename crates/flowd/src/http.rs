use crate::metrics::Metrics;
use anyhow::{Context, Result};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{error, info};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Bind the metrics endpoint.
pub async fn bind_metrics(port: u16) -> Result<TcpListener> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics server on {}", addr))
}

/// Serve `/metrics` and `/health` until `cancel` fires.
pub async fn serve_metrics(listener: TcpListener, metrics: Arc<Metrics>, cancel: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!("Metrics server listening on http://{}/metrics", addr);
    }

    loop {
        let (stream, _) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Accept error: {}", e);
                    continue;
                }
            },
        };

        let io = TokioIo::new(stream);
        let metrics = Arc::clone(&metrics);

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let metrics = Arc::clone(&metrics);
                handle_request(req, metrics)
            });

            let conn = hyper::server::conn::http1::Builder::new().serve_connection(io, service);

            if let Err(e) = conn.await {
                error!("Connection error: {}", e);
            }
        });
    }
    info!("Metrics server stopped");
}

async fn handle_request<B>(req: Request<B>, metrics: Arc<Metrics>) -> Result<Response<String>, Infallible> {
    Ok(route(req.uri().path(), &metrics))
}

fn route(path: &str, metrics: &Metrics) -> Response<String> {
    match path {
        "/metrics" => {
            let mut response = Response::new(metrics.to_prometheus());
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        "/health" => Response::new("OK".to_string()),
        _ => {
            let mut response = Response::new("Not Found".to_string());
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_routes() {
        let metrics = Metrics::new();
        metrics.inc_fireflies_sent();

        let response = route("/metrics", &metrics);
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.body().contains("flowd_fireflies_sent_total 1"));
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "text/plain; version=0.0.4"
        );

        assert_eq!(route("/health", &metrics).body(), "OK");
        assert_eq!(route("/nope", &metrics).status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serve_until_cancelled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve_metrics(listener, Metrics::new(), cancel.clone()));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("OK"));

        cancel.cancel();
        server.await.unwrap();
    }
}

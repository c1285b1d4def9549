//! The protected target: a small file server instrumented per client IP so
//! the controller can read request rates, latencies, and CPU use.

mod metrics;

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tokio::time::Instant;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILES_DIR: &str = "/files";
const LISTEN_ADDR: &str = "0.0.0.0:8080";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let files_dir = std::env::var("FILES_DIR").unwrap_or_else(|_| DEFAULT_FILES_DIR.to_string());

    let files = Router::new()
        .fallback_service(ServeDir::new(&files_dir))
        .layer(middleware::from_fn(track_request));
    let app = Router::new()
        .route("/metrics", get(serve_metrics))
        .merge(files)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(LISTEN_ADDR).await?;
    info!("📁 file server listening on {LISTEN_ADDR}, serving {files_dir}");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Observes latency and status for every file request, labelled by the
/// client IP the gateway forwarded.
async fn track_request(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let ip = client_ip(&request, addr);
    let response = next.run(request).await;
    metrics::observe_request(start, response.status(), &ip);
    response
}

/// Behind the gateway the peer address is the gateway itself; prefer the
/// first hop of X-Forwarded-For when present.
fn client_ip(request: &Request, peer: SocketAddr) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|ip| ip.trim().to_string())
        .unwrap_or_else(|| peer.ip().to_string())
}

async fn serve_metrics() -> Response {
    match metrics::render() {
        Ok(body) => Response::builder()
            .header("content-type", "text/plain; version=0.0.4")
            .body(body.into())
            .unwrap_or_default(),
        Err(e) => {
            tracing::error!("failed to render metrics: {e}");
            Response::builder()
                .status(axum::http::StatusCode::INTERNAL_SERVER_ERROR)
                .body(Default::default())
                .unwrap_or_default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn forwarded_header_wins_over_peer_address() {
        let request = Request::builder()
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(Body::empty())
            .expect("request");
        let peer: SocketAddr = "10.0.0.2:9999".parse().expect("addr");
        assert_eq!(client_ip(&request, peer), "203.0.113.9");
    }

    #[test]
    fn peer_address_is_the_fallback() {
        let request = Request::builder().body(Body::empty()).expect("request");
        let peer: SocketAddr = "192.0.2.7:1234".parse().expect("addr");
        assert_eq!(client_ip(&request, peer), "192.0.2.7");
    }
}

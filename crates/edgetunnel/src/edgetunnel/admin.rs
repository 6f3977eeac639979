use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use futures_util::stream;
use serde::Serialize;
use tokio::{net::TcpListener, sync::watch};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::edgetunnel::{
    telemetry,
    tunnel::{engine::TunnelServer, shutdown_requested},
};

#[derive(Clone)]
pub struct AdminState {
    pub prom: telemetry::SharedPrometheusHandle,
    pub tunnel: Arc<TunnelServer>,
    pub config_path: PathBuf,
    /// Ends open `/events` streams so graceful shutdown can finish.
    pub shutdown: watch::Receiver<bool>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/routes", get(routes))
        .route("/circuits", get(circuits))
        .route("/config", get(config))
        .route("/events", get(events))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(admin_addr = %addr, "admin: listening");
    serve_listener(listener, state, shutdown).await
}

pub async fn serve_listener(
    listener: TcpListener,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown_requested(&mut shutdown).await })
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    peer_id: String,
}

async fn health(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            peer_id: st.tunnel.id().to_string(),
        }),
    )
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, st.prom.render())
}

async fn routes(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let snap = st.tunnel.routes().snapshot().await;
    (StatusCode::OK, Json(snap))
}

#[derive(Debug, Serialize)]
struct CircuitsResponse<T> {
    total: usize,
    neighbors: T,
}

async fn circuits(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let conns = st.tunnel.connections();
    (
        StatusCode::OK,
        Json(CircuitsResponse {
            total: conns.total(),
            neighbors: conns.snapshot(),
        }),
    )
}

#[derive(Debug, Serialize)]
struct ConfigResponse {
    path: String,
}

async fn config(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(ConfigResponse {
            path: st.config_path.display().to_string(),
        }),
    )
}

/// Server-sent topology events: the reachable snapshot first, then every
/// connect, disconnect and keepalive seen by this peer.
async fn events(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let watcher = st.tunnel.watch(st.shutdown.clone()).await;
    let events = stream::unfold(watcher, |mut w| async move {
        let ev = w.recv().await?;
        Some((Event::default().json_data(&ev), w))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    use super::*;
    use crate::edgetunnel::tunnel::{auth::NoAuth, engine::TunnelServerOptions};

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut s = TcpStream::connect(addr).await.unwrap();
        let req = format!("GET {path} HTTP/1.1\r\nHost: admin\r\nConnection: close\r\n\r\n");
        s.write_all(req.as_bytes()).await.unwrap();
        let mut out = String::new();
        s.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn serves_route_and_circuit_snapshots() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (stop, shutdown) = watch::channel(false);
        let state = AdminState {
            prom: Arc::new(PrometheusBuilder::new().build_recorder().handle()),
            tunnel: TunnelServer::new("hub", Arc::new(NoAuth), TunnelServerOptions::default()),
            config_path: PathBuf::from("/etc/edgetunnel/edgetunnel.toml"),
            shutdown: shutdown.clone(),
        };
        let serving = tokio::spawn(serve_listener(ln, state, shutdown));

        let health = get(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"), "{health}");
        assert!(health.contains(r#""peer_id":"hub""#), "{health}");

        let routes = get(addr, "/routes").await;
        assert!(routes.contains(r#""local":"hub""#), "{routes}");
        assert!(routes.contains(r#""neighbors":[]"#), "{routes}");

        let circuits = get(addr, "/circuits").await;
        assert!(circuits.contains(r#""total":0"#), "{circuits}");

        let config = get(addr, "/config").await;
        assert!(config.contains("edgetunnel.toml"), "{config}");

        stop.send(true).unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn events_stream_starts_with_a_snapshot_and_ends_on_shutdown() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (stop, shutdown) = watch::channel(false);
        let state = AdminState {
            prom: Arc::new(PrometheusBuilder::new().build_recorder().handle()),
            tunnel: TunnelServer::new("hub", Arc::new(NoAuth), TunnelServerOptions::default()),
            config_path: PathBuf::from("edgetunnel.toml"),
            shutdown: shutdown.clone(),
        };
        let serving = tokio::spawn(serve_listener(ln, state, shutdown));

        let mut s = TcpStream::connect(addr).await.unwrap();
        s.write_all(b"GET /events HTTP/1.1\r\nHost: admin\r\n\r\n")
            .await
            .unwrap();
        let mut seen = String::new();
        let mut buf = [0u8; 1024];
        while !seen.contains(r#""from":"hub""#) {
            let n = tokio::time::timeout(Duration::from_secs(2), s.read(&mut buf))
                .await
                .expect("no snapshot event")
                .unwrap();
            assert_ne!(n, 0, "stream closed early: {seen}");
            seen.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        assert!(seen.starts_with("HTTP/1.1 200"), "{seen}");
        assert!(seen.contains("text/event-stream"), "{seen}");
        assert!(seen.contains(r#""kind":"connected""#), "{seen}");

        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .expect("open event stream held up shutdown")
            .unwrap()
            .unwrap();
    }
}

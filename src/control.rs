use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::{BrokerEnv, FuzzConfig};

/// Read-only snapshot served to external orchestrators; taken once at
/// startup, which is when both the environment and the configuration are
/// fixed for the process lifetime.
struct ControlState {
    env: Value,
    config: Value,
}

/// Query surface for the broker: resolved environment and configuration
/// over plain HTTP/JSON. Holds no authority over the worker pool.
pub struct ControlService {
    port: u16,
    state: Arc<ControlState>,
}

impl ControlService {
    pub fn new(env: &BrokerEnv, config: &FuzzConfig) -> Self {
        let state = ControlState {
            env: serde_json::to_value(env).unwrap_or(Value::Null),
            config: serde_json::to_value(config.sections_map()).unwrap_or(Value::Null),
        };
        Self {
            port: env.control_port,
            state: Arc::new(state),
        }
    }

    fn router(state: Arc<ControlState>) -> Router {
        Router::new()
            .route("/env", get(get_env))
            .route("/config", get(get_config))
            .route("/health", get(health))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve until `stop` is notified, then drain without accepting new
    /// connections. A bind failure disables the service but not the
    /// campaign; this is a query surface only.
    pub async fn serve(self, stop: Arc<Notify>) {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(%addr, %err, "control interface failed to bind");
                return;
            }
        };
        info!(%addr, "control interface listening");
        if let Err(err) = Self::run(listener, self.state, stop).await {
            error!(%err, "control interface failed");
        }
    }

    async fn run(
        listener: TcpListener,
        state: Arc<ControlState>,
        stop: Arc<Notify>,
    ) -> std::io::Result<()> {
        axum::serve(listener, Self::router(state))
            .with_graceful_shutdown(async move { stop.notified().await })
            .await
    }
}

async fn get_env(State(state): State<Arc<ControlState>>) -> Json<Value> {
    Json(state.env.clone())
}

async fn get_config(State(state): State<Arc<ControlState>>) -> Json<Value> {
    Json(state.config.clone())
}

async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.expect("connect failed");
        let request = format!("GET {path} HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n");
        stream
            .write_all(request.as_bytes())
            .await
            .expect("write failed");
        let mut response = String::new();
        stream
            .read_to_string(&mut response)
            .await
            .expect("read failed");
        response
    }

    #[tokio::test]
    async fn serves_queries_and_stops_gracefully() {
        let state = Arc::new(ControlState {
            env: json!({"id": "h1", "guid": "c0ffee"}),
            config: json!({"ENV": {"AFL_SKIP_CPUFREQ": "1"}}),
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
        let addr = listener.local_addr().expect("no local addr");
        let stop = Arc::new(Notify::new());
        let server = tokio::spawn(ControlService::run(listener, state, stop.clone()));

        let response = get(addr, "/health").await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("ok"));

        let response = get(addr, "/env").await;
        assert!(response.contains("c0ffee"));

        let response = get(addr, "/config").await;
        assert!(response.contains("AFL_SKIP_CPUFREQ"));

        stop.notify_one();
        tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .expect("server did not stop")
            .expect("server task panicked")
            .expect("server failed");
    }
}

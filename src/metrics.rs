//! Metrics endpoint
//!
//! A plain-text counter dump on its own listener, assembled by querying the
//! same request channels the control API uses. Subsystems register their
//! handles after every (re)build; the endpoint renders whatever is currently
//! registered.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::front::hls::HlsServerHandle;
use crate::front::webrtc::WebRtcServerHandle;
use crate::path::manager::PathManagerHandle;
use crate::server::{parse_address, ServerHandle};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Registered {
    manager: Option<PathManagerHandle>,
    servers: Vec<(&'static str, ServerHandle)>,
    hls: Option<HlsServerHandle>,
    webrtc: Option<WebRtcServerHandle>,
}

pub struct Metrics {
    local_addr: SocketAddr,
    registered: Arc<Mutex<Registered>>,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Metrics {
    pub async fn new(address: &str, parent: &CancellationToken) -> io::Result<Metrics> {
        let listener = tokio::net::TcpListener::bind(parse_address(address)?).await?;
        let local_addr = listener.local_addr()?;

        let registered: Arc<Mutex<Registered>> = Arc::default();
        let app = Router::new()
            .route("/metrics", get(render))
            .with_state(registered.clone());

        let token = parent.child_token();
        let tracker = TaskTracker::new();

        tracing::info!(addr = %local_addr, "metrics listener opened");

        {
            let token = token.clone();
            tracker.spawn(async move {
                let shutdown = async move { token.cancelled().await };
                if let Err(e) = axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown)
                    .await
                {
                    tracing::error!(error = %e, "metrics server failed");
                }
            });
        }

        Ok(Metrics {
            local_addr,
            registered,
            token,
            tracker,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registered> {
        self.registered.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_path_manager(&self, handle: PathManagerHandle) {
        self.lock().manager = Some(handle);
    }

    /// (Re)registers one raw-TCP front-end under its metric prefix.
    pub fn set_server(&self, label: &'static str, handle: ServerHandle) {
        let mut reg = self.lock();
        reg.servers.retain(|(l, _)| *l != label);
        reg.servers.push((label, handle));
    }

    pub fn set_hls(&self, handle: HlsServerHandle) {
        self.lock().hls = Some(handle);
    }

    pub fn set_webrtc(&self, handle: WebRtcServerHandle) {
        self.lock().webrtc = Some(handle);
    }

    /// Forgets every registered subsystem (used while they restart).
    pub fn clear(&self) {
        *self.lock() = Registered::default();
    }

    pub async fn close(&self) {
        self.token.cancel();
        self.tracker.close();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("metrics shutdown timed out");
        }
        tracing::info!("metrics listener closed");
    }
}

async fn render(
    axum::extract::State(registered): axum::extract::State<Arc<Mutex<Registered>>>,
) -> Response {
    // clone the handles out so the lock is not held across awaits
    let (manager, servers, hls, webrtc) = {
        let reg = registered.lock().unwrap_or_else(|e| e.into_inner());
        (
            reg.manager.clone(),
            reg.servers.clone(),
            reg.hls.clone(),
            reg.webrtc.clone(),
        )
    };

    let mut out = String::new();

    if let Some(manager) = manager {
        if let Ok(paths) = manager.api_paths_list().await {
            for p in paths {
                out.push_str(&format!(
                    "paths{{name=\"{}\",state=\"{}\"}} 1\n",
                    p.name, p.state
                ));
                out.push_str(&format!(
                    "paths_bytes_received{{name=\"{}\"}} {}\n",
                    p.name, p.bytes_received
                ));
            }
        }
    }

    for (label, handle) in servers {
        if let Ok(conns) = handle.api_list().await {
            let mut by_state = [0u64; 3];
            let mut rx = 0u64;
            let mut tx = 0u64;
            for c in &conns {
                let idx = match c.state {
                    "publish" => 1,
                    "read" => 2,
                    _ => 0,
                };
                by_state[idx] += 1;
                rx += c.bytes_received;
                tx += c.bytes_sent;
            }
            for (state, count) in [("idle", by_state[0]), ("publish", by_state[1]), ("read", by_state[2])] {
                out.push_str(&format!("{label}_conns{{state=\"{state}\"}} {count}\n"));
            }
            out.push_str(&format!("{label}_conns_bytes_received {rx}\n"));
            out.push_str(&format!("{label}_conns_bytes_sent {tx}\n"));
        }
    }

    if let Some(hls) = hls {
        if let Ok(muxers) = hls.api_muxers_list().await {
            for m in &muxers {
                out.push_str(&format!("hls_muxers{{name=\"{}\"}} 1\n", m.path));
                out.push_str(&format!(
                    "hls_muxers_bytes_sent{{name=\"{}\"}} {}\n",
                    m.path, m.bytes_sent
                ));
            }
            out.push_str(&format!("hls_muxers_total {}\n", muxers.len()));
        }
    }

    if let Some(webrtc) = webrtc {
        if let Ok(sessions) = webrtc.api_list().await {
            let established = sessions
                .iter()
                .filter(|s| s.peer_connection_established)
                .count();
            out.push_str(&format!(
                "webrtc_conns{{state=\"established\"}} {established}\n"
            ));
            out.push_str(&format!(
                "webrtc_conns{{state=\"starting\"}} {}\n",
                sessions.len() - established
            ));
        }
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(out.into())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AccessInfo;
    use crate::conf::Conf;
    use crate::externalcmd::{Pool, ProcessLauncher};
    use crate::path::manager::{PathManager, PathManagerOpts};
    use crate::path::source::UnsupportedSourceDriver;
    use crate::stream::{MediaInfo, Track, TrackKind};
    use bytes::Bytes;

    #[tokio::test]
    async fn test_render_paths() {
        let token = CancellationToken::new();
        let conf: Conf =
            Conf::from_value(serde_yaml::from_str("paths:\n  cam1:\n").unwrap()).unwrap();
        let manager = PathManager::spawn(
            PathManagerOpts {
                read_buffer_count: 64,
                auth_timeout: Duration::from_secs(1),
                external_auth_url: None,
                paths: conf.paths,
                pool: Pool::new(Arc::new(ProcessLauncher)),
                source_driver: Arc::new(UnsupportedSourceDriver),
            },
            token.clone(),
        );

        let metrics = Metrics::new("127.0.0.1:0", &token).await.unwrap();
        metrics.set_path_manager(manager.clone());

        let _publisher = manager
            .publish(
                "cam1",
                AccessInfo {
                    ip: "127.0.0.1".parse().unwrap(),
                    user: None,
                    pass: None,
                    query: String::new(),
                    protocol: "rtsp",
                },
                MediaInfo {
                    tracks: vec![Track {
                        kind: TrackKind::Video,
                        codec: "h264".into(),
                        init: Bytes::new(),
                    }],
                },
            )
            .await
            .unwrap();

        let body = reqwest::get(format!("http://{}/metrics", metrics.local_addr()))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("paths{name=\"cam1\",state=\"ready\"} 1"));
        assert!(body.contains("paths_bytes_received{name=\"cam1\"} 0"));
    }
}

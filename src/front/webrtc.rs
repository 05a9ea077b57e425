//! WebRTC front-end
//!
//! Serves the embedded player page, accepts WHEP-style offers, and owns the
//! session registry. Peer-connection work (SDP, ICE, DTLS, packetization)
//! sits behind the [`SignalFactory`] seam; the core attaches each session to
//! its path as a reader and ferries units into it.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::auth::AccessInfo;
use crate::error::RelayError;
use crate::path::manager::PathManagerHandle;
use crate::server::{parse_address, rfc3339};
use crate::stream::Unit;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How often a session task refreshes its status snapshot for the API.
const STATUS_REFRESH: Duration = Duration::from_secs(1);

/// Player page compiled into the binary and served at `/` and `/{path}`.
const PAGE: &str = include_str!("webrtc_page.html");

/// Peer-connection status surfaced by the control API.
#[derive(Debug, Clone, Default)]
pub struct SignalStatus {
    pub established: bool,
    pub local_candidate: Option<String>,
    pub remote_candidate: Option<String>,
}

/// One peer connection, built by the signaling layer.
#[async_trait]
pub trait SignalSession: Send {
    /// Answer SDP for the offer the session was opened with.
    fn answer(&self) -> String;

    /// Current connection status snapshot.
    fn status(&self) -> SignalStatus;

    /// Delivers one unit to the peer. An error means the peer is gone.
    async fn send_unit(&mut self, unit: &Unit) -> io::Result<()>;
}

#[async_trait]
pub trait SignalFactory: Send + Sync {
    async fn open(&self, offer: &str, ice_servers: &[String])
        -> io::Result<Box<dyn SignalSession>>;
}

/// Placeholder factory used when no signaling stack is wired in.
pub struct UnsupportedSignalFactory;

#[async_trait]
impl SignalFactory for UnsupportedSignalFactory {
    async fn open(
        &self,
        _offer: &str,
        _ice_servers: &[String],
    ) -> io::Result<Box<dyn SignalSession>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "no signaling stack available",
        ))
    }
}

/// One WebRTC session in the API listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiWebRtcConnInfo {
    pub id: Uuid,
    pub created: String,
    pub remote_addr: String,
    pub path: String,
    pub peer_connection_established: bool,
    pub local_candidate: Option<String>,
    pub remote_candidate: Option<String>,
    pub bytes_sent: u64,
}

struct SessionSlot {
    created: SystemTime,
    addr: SocketAddr,
    path: String,
    status: Arc<Mutex<SignalStatus>>,
    bytes_sent: Arc<AtomicU64>,
    token: CancellationToken,
}

enum RegistryRequest {
    New {
        path: String,
        access: AccessInfo,
        addr: SocketAddr,
        offer: String,
        reply: oneshot::Sender<Result<String, RelayError>>,
    },
    Closed {
        id: Uuid,
    },
    ApiList {
        reply: oneshot::Sender<Vec<ApiWebRtcConnInfo>>,
    },
    ApiKick {
        id: Uuid,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
}

#[derive(Clone)]
pub struct WebRtcServerHandle {
    tx: mpsc::UnboundedSender<RegistryRequest>,
}

impl WebRtcServerHandle {
    pub async fn api_list(&self) -> Result<Vec<ApiWebRtcConnInfo>, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RegistryRequest::ApiList { reply })
            .map_err(|_| RelayError::Terminated)?;
        rx.await.map_err(|_| RelayError::Terminated)
    }

    pub async fn api_kick(&self, id: Uuid) -> Result<(), RelayError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RegistryRequest::ApiKick { id, reply })
            .map_err(|_| RelayError::Terminated)?;
        rx.await.map_err(|_| RelayError::Terminated)?
    }
}

pub struct WebRtcServerOpts {
    pub address: String,
    pub ice_servers: Vec<String>,
    /// When set, a shared UDP socket for ICE, closed with the server.
    pub ice_udp_mux_address: String,
    /// When set, a shared TCP listener for ICE, closed with the server.
    pub ice_tcp_mux_address: String,
    pub signal: Arc<dyn SignalFactory>,
}

pub struct WebRtcServer {
    local_addr: SocketAddr,
    handle: WebRtcServerHandle,
    token: CancellationToken,
    tracker: TaskTracker,
    // held open for the signaling layer; dropped on close
    ice_udp_mux: Mutex<Option<UdpSocket>>,
    ice_tcp_mux: Mutex<Option<TcpListener>>,
}

struct AppState {
    registry_tx: mpsc::UnboundedSender<RegistryRequest>,
}

impl WebRtcServer {
    pub async fn new(
        opts: WebRtcServerOpts,
        manager: PathManagerHandle,
        parent: &CancellationToken,
    ) -> io::Result<WebRtcServer> {
        let listener = TcpListener::bind(parse_address(&opts.address)?).await?;
        let local_addr = listener.local_addr()?;

        let ice_udp_mux = if opts.ice_udp_mux_address.is_empty() {
            None
        } else {
            Some(UdpSocket::bind(parse_address(&opts.ice_udp_mux_address)?).await?)
        };
        let ice_tcp_mux = if opts.ice_tcp_mux_address.is_empty() {
            None
        } else {
            Some(TcpListener::bind(parse_address(&opts.ice_tcp_mux_address)?).await?)
        };

        let token = parent.child_token();
        let tracker = TaskTracker::new();
        let (registry_tx, registry_rx) = mpsc::unbounded_channel();

        tracing::info!(addr = %local_addr, "WebRTC listener opened");

        {
            let registry = Registry {
                manager,
                ice_servers: opts.ice_servers,
                signal: opts.signal,
                token: token.clone(),
                tracker: tracker.clone(),
                tx: registry_tx.clone(),
                rx: registry_rx,
                sessions: HashMap::new(),
            };
            tracker.spawn(registry.run());
        }

        {
            let state = Arc::new(AppState {
                registry_tx: registry_tx.clone(),
            });
            let app = Router::new()
                .route("/", get(|| async { Html(PAGE) }))
                .route("/:path", get(|| async { Html(PAGE) }))
                .route("/:path/whep", post(handle_whep))
                .with_state(state);
            let token = token.clone();
            tracker.spawn(async move {
                let shutdown = async move { token.cancelled().await };
                let service = app.into_make_service_with_connect_info::<SocketAddr>();
                if let Err(e) = axum::serve(listener, service)
                    .with_graceful_shutdown(shutdown)
                    .await
                {
                    tracing::error!(error = %e, "WebRTC server failed");
                }
            });
        }

        Ok(WebRtcServer {
            local_addr,
            handle: WebRtcServerHandle { tx: registry_tx },
            token,
            tracker,
            ice_udp_mux: Mutex::new(ice_udp_mux),
            ice_tcp_mux: Mutex::new(ice_tcp_mux),
        })
    }

    pub fn handle(&self) -> WebRtcServerHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn close(&self) {
        self.token.cancel();
        self.tracker.close();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("WebRTC shutdown timed out");
        }
        // auxiliary ICE listeners go away last
        self.ice_udp_mux.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.ice_tcp_mux.lock().unwrap_or_else(|e| e.into_inner()).take();
        tracing::info!("WebRTC listener closed");
    }
}

struct Registry {
    manager: PathManagerHandle,
    ice_servers: Vec<String>,
    signal: Arc<dyn SignalFactory>,
    token: CancellationToken,
    tracker: TaskTracker,
    tx: mpsc::UnboundedSender<RegistryRequest>,
    rx: mpsc::UnboundedReceiver<RegistryRequest>,
    sessions: HashMap<Uuid, SessionSlot>,
}

impl Registry {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                req = self.rx.recv() => match req {
                    Some(req) => self.handle(req),
                    None => break,
                }
            }
        }
    }

    fn handle(&mut self, req: RegistryRequest) {
        match req {
            RegistryRequest::New {
                path,
                access,
                addr,
                offer,
                reply,
            } => {
                let id = Uuid::new_v4();
                let status = Arc::new(Mutex::new(SignalStatus::default()));
                let bytes_sent = Arc::new(AtomicU64::new(0));
                let session_token = self.token.child_token();

                self.sessions.insert(
                    id,
                    SessionSlot {
                        created: SystemTime::now(),
                        addr,
                        path: path.clone(),
                        status: status.clone(),
                        bytes_sent: bytes_sent.clone(),
                        token: session_token.clone(),
                    },
                );
                tracing::info!(id = %id, path = %path, addr = %addr, "session opened");

                self.tracker.spawn(run_session(SessionTask {
                    id,
                    path,
                    access,
                    offer,
                    manager: self.manager.clone(),
                    ice_servers: self.ice_servers.clone(),
                    signal: self.signal.clone(),
                    status,
                    bytes_sent,
                    token: session_token,
                    registry_tx: self.tx.clone(),
                    reply: Some(reply),
                }));
            }
            RegistryRequest::Closed { id } => {
                if self.sessions.remove(&id).is_some() {
                    tracing::debug!(id = %id, "session removed");
                }
            }
            RegistryRequest::ApiList { reply } => {
                let mut items: Vec<ApiWebRtcConnInfo> = self
                    .sessions
                    .iter()
                    .map(|(id, slot)| {
                        let status = slot
                            .status
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .clone();
                        ApiWebRtcConnInfo {
                            id: *id,
                            created: rfc3339(slot.created),
                            remote_addr: slot.addr.to_string(),
                            path: slot.path.clone(),
                            peer_connection_established: status.established,
                            local_candidate: status.local_candidate,
                            remote_candidate: status.remote_candidate,
                            bytes_sent: slot.bytes_sent.load(Ordering::Relaxed),
                        }
                    })
                    .collect();
                items.sort_by(|a, b| a.created.cmp(&b.created));
                let _ = reply.send(items);
            }
            RegistryRequest::ApiKick { id, reply } => {
                let result = match self.sessions.get(&id) {
                    Some(slot) => {
                        tracing::info!(id = %id, "kicking session");
                        slot.token.cancel();
                        Ok(())
                    }
                    None => Err(RelayError::NotFound(id.to_string())),
                };
                let _ = reply.send(result);
            }
        }
    }
}

struct SessionTask {
    id: Uuid,
    path: String,
    access: AccessInfo,
    offer: String,
    manager: PathManagerHandle,
    ice_servers: Vec<String>,
    signal: Arc<dyn SignalFactory>,
    status: Arc<Mutex<SignalStatus>>,
    bytes_sent: Arc<AtomicU64>,
    token: CancellationToken,
    registry_tx: mpsc::UnboundedSender<RegistryRequest>,
    reply: Option<oneshot::Sender<Result<String, RelayError>>>,
}

async fn run_session(mut task: SessionTask) {
    let outcome = drive_session(&mut task).await;
    if let Err(e) = &outcome {
        if let Some(reply) = task.reply.take() {
            let _ = reply.send(Err(e.duplicate()));
        }
        if e.is_critical() {
            tracing::warn!(id = %task.id, path = %task.path, error = %e, "session failed");
        }
    }
    let _ = task.registry_tx.send(RegistryRequest::Closed { id: task.id });
}

async fn drive_session(task: &mut SessionTask) -> Result<(), RelayError> {
    // authenticate and attach first, then spend resources on the peer
    let mut guard = task
        .manager
        .read(&task.path, task.access.clone(), None)
        .await?;

    let mut session = task.signal.open(&task.offer, &task.ice_servers).await?;
    if let Some(reply) = task.reply.take() {
        let _ = reply.send(Ok(session.answer()));
    }
    *task.status.lock().unwrap_or_else(|e| e.into_inner()) = session.status();

    let evicted = guard.token().clone();
    loop {
        tokio::select! {
            _ = task.token.cancelled() => return Ok(()),
            _ = evicted.cancelled() => return Ok(()),
            _ = tokio::time::sleep(STATUS_REFRESH) => {
                *task.status.lock().unwrap_or_else(|e| e.into_inner()) = session.status();
            }
            unit = guard.next() => match unit {
                Ok(unit) => {
                    task.bytes_sent
                        .fetch_add(unit.payload.len() as u64, Ordering::Relaxed);
                    session.send_unit(&unit).await?;
                }
                Err(e) => {
                    tracing::debug!(id = %task.id, error = %e, "stream ended");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_whep(
    AxumPath(path): AxumPath<String>,
    State(state): State<Arc<AppState>>,
    connect: axum::extract::ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    offer: String,
) -> Response {
    let (user, pass) = super::hls::basic_auth(&headers);
    let access = AccessInfo {
        ip: connect.0.ip(),
        user,
        pass,
        query: String::new(),
        protocol: "webrtc",
    };

    let (reply, rx) = oneshot::channel();
    if state
        .registry_tx
        .send(RegistryRequest::New {
            path,
            access,
            addr: connect.0,
            offer,
            reply,
        })
        .is_err()
    {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    match rx.await {
        Ok(Ok(answer)) => Response::builder()
            .status(StatusCode::CREATED)
            .header(header::CONTENT_TYPE, "application/sdp")
            .body(Body::from(answer))
            .unwrap(),
        Ok(Err(e)) => super::hls::error_response(&e),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

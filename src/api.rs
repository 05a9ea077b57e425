//! Control API (HTTP/JSON)
//!
//! Read-only listings of paths and per-protocol connections, kick endpoints,
//! and configuration get/set. A config write is validated here, then handed
//! to the supervisor through its event channel; the supervisor re-runs the
//! same reconciliation a file change triggers.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::conf::Conf;
use crate::error::RelayError;
use crate::front::hls::HlsServerHandle;
use crate::front::webrtc::WebRtcServerHandle;
use crate::path::manager::PathManagerHandle;
use crate::server::{parse_address, ServerHandle};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handles of everything the API can inspect.
pub struct ApiHandles {
    pub manager: PathManagerHandle,
    pub rtsp: Option<ServerHandle>,
    pub rtsps: Option<ServerHandle>,
    pub rtmp: Option<ServerHandle>,
    pub rtmps: Option<ServerHandle>,
    pub hls: Option<HlsServerHandle>,
    pub webrtc: Option<WebRtcServerHandle>,
}

struct ApiState {
    conf: Mutex<Arc<Conf>>,
    handles: ApiHandles,
    conf_set_tx: mpsc::UnboundedSender<Conf>,
}

pub struct ApiServer {
    local_addr: SocketAddr,
    state: Arc<ApiState>,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl ApiServer {
    pub async fn new(
        address: &str,
        conf: Arc<Conf>,
        handles: ApiHandles,
        conf_set_tx: mpsc::UnboundedSender<Conf>,
        parent: &CancellationToken,
    ) -> io::Result<ApiServer> {
        let listener = tokio::net::TcpListener::bind(parse_address(address)?).await?;
        let local_addr = listener.local_addr()?;

        let state = Arc::new(ApiState {
            conf: Mutex::new(conf),
            handles,
            conf_set_tx,
        });

        let app = Router::new()
            .route("/v1/config/get", get(config_get))
            .route("/v1/config/set", post(config_set))
            .route("/v1/paths/list", get(paths_list))
            .route("/v1/paths/kick/:name", post(paths_kick))
            .route("/v1/rtspconns/list", get(|s| conns_list(s, Proto::Rtsp)))
            .route("/v1/rtspconns/kick/:id", post(|s, p| conns_kick(s, p, Proto::Rtsp)))
            .route("/v1/rtspsconns/list", get(|s| conns_list(s, Proto::Rtsps)))
            .route("/v1/rtspsconns/kick/:id", post(|s, p| conns_kick(s, p, Proto::Rtsps)))
            .route("/v1/rtmpconns/list", get(|s| conns_list(s, Proto::Rtmp)))
            .route("/v1/rtmpconns/kick/:id", post(|s, p| conns_kick(s, p, Proto::Rtmp)))
            .route("/v1/rtmpsconns/list", get(|s| conns_list(s, Proto::Rtmps)))
            .route("/v1/rtmpsconns/kick/:id", post(|s, p| conns_kick(s, p, Proto::Rtmps)))
            .route("/v1/hlsmuxers/list", get(muxers_list))
            .route("/v1/webrtcconns/list", get(webrtc_list))
            .route("/v1/webrtcconns/kick/:id", post(webrtc_kick))
            .with_state(state.clone());

        let token = parent.child_token();
        let tracker = TaskTracker::new();

        tracing::info!(addr = %local_addr, "API listener opened");

        {
            let token = token.clone();
            tracker.spawn(async move {
                let shutdown = async move { token.cancelled().await };
                if let Err(e) = axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown)
                    .await
                {
                    tracing::error!(error = %e, "API server failed");
                }
            });
        }

        Ok(ApiServer {
            local_addr,
            state,
            token,
            tracker,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Called by the supervisor when the API survives a reload.
    pub fn conf_reload(&self, conf: Arc<Conf>) {
        *self.state.conf.lock().unwrap_or_else(|e| e.into_inner()) = conf;
    }

    pub async fn close(&self) {
        self.token.cancel();
        self.tracker.close();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("API shutdown timed out");
        }
        tracing::info!("API listener closed");
    }
}

#[derive(Clone, Copy)]
enum Proto {
    Rtsp,
    Rtsps,
    Rtmp,
    Rtmps,
}

impl Proto {
    fn handle(self, handles: &ApiHandles) -> Option<&ServerHandle> {
        match self {
            Proto::Rtsp => handles.rtsp.as_ref(),
            Proto::Rtsps => handles.rtsps.as_ref(),
            Proto::Rtmp => handles.rtmp.as_ref(),
            Proto::Rtmps => handles.rtmps.as_ref(),
        }
    }
}

fn error_status(e: &RelayError) -> StatusCode {
    match e {
        RelayError::NotFound(_) => StatusCode::NOT_FOUND,
        RelayError::Terminated => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(e: &RelayError) -> Response {
    let body = Json(json!({ "error": e.to_string() }));
    (error_status(e), body).into_response()
}

async fn config_get(State(state): State<Arc<ApiState>>) -> Response {
    let conf = state.conf.lock().unwrap_or_else(|e| e.into_inner()).clone();
    Json(serde_json::to_value(&*conf).unwrap_or_default()).into_response()
}

/// Deep merge of a partial tree onto the current configuration.
fn merge(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                merge(base.entry(key.clone()).or_insert(serde_json::Value::Null), value);
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

async fn config_set(
    State(state): State<Arc<ApiState>>,
    Json(patch): Json<serde_json::Value>,
) -> Response {
    let current = state.conf.lock().unwrap_or_else(|e| e.into_inner()).clone();
    let mut tree = match serde_json::to_value(&*current) {
        Ok(tree) => tree,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };
    merge(&mut tree, &patch);

    let yaml = match serde_yaml::to_value(&tree) {
        Ok(yaml) => yaml,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    let conf = match Conf::from_value(yaml).and_then(|c| c.validate().map(|_| c)) {
        Ok(conf) => conf,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })))
                .into_response()
        }
    };

    *state.conf.lock().unwrap_or_else(|e| e.into_inner()) = Arc::new(conf.clone());
    if state.conf_set_tx.send(conf).is_err() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    Response::builder()
        .status(StatusCode::OK)
        .body(Body::empty())
        .unwrap()
}

async fn paths_list(State(state): State<Arc<ApiState>>) -> Response {
    match state.handles.manager.api_paths_list().await {
        Ok(list) => {
            let items: HashMap<String, _> =
                list.into_iter().map(|p| (p.name.clone(), p)).collect();
            Json(json!({ "items": items })).into_response()
        }
        Err(e) => error_body(&e),
    }
}

async fn paths_kick(
    State(state): State<Arc<ApiState>>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    match state.handles.manager.api_paths_kick(&name).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_body(&e),
    }
}

async fn conns_list(State(state): State<Arc<ApiState>>, proto: Proto) -> Response {
    let Some(handle) = proto.handle(&state.handles) else {
        return Json(json!({ "items": {} })).into_response();
    };
    match handle.api_list().await {
        Ok(list) => {
            let items: HashMap<String, _> =
                list.into_iter().map(|c| (c.id.to_string(), c)).collect();
            Json(json!({ "items": items })).into_response()
        }
        Err(e) => error_body(&e),
    }
}

async fn conns_kick(
    State(state): State<Arc<ApiState>>,
    AxumPath(id): AxumPath<String>,
    proto: Proto,
) -> Response {
    let Some(handle) = proto.handle(&state.handles) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Ok(id) = id.parse::<Uuid>() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match handle.api_kick(id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_body(&e),
    }
}

async fn muxers_list(State(state): State<Arc<ApiState>>) -> Response {
    let Some(handle) = state.handles.hls.as_ref() else {
        return Json(json!({ "items": {} })).into_response();
    };
    match handle.api_muxers_list().await {
        Ok(list) => {
            let items: HashMap<String, _> =
                list.into_iter().map(|m| (m.path.clone(), m)).collect();
            Json(json!({ "items": items })).into_response()
        }
        Err(e) => error_body(&e),
    }
}

async fn webrtc_list(State(state): State<Arc<ApiState>>) -> Response {
    let Some(handle) = state.handles.webrtc.as_ref() else {
        return Json(json!({ "items": {} })).into_response();
    };
    match handle.api_list().await {
        Ok(list) => {
            let items: HashMap<String, _> =
                list.into_iter().map(|c| (c.id.to_string(), c)).collect();
            Json(json!({ "items": items })).into_response()
        }
        Err(e) => error_body(&e),
    }
}

async fn webrtc_kick(
    State(state): State<Arc<ApiState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let Some(handle) = state.handles.webrtc.as_ref() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Ok(id) = id.parse::<Uuid>() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match handle.api_kick(id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_body(&e),
    }
}

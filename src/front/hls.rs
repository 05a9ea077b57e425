//! HLS front-end
//!
//! One muxer per requested path: the muxer attaches to the stream as a
//! reader, hands units to a segmenter, and keeps the last N segments plus a
//! playlist in memory for the HTTP handlers. Muxers close on stream end or
//! after a period without requests. Media packaging is behind the
//! [`Segmenter`] seam; the playlist text is assembled here.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use axum::body::Body;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::auth::AccessInfo;
use crate::error::RelayError;
use crate::path::manager::PathManagerHandle;
use crate::server::{parse_address, rfc3339};
use crate::stream::{MediaInfo, Unit};

/// How often a muxer checks whether it is still being requested.
const CLOSE_CHECK_PERIOD: Duration = Duration::from_secs(1);

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A finished media segment.
pub struct Segment {
    pub duration: Duration,
    pub payload: Bytes,
}

/// Packages units into segments. Implementations own the container format.
pub trait Segmenter: Send {
    /// Feeds one unit; returns a segment when one is completed.
    fn push(&mut self, unit: &Unit) -> Option<Segment>;
}

pub trait SegmenterFactory: Send + Sync {
    fn open(&self, info: &MediaInfo, segment_duration: Duration) -> Box<dyn Segmenter>;
}

/// Container-less segmenter: concatenates payloads, cutting at keyframes
/// once the target duration has elapsed. Good enough for tests and for
/// embedders that package elsewhere.
pub struct RawSegmenter {
    target: Duration,
    start_pts: Option<Duration>,
    last_pts: Duration,
    buf: Vec<u8>,
}

impl Segmenter for RawSegmenter {
    fn push(&mut self, unit: &Unit) -> Option<Segment> {
        let start = *self.start_pts.get_or_insert(unit.pts);
        let elapsed = unit.pts.saturating_sub(start);

        // cut at a keyframe past the target, or force a cut at twice the
        // target when the stream has no keyframes at all
        let cut = !self.buf.is_empty()
            && ((unit.key && elapsed >= self.target) || elapsed >= self.target * 2);

        let done = if cut {
            let payload = Bytes::from(std::mem::take(&mut self.buf));
            let duration = self.last_pts.saturating_sub(start);
            self.start_pts = Some(unit.pts);
            Some(Segment {
                duration: duration.max(Duration::from_millis(1)),
                payload,
            })
        } else {
            None
        };

        self.buf.extend_from_slice(&unit.payload);
        self.last_pts = unit.pts;
        done
    }
}

pub struct RawSegmenterFactory;

impl SegmenterFactory for RawSegmenterFactory {
    fn open(&self, _info: &MediaInfo, segment_duration: Duration) -> Box<dyn Segmenter> {
        Box::new(RawSegmenter {
            target: segment_duration,
            start_pts: None,
            last_pts: Duration::ZERO,
            buf: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MuxerPhase {
    Starting,
    Ready,
    Failed,
}

struct MuxerInner {
    segments: VecDeque<(u64, Segment)>,
    next_seq: u64,
}

/// State shared between one muxer task and the HTTP handlers.
struct MuxerShared {
    path: String,
    id: Uuid,
    created: SystemTime,
    inner: Mutex<MuxerInner>,
    phase: watch::Sender<MuxerPhase>,
    last_request: Mutex<Instant>,
    bytes_sent: AtomicU64,
    segment_count: usize,
}

impl MuxerShared {
    fn touch(&self) {
        *self.last_request.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_request
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.phase.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match *rx.borrow() {
                MuxerPhase::Ready => return true,
                MuxerPhase::Failed => return false,
                MuxerPhase::Starting => {}
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => {}
                _ => return false,
            }
        }
    }

    fn push_segment(&self, segment: Segment) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.segments.push_back((seq, segment));
        while inner.segments.len() > self.segment_count {
            inner.segments.pop_front();
        }
    }

    fn playlist(&self) -> String {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let target = inner
            .segments
            .iter()
            .map(|(_, s)| s.duration.as_secs_f64().ceil() as u64)
            .max()
            .unwrap_or(1);
        let first_seq = inner.segments.front().map(|(seq, _)| *seq).unwrap_or(0);

        let mut out = String::new();
        out.push_str("#EXTM3U\n#EXT-X-VERSION:3\n");
        out.push_str(&format!("#EXT-X-TARGETDURATION:{target}\n"));
        out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{first_seq}\n"));
        for (seq, segment) in &inner.segments {
            out.push_str(&format!("#EXTINF:{:.5},\n", segment.duration.as_secs_f64()));
            out.push_str(&format!("seg{seq}.mp4\n"));
        }
        out
    }

    fn segment(&self, name: &str) -> Option<Bytes> {
        let seq: u64 = name.strip_prefix("seg")?.strip_suffix(".mp4")?.parse().ok()?;
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .segments
            .iter()
            .find(|(s, _)| *s == seq)
            .map(|(_, seg)| seg.payload.clone())
    }
}

/// One muxer in the API listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiMuxerInfo {
    pub path: String,
    pub created: String,
    pub bytes_sent: u64,
}

enum RegistryRequest {
    Get {
        path: String,
        access: AccessInfo,
        reply: oneshot::Sender<Arc<MuxerShared>>,
    },
    Closed {
        path: String,
        id: Uuid,
    },
    ApiList {
        reply: oneshot::Sender<Vec<ApiMuxerInfo>>,
    },
}

#[derive(Clone)]
pub struct HlsServerHandle {
    tx: mpsc::UnboundedSender<RegistryRequest>,
}

impl HlsServerHandle {
    pub async fn api_muxers_list(&self) -> Result<Vec<ApiMuxerInfo>, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RegistryRequest::ApiList { reply })
            .map_err(|_| RelayError::Terminated)?;
        rx.await.map_err(|_| RelayError::Terminated)
    }
}

pub struct HlsServerOpts {
    pub address: String,
    pub segment_count: usize,
    pub segment_duration: Duration,
    pub allow_origin: String,
    pub segmenter: Arc<dyn SegmenterFactory>,
}

pub struct HlsServer {
    local_addr: SocketAddr,
    handle: HlsServerHandle,
    token: CancellationToken,
    tracker: TaskTracker,
}

struct AppState {
    manager: PathManagerHandle,
    registry_tx: mpsc::UnboundedSender<RegistryRequest>,
    allow_origin: String,
}

impl HlsServer {
    pub async fn new(
        opts: HlsServerOpts,
        manager: PathManagerHandle,
        parent: &CancellationToken,
    ) -> std::io::Result<HlsServer> {
        let listener = tokio::net::TcpListener::bind(parse_address(&opts.address)?).await?;
        let local_addr = listener.local_addr()?;

        let token = parent.child_token();
        let tracker = TaskTracker::new();
        let (registry_tx, registry_rx) = mpsc::unbounded_channel();

        tracing::info!(addr = %local_addr, "HLS listener opened");

        // muxer registry
        {
            let registry = Registry {
                manager: manager.clone(),
                segment_count: opts.segment_count,
                segment_duration: opts.segment_duration,
                // a muxer nobody polls for a full window has no audience left
                close_after: opts.segment_duration * opts.segment_count as u32 * 2,
                segmenter: opts.segmenter,
                token: token.clone(),
                tracker: tracker.clone(),
                tx: registry_tx.clone(),
                rx: registry_rx,
                muxers: HashMap::new(),
            };
            tracker.spawn(registry.run());
        }

        // HTTP surface
        {
            let state = Arc::new(AppState {
                manager,
                registry_tx: registry_tx.clone(),
                allow_origin: opts.allow_origin,
            });
            let app = Router::new()
                .route("/*rest", get(handle_get))
                .with_state(state);
            let token = token.clone();
            tracker.spawn(async move {
                let shutdown = async move { token.cancelled().await };
                let service = app.into_make_service_with_connect_info::<SocketAddr>();
                if let Err(e) = axum::serve(listener, service)
                    .with_graceful_shutdown(shutdown)
                    .await
                {
                    tracing::error!(error = %e, "HLS server failed");
                }
            });
        }

        Ok(HlsServer {
            local_addr,
            handle: HlsServerHandle { tx: registry_tx },
            token,
            tracker,
        })
    }

    pub fn handle(&self) -> HlsServerHandle {
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
            tracing::warn!("HLS shutdown timed out");
        }
        tracing::info!("HLS listener closed");
    }
}

struct Registry {
    manager: PathManagerHandle,
    segment_count: usize,
    segment_duration: Duration,
    close_after: Duration,
    segmenter: Arc<dyn SegmenterFactory>,
    token: CancellationToken,
    tracker: TaskTracker,
    tx: mpsc::UnboundedSender<RegistryRequest>,
    rx: mpsc::UnboundedReceiver<RegistryRequest>,
    muxers: HashMap<String, Arc<MuxerShared>>,
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
            RegistryRequest::Get {
                path,
                access,
                reply,
            } => {
                let shared = match self.muxers.get(&path) {
                    Some(shared) => shared.clone(),
                    None => self.create_muxer(path, access),
                };
                shared.touch();
                let _ = reply.send(shared);
            }
            RegistryRequest::Closed { path, id } => {
                if self.muxers.get(&path).is_some_and(|m| m.id == id) {
                    self.muxers.remove(&path);
                    tracing::debug!(path = %path, "muxer removed");
                }
            }
            RegistryRequest::ApiList { reply } => {
                let mut items: Vec<ApiMuxerInfo> = self
                    .muxers
                    .values()
                    .map(|m| ApiMuxerInfo {
                        path: m.path.clone(),
                        created: rfc3339(m.created),
                        bytes_sent: m.bytes_sent.load(Ordering::Relaxed),
                    })
                    .collect();
                items.sort_by(|a, b| a.path.cmp(&b.path));
                let _ = reply.send(items);
            }
        }
    }

    fn create_muxer(&mut self, path: String, access: AccessInfo) -> Arc<MuxerShared> {
        let (phase_tx, _) = watch::channel(MuxerPhase::Starting);
        let shared = Arc::new(MuxerShared {
            path: path.clone(),
            id: Uuid::new_v4(),
            created: SystemTime::now(),
            inner: Mutex::new(MuxerInner {
                segments: VecDeque::new(),
                next_seq: 0,
            }),
            phase: phase_tx,
            last_request: Mutex::new(Instant::now()),
            bytes_sent: AtomicU64::new(0),
            segment_count: self.segment_count,
        });
        self.muxers.insert(path.clone(), shared.clone());
        tracing::info!(path = %path, "muxer created");

        self.tracker.spawn(run_muxer(MuxerTask {
            path,
            access,
            manager: self.manager.clone(),
            shared: shared.clone(),
            segmenter: self.segmenter.clone(),
            segment_duration: self.segment_duration,
            close_after: self.close_after,
            token: self.token.child_token(),
            registry_tx: self.tx.clone(),
        }));
        shared
    }
}

struct MuxerTask {
    path: String,
    access: AccessInfo,
    manager: PathManagerHandle,
    shared: Arc<MuxerShared>,
    segmenter: Arc<dyn SegmenterFactory>,
    segment_duration: Duration,
    close_after: Duration,
    token: CancellationToken,
    registry_tx: mpsc::UnboundedSender<RegistryRequest>,
}

async fn run_muxer(task: MuxerTask) {
    let mut guard = match task
        .manager
        .read(&task.path, task.access.clone(), None)
        .await
    {
        Ok(guard) => guard,
        Err(e) => {
            tracing::debug!(path = %task.path, error = %e, "muxer could not attach");
            let _ = task.shared.phase.send(MuxerPhase::Failed);
            let _ = task.registry_tx.send(RegistryRequest::Closed {
                path: task.path,
                id: task.shared.id,
            });
            return;
        }
    };

    let mut segmenter = task.segmenter.open(guard.info(), task.segment_duration);
    let _ = task.shared.phase.send(MuxerPhase::Ready);
    let evicted = guard.token().clone();

    loop {
        tokio::select! {
            _ = task.token.cancelled() => break,
            _ = evicted.cancelled() => break,
            _ = tokio::time::sleep(CLOSE_CHECK_PERIOD) => {
                if task.shared.idle_for() > task.close_after {
                    tracing::info!(path = %task.path, "closing muxer (no requests)");
                    break;
                }
            }
            unit = guard.next() => match unit {
                Ok(unit) => {
                    if let Some(segment) = segmenter.push(&unit) {
                        task.shared.push_segment(segment);
                    }
                }
                Err(e) => {
                    tracing::debug!(path = %task.path, error = %e, "muxer stream ended");
                    break;
                }
            }
        }
    }

    let _ = task.shared.phase.send(MuxerPhase::Failed);
    let _ = task.registry_tx.send(RegistryRequest::Closed {
        path: task.path,
        id: task.shared.id,
    });
}

/// Pulls Basic credentials out of the request headers.
pub(crate) fn basic_auth(headers: &HeaderMap) -> (Option<String>, Option<String>) {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
    else {
        return (None, None);
    };
    let Ok(decoded) = BASE64.decode(value) else {
        return (None, None);
    };
    let Ok(text) = String::from_utf8(decoded) else {
        return (None, None);
    };
    match text.split_once(':') {
        Some((user, pass)) => (Some(user.to_string()), Some(pass.to_string())),
        None => (None, None),
    }
}

pub(crate) fn error_response(e: &RelayError) -> Response {
    let status = match e {
        RelayError::AuthNotCritical => StatusCode::UNAUTHORIZED,
        RelayError::AuthCritical(_) => StatusCode::UNAUTHORIZED,
        RelayError::NotFound(_) | RelayError::Timeout(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let mut resp = Response::builder().status(status);
    if matches!(e, RelayError::AuthNotCritical) {
        resp = resp.header(header::WWW_AUTHENTICATE, "Basic realm=\"mediarelay\"");
    }
    resp.body(Body::empty()).unwrap()
}

async fn handle_get(
    AxumPath(rest): AxumPath<String>,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    connect: axum::extract::ConnectInfo<SocketAddr>,
) -> Response {
    let Some((path, file)) = rest.rsplit_once('/') else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if path.is_empty() || !(file == "index.m3u8" || file.starts_with("seg")) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let (user, pass) = basic_auth(&headers);
    let access = AccessInfo {
        ip: connect.0.ip(),
        user,
        pass,
        query: query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&"),
        protocol: "hls",
    };

    // authenticates and, for on-demand paths, starts the source
    if let Err(e) = state.manager.describe(path, access.clone()).await {
        return error_response(&e);
    }

    let (reply, rx) = oneshot::channel();
    if state
        .registry_tx
        .send(RegistryRequest::Get {
            path: path.to_string(),
            access,
            reply,
        })
        .is_err()
    {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let Ok(muxer) = rx.await else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    if !muxer.wait_ready(Duration::from_secs(10)).await {
        return StatusCode::NOT_FOUND.into_response();
    }

    let (content_type, body) = if file == "index.m3u8" {
        (
            "application/vnd.apple.mpegurl",
            Bytes::from(muxer.playlist()),
        )
    } else {
        match muxer.segment(file) {
            Some(payload) => ("video/mp4", payload),
            None => return StatusCode::NOT_FOUND.into_response(),
        }
    };

    muxer
        .bytes_sent
        .fetch_add(body.len() as u64, Ordering::Relaxed);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header("Access-Control-Allow-Origin", state.allow_origin.clone())
        .body(Body::from(body))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(pts_ms: u64, key: bool, payload: &'static [u8]) -> Unit {
        Unit::new(0, Duration::from_millis(pts_ms), key, Bytes::from_static(payload))
    }

    #[test]
    fn test_raw_segmenter_cuts_at_keyframes() {
        let mut seg = RawSegmenterFactory.open(&MediaInfo::default(), Duration::from_secs(1));

        assert!(seg.push(&unit(0, true, b"a")).is_none());
        assert!(seg.push(&unit(500, false, b"b")).is_none());
        // keyframe past the target closes the segment
        let done = seg.push(&unit(1200, true, b"c")).unwrap();
        assert_eq!(done.payload.as_ref(), b"ab");

        // non-keyframe past the target does not cut...
        assert!(seg.push(&unit(2500, false, b"d")).is_none());
        // ...until twice the target forces it
        let done = seg.push(&unit(3600, false, b"e")).unwrap();
        assert_eq!(done.payload.as_ref(), b"cd");
    }

    #[test]
    fn test_playlist_shape() {
        let (phase_tx, _) = watch::channel(MuxerPhase::Ready);
        let shared = MuxerShared {
            path: "cam1".into(),
            id: Uuid::new_v4(),
            created: SystemTime::now(),
            inner: Mutex::new(MuxerInner {
                segments: VecDeque::new(),
                next_seq: 0,
            }),
            phase: phase_tx,
            last_request: Mutex::new(Instant::now()),
            bytes_sent: AtomicU64::new(0),
            segment_count: 3,
        };

        for i in 0..5u8 {
            shared.push_segment(Segment {
                duration: Duration::from_secs(1),
                payload: Bytes::from(vec![i]),
            });
        }

        let playlist = shared.playlist();
        assert!(playlist.starts_with("#EXTM3U"));
        // only the last three survive the window
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:2"));
        assert!(playlist.contains("seg4.mp4"));
        assert!(!playlist.contains("seg1.mp4"));

        assert!(shared.segment("seg4.mp4").is_some());
        assert!(shared.segment("seg0.mp4").is_none());
        assert!(shared.segment("nope").is_none());
    }

    #[test]
    fn test_basic_auth_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(basic_auth(&headers), (None, None));

        headers.insert(
            header::AUTHORIZATION,
            format!("Basic {}", BASE64.encode("user:pa:ss")).parse().unwrap(),
        );
        assert_eq!(
            basic_auth(&headers),
            (Some("user".into()), Some("pa:ss".into()))
        );
    }
}

//! Path: the state machine of one named stream
//!
//! A path runs as a single-threaded actor: publishers, readers, timers and
//! the manager all talk to it through its inbox, so its invariants (at most
//! one source, stream exists only while a source is attached) never need a
//! lock. Media does not flow through the actor; once attached, publishers
//! and readers touch the stream object directly.

pub mod manager;
pub mod source;

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::conf::PathConf;
use crate::error::RelayError;
use crate::externalcmd::{self, Pool};
use crate::stream::{MediaInfo, Stream, StreamReadError, StreamReader, Unit};
use self::source::{SourceDriver, SourceFeed};

/// Answer to a describe request.
#[derive(Debug, Clone)]
pub enum DescribeAnswer {
    /// The path is ready; here is its media description.
    Info(MediaInfo),
    /// The path points somewhere else.
    Redirect(String),
}

/// Lifecycle state, exposed through the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathState {
    Initializing,
    OnDemandWaiting,
    Ready,
    Serving,
    Closing,
}

impl PathState {
    fn as_str(self) -> &'static str {
        match self {
            PathState::Initializing => "initializing",
            PathState::OnDemandWaiting => "onDemandWaiting",
            PathState::Ready => "ready",
            PathState::Serving => "serving",
            PathState::Closing => "closing",
        }
    }
}

/// Snapshot served by the control API and the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathInfo {
    pub name: String,
    pub conf_name: String,
    pub source: String,
    pub source_ready: bool,
    pub state: &'static str,
    pub readers: usize,
    pub bytes_received: u64,
}

/// Inbox message of a path actor.
pub(crate) enum PathMessage {
    Describe {
        reply: oneshot::Sender<Result<DescribeAnswer, RelayError>>,
    },
    Publish {
        info: MediaInfo,
        /// Set for the path's own static source, which bypasses the
        /// source-kind check the manager applies to wire publishers.
        internal: bool,
        reply: oneshot::Sender<Result<PublishGuard, RelayError>>,
    },
    Read {
        tracks: Option<Vec<usize>>,
        reply: oneshot::Sender<Result<ReadGuard, RelayError>>,
    },
    SourceGone {
        id: u64,
    },
    ReaderGone {
        id: u64,
    },
    ConfReload {
        conf: Arc<PathConf>,
    },
    ApiInfo {
        reply: oneshot::Sender<PathInfo>,
    },
    Close,
}

/// Notification a path sends its manager when it goes away on its own.
pub(crate) struct PathClosed {
    pub name: String,
    pub path_id: u64,
}

/// Write side of a path's stream, handed to the accepted publisher.
///
/// Dropping the guard tells the path its source is gone.
pub struct PublishGuard {
    stream: Arc<Stream>,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<PathMessage>,
    id: u64,
}

impl PublishGuard {
    pub fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    /// Cancelled when the path evicts the publisher (kick, reload, shutdown).
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for PublishGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(PathMessage::SourceGone { id: self.id });
    }
}

/// Read side of a path's stream, handed to an attached reader.
///
/// Dropping the guard detaches the reader.
pub struct ReadGuard {
    reader: StreamReader,
    info: MediaInfo,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<PathMessage>,
    id: u64,
}

impl ReadGuard {
    pub fn info(&self) -> &MediaInfo {
        &self.info
    }

    /// Cancelled when the path evicts the reader.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Next media unit, in publisher order per track.
    pub async fn next(&mut self) -> Result<Unit, StreamReadError> {
        self.reader.next().await
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(PathMessage::ReaderGone { id: self.id });
    }
}

pub(crate) struct PathOpts {
    pub name: String,
    pub conf: Arc<PathConf>,
    pub conf_name: String,
    /// Created on demand from a pattern; removable when it becomes empty.
    pub dynamic: bool,
    pub read_buffer_count: usize,
    pub pool: Pool,
    pub source_driver: Arc<dyn SourceDriver>,
    pub manager_tx: mpsc::UnboundedSender<PathClosed>,
    pub path_id: u64,
    pub token: CancellationToken,
}

/// Spawns a path actor and returns its inbox.
pub(crate) fn spawn(opts: PathOpts) -> mpsc::UnboundedSender<PathMessage> {
    let (tx, rx) = mpsc::unbounded_channel();
    let actor = Path::new(opts, tx.clone(), rx);
    tokio::spawn(actor.run());
    tx
}

struct SourceState {
    id: u64,
    token: CancellationToken,
}

struct ReaderEntry {
    token: CancellationToken,
    _cmd: Option<externalcmd::Cmd>,
}

struct Path {
    name: String,
    conf: Arc<PathConf>,
    conf_name: String,
    dynamic: bool,
    read_buffer_count: usize,
    pool: Pool,
    source_driver: Arc<dyn SourceDriver>,
    manager_tx: mpsc::UnboundedSender<PathClosed>,
    path_id: u64,
    token: CancellationToken,
    self_tx: mpsc::UnboundedSender<PathMessage>,
    rx: mpsc::UnboundedReceiver<PathMessage>,

    state: PathState,
    source: Option<SourceState>,
    stream: Option<Arc<Stream>>,
    readers: HashMap<u64, ReaderEntry>,
    pending_describes: Vec<oneshot::Sender<Result<DescribeAnswer, RelayError>>>,
    pending_reads: Vec<(
        Option<Vec<usize>>,
        oneshot::Sender<Result<ReadGuard, RelayError>>,
    )>,
    on_demand_deadline: Option<Instant>,
    close_after_deadline: Option<Instant>,
    static_source: Option<CancellationToken>,
    on_init_cmd: Option<externalcmd::Cmd>,
    on_demand_cmd: Option<externalcmd::Cmd>,
    on_publish_cmd: Option<externalcmd::Cmd>,
    next_id: u64,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

impl Path {
    fn new(
        opts: PathOpts,
        self_tx: mpsc::UnboundedSender<PathMessage>,
        rx: mpsc::UnboundedReceiver<PathMessage>,
    ) -> Self {
        Self {
            name: opts.name,
            conf: opts.conf,
            conf_name: opts.conf_name,
            dynamic: opts.dynamic,
            read_buffer_count: opts.read_buffer_count,
            pool: opts.pool,
            source_driver: opts.source_driver,
            manager_tx: opts.manager_tx,
            path_id: opts.path_id,
            token: opts.token,
            self_tx,
            rx,
            state: PathState::Initializing,
            source: None,
            stream: None,
            readers: HashMap::new(),
            pending_describes: Vec::new(),
            pending_reads: Vec::new(),
            on_demand_deadline: None,
            close_after_deadline: None,
            static_source: None,
            on_init_cmd: None,
            on_demand_cmd: None,
            on_publish_cmd: None,
            next_id: 0,
        }
    }

    async fn run(mut self) {
        tracing::debug!(path = %self.name, "path created");
        self.start();

        loop {
            let flow = tokio::select! {
                _ = self.token.cancelled() => ControlFlow::Break(()),
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => ControlFlow::Break(()),
                },
                _ = sleep_until_opt(self.on_demand_deadline) => self.on_start_timeout(),
                _ = sleep_until_opt(self.close_after_deadline) => self.on_idle_timeout(),
            };
            if flow.is_break() {
                break;
            }
        }

        self.close();
        tracing::debug!(path = %self.name, "path destroyed");
    }

    fn start(&mut self) {
        if !self.conf.run_on_init.is_empty() {
            self.on_init_cmd = Some(self.pool.start(
                &self.conf.run_on_init,
                self.conf.run_on_init_restart,
                self.cmd_env(),
            ));
        }
        if self.conf.has_static_source() && !self.conf.source_on_demand {
            self.start_static_source();
        }
    }

    fn cmd_env(&self) -> Vec<(String, String)> {
        vec![(externalcmd::ENV_PATH.to_string(), self.name.clone())]
    }

    fn handle(&mut self, msg: PathMessage) -> ControlFlow<()> {
        match msg {
            PathMessage::Describe { reply } => self.on_describe(reply),
            PathMessage::Publish {
                info,
                internal,
                reply,
            } => {
                self.on_publish(info, internal, reply);
                ControlFlow::Continue(())
            }
            PathMessage::Read { tracks, reply } => self.on_read(tracks, reply),
            PathMessage::SourceGone { id } => self.on_source_gone(id),
            PathMessage::ReaderGone { id } => self.on_reader_gone(id),
            PathMessage::ConfReload { conf } => {
                self.conf = conf;
                ControlFlow::Continue(())
            }
            PathMessage::ApiInfo { reply } => {
                let _ = reply.send(self.info());
                ControlFlow::Continue(())
            }
            PathMessage::Close => ControlFlow::Break(()),
        }
    }

    fn info(&self) -> PathInfo {
        PathInfo {
            name: self.name.clone(),
            conf_name: self.conf_name.clone(),
            source: self.conf.source.clone(),
            source_ready: self.stream.is_some(),
            state: self.state.as_str(),
            readers: self.readers.len(),
            bytes_received: self
                .stream
                .as_ref()
                .map(|s| s.bytes_received())
                .unwrap_or(0),
        }
    }

    fn on_describe(
        &mut self,
        reply: oneshot::Sender<Result<DescribeAnswer, RelayError>>,
    ) -> ControlFlow<()> {
        if self.conf.is_redirect() {
            let _ = reply.send(Ok(DescribeAnswer::Redirect(
                self.conf.source_redirect.clone(),
            )));
            return ControlFlow::Continue(());
        }
        if let Some(stream) = &self.stream {
            let _ = reply.send(Ok(DescribeAnswer::Info(stream.info().clone())));
            return ControlFlow::Continue(());
        }
        if self.conf.is_on_demand() {
            self.start_on_demand();
            self.pending_describes.push(reply);
            return ControlFlow::Continue(());
        }
        let _ = reply.send(Err(RelayError::NotFound(self.name.clone())));
        self.maybe_gc()
    }

    fn on_publish(
        &mut self,
        info: MediaInfo,
        internal: bool,
        reply: oneshot::Sender<Result<PublishGuard, RelayError>>,
    ) {
        if self.source.is_some() {
            let _ = reply.send(Err(RelayError::Busy(self.name.clone())));
            return;
        }

        let id = self.next_id;
        self.next_id += 1;
        let token = self.token.child_token();
        let stream = Arc::new(Stream::new(info, self.read_buffer_count));

        self.stream = Some(stream.clone());
        self.source = Some(SourceState {
            id,
            token: token.clone(),
        });
        self.on_demand_deadline = None;
        self.state = PathState::Ready;

        if !internal && !self.conf.run_on_publish.is_empty() {
            self.on_publish_cmd = Some(self.pool.start(
                &self.conf.run_on_publish,
                self.conf.run_on_publish_restart,
                self.cmd_env(),
            ));
        }

        tracing::info!(path = %self.name, info = %stream.info(), "source ready");

        let _ = reply.send(Ok(PublishGuard {
            stream,
            token,
            tx: self.self_tx.clone(),
            id,
        }));

        self.flush_pending();
    }

    fn on_read(
        &mut self,
        tracks: Option<Vec<usize>>,
        reply: oneshot::Sender<Result<ReadGuard, RelayError>>,
    ) -> ControlFlow<()> {
        if self.stream.is_some() {
            self.attach_reader(tracks, reply);
            return ControlFlow::Continue(());
        }
        if self.conf.is_on_demand() {
            self.start_on_demand();
            self.pending_reads.push((tracks, reply));
            return ControlFlow::Continue(());
        }
        let _ = reply.send(Err(RelayError::NotFound(self.name.clone())));
        self.maybe_gc()
    }

    fn attach_reader(
        &mut self,
        tracks: Option<Vec<usize>>,
        reply: oneshot::Sender<Result<ReadGuard, RelayError>>,
    ) {
        let stream = self.stream.as_ref().expect("attach_reader without stream");

        let Some(reader) = stream.reader(tracks.as_deref()) else {
            let _ = reply.send(Err(RelayError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "no such track",
            ))));
            return;
        };

        let id = self.next_id;
        self.next_id += 1;
        let token = self.token.child_token();

        let cmd = if self.conf.run_on_read.is_empty() {
            None
        } else {
            Some(self.pool.start(
                &self.conf.run_on_read,
                self.conf.run_on_read_restart,
                self.cmd_env(),
            ))
        };

        self.readers.insert(
            id,
            ReaderEntry {
                token: token.clone(),
                _cmd: cmd,
            },
        );
        self.close_after_deadline = None;
        self.state = PathState::Serving;

        tracing::debug!(path = %self.name, readers = self.readers.len(), "reader attached");

        let _ = reply.send(Ok(ReadGuard {
            reader,
            info: stream.info().clone(),
            token,
            tx: self.self_tx.clone(),
            id,
        }));
    }

    fn flush_pending(&mut self) {
        let info = match &self.stream {
            Some(stream) => stream.info().clone(),
            None => return,
        };
        for reply in self.pending_describes.drain(..) {
            let _ = reply.send(Ok(DescribeAnswer::Info(info.clone())));
        }
        for (tracks, reply) in std::mem::take(&mut self.pending_reads) {
            self.attach_reader(tracks, reply);
        }
    }

    fn start_on_demand(&mut self) {
        if self.static_source.is_some() || self.on_demand_cmd.is_some() {
            return;
        }

        tracing::info!(path = %self.name, "starting on-demand source");
        if self.conf.has_static_source() {
            self.start_static_source();
        } else {
            self.on_demand_cmd = Some(self.pool.start(
                &self.conf.run_on_demand,
                self.conf.run_on_demand_restart,
                self.cmd_env(),
            ));
        }
        self.on_demand_deadline =
            Some(Instant::now() + *self.conf.on_demand_start_timeout());
        self.state = PathState::OnDemandWaiting;
    }

    fn start_static_source(&mut self) {
        if self.static_source.is_some() {
            return;
        }
        let token = self.token.child_token();
        let feed = SourceFeed {
            tx: self.self_tx.clone(),
            path: self.name.clone(),
        };
        tokio::spawn(source::run_static(
            self.source_driver.clone(),
            self.conf.source.clone(),
            feed,
            token.clone(),
        ));
        self.static_source = Some(token);
    }

    fn on_source_gone(&mut self, id: u64) -> ControlFlow<()> {
        let src = match self.source.take() {
            Some(src) if src.id == id => src,
            // a stale guard of an already-replaced source
            other => {
                self.source = other;
                return ControlFlow::Continue(());
            }
        };

        tracing::info!(path = %self.name, "source disconnected");
        src.token.cancel();
        if let Some(stream) = self.stream.take() {
            stream.close();
        }
        self.on_publish_cmd = None;

        // while on-demand waiters are queued, the source task keeps retrying
        // under the still-armed start deadline
        self.state = if self.on_demand_deadline.is_some()
            && (!self.pending_describes.is_empty() || !self.pending_reads.is_empty())
        {
            PathState::OnDemandWaiting
        } else {
            PathState::Initializing
        };
        self.maybe_gc()
    }

    fn on_reader_gone(&mut self, id: u64) -> ControlFlow<()> {
        if self.readers.remove(&id).is_none() {
            return ControlFlow::Continue(());
        }
        tracing::debug!(path = %self.name, readers = self.readers.len(), "reader detached");

        if self.readers.is_empty() {
            if self.state == PathState::Serving {
                self.state = PathState::Ready;
            }
            if self.conf.is_on_demand() && self.stream.is_some() {
                self.close_after_deadline =
                    Some(Instant::now() + *self.conf.on_demand_close_after());
            }
        }
        self.maybe_gc()
    }

    fn on_start_timeout(&mut self) -> ControlFlow<()> {
        self.on_demand_deadline = None;
        if self.stream.is_some() {
            return ControlFlow::Continue(());
        }

        tracing::warn!(path = %self.name, "on-demand source did not become ready in time");
        for reply in self.pending_describes.drain(..) {
            let _ = reply.send(Err(RelayError::Timeout(self.name.clone())));
        }
        for (_, reply) in self.pending_reads.drain(..) {
            let _ = reply.send(Err(RelayError::Timeout(self.name.clone())));
        }
        self.stop_on_demand();
        self.state = PathState::Initializing;
        self.maybe_gc()
    }

    fn on_idle_timeout(&mut self) -> ControlFlow<()> {
        self.close_after_deadline = None;
        if !self.readers.is_empty() {
            return ControlFlow::Continue(());
        }

        tracing::info!(path = %self.name, "closing on-demand source (no readers)");
        if let Some(src) = self.source.take() {
            src.token.cancel();
        }
        if let Some(stream) = self.stream.take() {
            stream.close();
        }
        self.stop_on_demand();
        self.on_publish_cmd = None;
        self.state = PathState::Initializing;
        self.maybe_gc()
    }

    fn stop_on_demand(&mut self) {
        if let Some(token) = self.static_source.take() {
            token.cancel();
        }
        self.on_demand_cmd = None;
    }

    /// A dynamically created path with nothing attached removes itself.
    fn maybe_gc(&mut self) -> ControlFlow<()> {
        let empty = self.source.is_none()
            && self.stream.is_none()
            && self.readers.is_empty()
            && self.pending_describes.is_empty()
            && self.pending_reads.is_empty()
            && self.static_source.is_none()
            && self.on_demand_cmd.is_none();

        if self.dynamic && empty {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    fn close(&mut self) {
        self.state = PathState::Closing;

        for reply in self.pending_describes.drain(..) {
            let _ = reply.send(Err(RelayError::Terminated));
        }
        for (_, reply) in self.pending_reads.drain(..) {
            let _ = reply.send(Err(RelayError::Terminated));
        }
        for (_, reader) in self.readers.drain() {
            reader.token.cancel();
        }
        if let Some(src) = self.source.take() {
            src.token.cancel();
        }
        if let Some(stream) = self.stream.take() {
            stream.close();
        }
        self.stop_on_demand();
        self.on_publish_cmd = None;
        self.on_init_cmd = None;

        let _ = self.manager_tx.send(PathClosed {
            name: self.name.clone(),
            path_id: self.path_id,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::io;
    use std::time::Duration;

    use crate::externalcmd::{Launcher, Running};
    use crate::stream::{Track, TrackKind};

    /// Launcher whose commands never exit on their own.
    struct HangingLauncher;

    struct Hanging;

    #[async_trait]
    impl Launcher for HangingLauncher {
        async fn launch(
            &self,
            _cmdline: &str,
            _env: &[(String, String)],
        ) -> io::Result<Box<dyn Running>> {
            Ok(Box::new(Hanging))
        }
    }

    #[async_trait]
    impl Running for Hanging {
        async fn wait(&mut self) -> io::Result<i32> {
            std::future::pending().await
        }

        async fn kill(&mut self) {}
    }

    fn test_info() -> MediaInfo {
        MediaInfo {
            tracks: vec![Track {
                kind: TrackKind::Video,
                codec: "h264".into(),
                init: Bytes::new(),
            }],
        }
    }

    struct Harness {
        tx: mpsc::UnboundedSender<PathMessage>,
        closed_rx: mpsc::UnboundedReceiver<PathClosed>,
        token: CancellationToken,
    }

    fn spawn_path(conf: PathConf, dynamic: bool) -> Harness {
        let (manager_tx, closed_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let tx = spawn(PathOpts {
            name: "cam1".into(),
            conf: Arc::new(conf),
            conf_name: "cam1".into(),
            dynamic,
            read_buffer_count: 64,
            pool: Pool::new(Arc::new(HangingLauncher)),
            source_driver: Arc::new(source::UnsupportedSourceDriver),
            manager_tx,
            path_id: 1,
            token: token.clone(),
        });
        Harness {
            tx,
            closed_rx,
            token,
        }
    }

    async fn publish(h: &Harness) -> Result<PublishGuard, RelayError> {
        let (reply, rx) = oneshot::channel();
        h.tx.send(PathMessage::Publish {
            info: test_info(),
            internal: false,
            reply,
        })
        .unwrap();
        rx.await.unwrap()
    }

    async fn describe(h: &Harness) -> Result<DescribeAnswer, RelayError> {
        let (reply, rx) = oneshot::channel();
        h.tx.send(PathMessage::Describe { reply }).unwrap();
        rx.await.unwrap()
    }

    async fn read(h: &Harness) -> Result<ReadGuard, RelayError> {
        let (reply, rx) = oneshot::channel();
        h.tx.send(PathMessage::Read {
            tracks: None,
            reply,
        })
        .unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_publish_then_describe() {
        let h = spawn_path(PathConf::default(), false);

        assert!(matches!(
            describe(&h).await,
            Err(RelayError::NotFound(_))
        ));

        let guard = publish(&h).await.unwrap();
        match describe(&h).await.unwrap() {
            DescribeAnswer::Info(info) => assert_eq!(info.tracks.len(), 1),
            other => panic!("unexpected answer: {other:?}"),
        }
        drop(guard);
    }

    #[tokio::test]
    async fn test_second_publisher_gets_busy() {
        let h = spawn_path(PathConf::default(), false);

        let _first = publish(&h).await.unwrap();
        assert!(matches!(publish(&h).await, Err(RelayError::Busy(n)) if n == "cam1"));
    }

    #[tokio::test]
    async fn test_republish_after_source_gone() {
        let h = spawn_path(PathConf::default(), false);

        let first = publish(&h).await.unwrap();
        drop(first);

        // the drop notification is processed in inbox order
        let _second = publish(&h).await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_flow() {
        let h = spawn_path(PathConf::default(), false);
        let publisher = publish(&h).await.unwrap();

        let mut reader = read(&h).await.unwrap();
        publisher
            .stream()
            .write(0, Duration::ZERO, true, Bytes::from_static(b"unit"));

        let unit = reader.next().await.unwrap();
        assert_eq!(unit.payload.as_ref(), b"unit");

        // source leaves: reader drains then observes the end of the stream
        drop(publisher);
        assert_eq!(reader.next().await, Err(StreamReadError::Closed));
    }

    #[tokio::test]
    async fn test_redirect() {
        let conf = PathConf {
            source: "redirect".into(),
            source_redirect: "rtsp://elsewhere/cam1".into(),
            ..PathConf::default()
        };
        let h = spawn_path(conf, false);

        match describe(&h).await.unwrap() {
            DescribeAnswer::Redirect(url) => assert_eq!(url, "rtsp://elsewhere/cam1"),
            other => panic!("unexpected answer: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_demand_start_timeout() {
        let conf = PathConf {
            run_on_demand: "ffmpeg -i nothing".into(),
            run_on_demand_start_timeout: crate::conf::StringDuration::from_secs(2),
            ..PathConf::default()
        };
        let h = spawn_path(conf, false);

        let (reply, rx) = oneshot::channel();
        h.tx.send(PathMessage::Describe { reply }).unwrap();

        // the command never publishes; the deadline fires at 2s
        assert!(matches!(
            rx.await.unwrap(),
            Err(RelayError::Timeout(n)) if n == "cam1"
        ));
    }

    #[tokio::test]
    async fn test_on_demand_publish_flushes_waiters() {
        let conf = PathConf {
            run_on_demand: "publisher-cmd".into(),
            ..PathConf::default()
        };
        let h = spawn_path(conf, false);

        let (reply, describe_rx) = oneshot::channel();
        h.tx.send(PathMessage::Describe { reply }).unwrap();

        // the "command" publishes as a wire publisher would
        let _guard = publish(&h).await.unwrap();

        match describe_rx.await.unwrap().unwrap() {
            DescribeAnswer::Info(info) => assert_eq!(info.tracks.len(), 1),
            other => panic!("unexpected answer: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_demand_idle_close() {
        let conf = PathConf {
            run_on_demand: "publisher-cmd".into(),
            run_on_demand_close_after: crate::conf::StringDuration::from_secs(1),
            ..PathConf::default()
        };
        let h = spawn_path(conf, false);

        let (reply, read_rx) = oneshot::channel();
        h.tx.send(PathMessage::Read {
            tracks: None,
            reply,
        })
        .unwrap();

        let publisher = publish(&h).await.unwrap();
        let reader = read_rx.await.unwrap().unwrap();

        // last reader leaves; close-after fires and the source is evicted
        drop(reader);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(publisher.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_dynamic_path_removes_itself() {
        let mut h = spawn_path(PathConf::default(), true);

        // a failed describe leaves the path empty, so it goes away
        assert!(matches!(describe(&h).await, Err(RelayError::NotFound(_))));

        let closed = h.closed_rx.recv().await.unwrap();
        assert_eq!(closed.name, "cam1");
        assert_eq!(closed.path_id, 1);
    }

    #[tokio::test]
    async fn test_close_evicts_everyone() {
        let mut h = spawn_path(PathConf::default(), false);
        let publisher = publish(&h).await.unwrap();
        let reader = read(&h).await.unwrap();

        h.token.cancel();
        let _ = h.closed_rx.recv().await;

        assert!(publisher.token().is_cancelled());
        assert!(reader.token().is_cancelled());
    }
}

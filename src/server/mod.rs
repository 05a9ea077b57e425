//! Protocol-server supervisor
//!
//! Every TCP front-end instantiates this skeleton: an accept loop feeding a
//! request loop that owns the connection registry, per-connection actors, and
//! an API surface (list, kick). The registry is only ever touched from the
//! request loop, so it needs no lock. Shutdown cancels the token, closes the
//! listener, and waits (bounded) for the connection actors to finish.

pub mod conn;
pub mod framed;
pub mod wire;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::error::RelayError;
use crate::path::manager::PathManagerHandle;
use self::conn::ConnCounters;
use self::wire::WireFactory;

/// Bound on the graceful part of a server shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Turns a configuration address like `:8554` into a bindable one.
pub(crate) fn parse_address(s: &str) -> io::Result<SocketAddr> {
    let full;
    let s = if s.starts_with(':') {
        full = format!("0.0.0.0{s}");
        full.as_str()
    } else {
        s
    };
    s.parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid address: '{s}'")))
}

/// UTC timestamp in RFC 3339 shape, for API payloads.
pub(crate) fn rfc3339(t: SystemTime) -> String {
    let secs = t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
    let days = secs.div_euclid(86400);
    let rem = secs.rem_euclid(86400);
    let (hh, mm, ss) = (rem / 3600, (rem % 3600) / 60, rem % 60);

    // civil-from-days
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);

    format!("{year:04}-{month:02}-{day:02}T{hh:02}:{mm:02}:{ss:02}Z")
}

/// One connection in an API listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConnInfo {
    pub id: Uuid,
    pub created: String,
    pub remote_addr: String,
    pub state: &'static str,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

pub(crate) enum ServerRequest {
    ConnNew {
        socket: TcpStream,
        addr: SocketAddr,
    },
    ConnClosed {
        id: Uuid,
    },
    ApiList {
        reply: oneshot::Sender<Vec<ApiConnInfo>>,
    },
    ApiKick {
        id: Uuid,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
}

/// Handle used by the control API and the metrics endpoint.
#[derive(Clone)]
pub struct ServerHandle {
    tx: mpsc::UnboundedSender<ServerRequest>,
}

impl ServerHandle {
    pub async fn api_list(&self) -> Result<Vec<ApiConnInfo>, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ServerRequest::ApiList { reply })
            .map_err(|_| RelayError::Terminated)?;
        rx.await.map_err(|_| RelayError::Terminated)
    }

    pub async fn api_kick(&self, id: Uuid) -> Result<(), RelayError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ServerRequest::ApiKick { id, reply })
            .map_err(|_| RelayError::Terminated)?;
        rx.await.map_err(|_| RelayError::Terminated)?
    }
}

pub struct ServerOpts {
    /// Lowercase protocol label ("rtsp", "rtmps", ...), used in logs and as
    /// the auth protocol field.
    pub protocol: &'static str,
    pub address: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub factory: Arc<dyn WireFactory>,
}

struct ConnSlot {
    addr: SocketAddr,
    created: SystemTime,
    counters: Arc<ConnCounters>,
    token: CancellationToken,
}

/// A running front-end listener plus its connection pool.
pub struct Server {
    protocol: &'static str,
    local_addr: SocketAddr,
    handle: ServerHandle,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Server {
    pub async fn new(
        opts: ServerOpts,
        manager: PathManagerHandle,
        parent: &CancellationToken,
    ) -> io::Result<Server> {
        let listener = TcpListener::bind(parse_address(&opts.address)?).await?;
        let local_addr = listener.local_addr()?;

        let token = parent.child_token();
        let tracker = TaskTracker::new();
        let (tx, rx) = mpsc::unbounded_channel();

        tracing::info!(protocol = opts.protocol, addr = %local_addr, "listener opened");

        // accept loop
        {
            let token = token.clone();
            let tx = tx.clone();
            let protocol = opts.protocol;
            tracker.spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        accepted = listener.accept() => match accepted {
                            Ok((socket, addr)) => {
                                let _ = tx.send(ServerRequest::ConnNew { socket, addr });
                            }
                            Err(e) => {
                                tracing::error!(protocol, error = %e, "accept failed");
                            }
                        }
                    }
                }
            });
        }

        // request loop
        {
            let loop_ = RequestLoop {
                protocol: opts.protocol,
                read_timeout: opts.read_timeout,
                write_timeout: opts.write_timeout,
                factory: opts.factory,
                manager,
                token: token.clone(),
                tracker: tracker.clone(),
                tx: tx.clone(),
                rx,
                conns: HashMap::new(),
            };
            tracker.spawn(loop_.run());
        }

        Ok(Server {
            protocol: opts.protocol,
            local_addr,
            handle: ServerHandle { tx },
            token,
            tracker,
        })
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, evicts every connection, waits bounded.
    pub async fn close(&self) {
        self.token.cancel();
        self.tracker.close();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(protocol = self.protocol, "shutdown timed out, aborting connections");
        }
        tracing::info!(protocol = self.protocol, "listener closed");
    }
}

struct RequestLoop {
    protocol: &'static str,
    read_timeout: Duration,
    write_timeout: Duration,
    factory: Arc<dyn WireFactory>,
    manager: PathManagerHandle,
    token: CancellationToken,
    tracker: TaskTracker,
    tx: mpsc::UnboundedSender<ServerRequest>,
    rx: mpsc::UnboundedReceiver<ServerRequest>,
    conns: HashMap<Uuid, ConnSlot>,
}

impl RequestLoop {
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

    fn handle(&mut self, req: ServerRequest) {
        match req {
            ServerRequest::ConnNew { socket, addr } => self.on_conn_new(socket, addr),
            ServerRequest::ConnClosed { id } => {
                if self.conns.remove(&id).is_some() {
                    tracing::debug!(protocol = self.protocol, id = %id, "connection removed");
                }
            }
            ServerRequest::ApiList { reply } => {
                let mut items: Vec<ApiConnInfo> = self
                    .conns
                    .iter()
                    .map(|(id, slot)| ApiConnInfo {
                        id: *id,
                        created: rfc3339(slot.created),
                        remote_addr: slot.addr.to_string(),
                        state: slot.counters.state(),
                        bytes_received: slot.counters.bytes_received(),
                        bytes_sent: slot.counters.bytes_sent(),
                    })
                    .collect();
                items.sort_by(|a, b| a.created.cmp(&b.created));
                let _ = reply.send(items);
            }
            ServerRequest::ApiKick { id, reply } => {
                let result = match self.conns.get(&id) {
                    Some(slot) => {
                        tracing::info!(protocol = self.protocol, id = %id, "kicking connection");
                        slot.token.cancel();
                        Ok(())
                    }
                    None => Err(RelayError::NotFound(id.to_string())),
                };
                let _ = reply.send(result);
            }
        }
    }

    fn on_conn_new(&mut self, socket: TcpStream, addr: SocketAddr) {
        if socket.set_nodelay(true).is_err() {
            tracing::debug!(protocol = self.protocol, addr = %addr, "set_nodelay failed");
        }

        let id = Uuid::new_v4();
        let counters = Arc::new(ConnCounters::default());
        let conn_token = self.token.child_token();
        let wire = self.factory.open(socket, addr);

        self.conns.insert(
            id,
            ConnSlot {
                addr,
                created: SystemTime::now(),
                counters: counters.clone(),
                token: conn_token.clone(),
            },
        );
        tracing::info!(protocol = self.protocol, id = %id, addr = %addr, "connection opened");

        self.tracker.spawn(conn::run(conn::ConnCtx {
            id,
            addr,
            wire,
            manager: self.manager.clone(),
            protocol: self.protocol,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            token: conn_token,
            counters,
            server_tx: self.tx.clone(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::framed::{FramedPublisher, FramedReader, FramedWireFactory};
    use super::*;
    use bytes::Bytes;

    use crate::conf::PathConfs;
    use crate::externalcmd::{Pool, ProcessLauncher};
    use crate::path::manager::{PathManager, PathManagerOpts};
    use crate::path::source::UnsupportedSourceDriver;
    use crate::stream::{MediaInfo, Track, TrackKind, Unit};

    fn test_info() -> MediaInfo {
        MediaInfo {
            tracks: vec![Track {
                kind: TrackKind::Video,
                codec: "h264".into(),
                init: Bytes::from_static(b"\x67"),
            }],
        }
    }

    fn paths_yaml(yaml: &str) -> PathConfs {
        let conf: crate::conf::Conf =
            crate::conf::Conf::from_value(serde_yaml::from_str(yaml).unwrap()).unwrap();
        conf.paths
    }

    async fn spawn_server(paths: PathConfs) -> (Server, CancellationToken) {
        let token = CancellationToken::new();
        let manager = PathManager::spawn(
            PathManagerOpts {
                read_buffer_count: 64,
                auth_timeout: Duration::from_secs(1),
                external_auth_url: None,
                paths,
                pool: Pool::new(Arc::new(ProcessLauncher)),
                source_driver: Arc::new(UnsupportedSourceDriver),
            },
            token.clone(),
        );
        let server = Server::new(
            ServerOpts {
                protocol: "framed",
                address: "127.0.0.1:0".into(),
                read_timeout: Duration::from_secs(5),
                write_timeout: Duration::from_secs(5),
                factory: Arc::new(FramedWireFactory),
            },
            manager,
            &token,
        )
        .await
        .unwrap();
        (server, token)
    }

    #[tokio::test]
    async fn test_publish_and_read_over_tcp() {
        let (server, _token) = spawn_server(paths_yaml("paths:\n  cam1:\n")).await;
        let addr = server.local_addr();

        let mut publisher =
            FramedPublisher::connect(addr, "cam1", None, None, test_info())
                .await
                .unwrap();
        let mut reader = FramedReader::connect(addr, "cam1", None, None, None)
            .await
            .unwrap();
        assert_eq!(reader.info().tracks.len(), 1);

        for i in 0..100u64 {
            publisher
                .send_unit(&Unit::new(
                    0,
                    Duration::from_millis(i),
                    i == 0,
                    Bytes::from(i.to_be_bytes().to_vec()),
                ))
                .await
                .unwrap();
        }

        for i in 0..100u64 {
            let unit = reader.recv_unit().await.unwrap().unwrap();
            assert_eq!(unit.payload.as_ref(), &i.to_be_bytes());
        }
    }

    #[tokio::test]
    async fn test_refused_intent_maps_error() {
        let (server, _token) = spawn_server(paths_yaml(
            "paths:\n  cam1:\n    publishUser: u\n    publishPass: p\n",
        ))
        .await;
        let addr = server.local_addr();

        let err = FramedPublisher::connect(addr, "cam1", None, None, test_info())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::AuthNotCritical));

        let err = FramedPublisher::connect(addr, "cam1", Some("u"), Some("x"), test_info())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::AuthCritical(_)));

        let _ok = FramedPublisher::connect(addr, "cam1", Some("u"), Some("p"), test_info())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_api_list_and_kick() {
        let (server, _token) = spawn_server(paths_yaml("paths:\n  cam1:\n")).await;
        let addr = server.local_addr();
        let handle = server.handle();

        let _publisher = FramedPublisher::connect(addr, "cam1", None, None, test_info())
            .await
            .unwrap();
        // let the actor register its role
        tokio::time::sleep(Duration::from_millis(50)).await;

        let items = handle.api_list().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].state, "publish");

        handle.api_kick(items[0].id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.api_list().await.unwrap().is_empty());

        assert!(matches!(
            handle.api_kick(Uuid::new_v4()).await,
            Err(RelayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_graceful_shutdown() {
        let (server, _token) = spawn_server(paths_yaml("paths:\n  cam1:\n")).await;
        let addr = server.local_addr();

        let _publisher = FramedPublisher::connect(addr, "cam1", None, None, test_info())
            .await
            .unwrap();

        server.close().await;

        // the request loop is gone, so the API surface reports termination
        assert!(matches!(
            server.handle().api_list().await,
            Err(RelayError::Terminated)
        ));
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(
            parse_address(":8554").unwrap(),
            "0.0.0.0:8554".parse().unwrap()
        );
        assert_eq!(
            parse_address("127.0.0.1:9000").unwrap(),
            "127.0.0.1:9000".parse().unwrap()
        );
        assert!(parse_address("nope").is_err());
    }

    #[test]
    fn test_rfc3339() {
        assert_eq!(rfc3339(UNIX_EPOCH), "1970-01-01T00:00:00Z");
        assert_eq!(
            rfc3339(UNIX_EPOCH + Duration::from_secs(1_700_000_000)),
            "2023-11-14T22:13:20Z"
        );
    }
}

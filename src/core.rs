//! Supervisor: builds, hot-reloads and tears down the subsystems
//!
//! A reload never restarts the world: every subsystem gets a `must_restart`
//! verdict computed from the fields it consumes, widened transitively (a
//! path-manager restart takes its dependents with it). Unchanged paths keep
//! running across a reload; only the manager's path table is refreshed.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiHandles, ApiServer};
use crate::conf::{Conf, ConfError, Encryption};
use crate::externalcmd::{Launcher, Pool, ProcessLauncher};
use crate::front::hls::{HlsServer, HlsServerOpts, RawSegmenterFactory, SegmenterFactory};
use crate::front::webrtc::{
    SignalFactory, UnsupportedSignalFactory, WebRtcServer, WebRtcServerOpts,
};
use crate::logger::{self, LogHandle};
use crate::metrics::Metrics;
use crate::path::manager::{PathManager, PathManagerHandle, PathManagerOpts};
use crate::path::source::{SourceDriver, UnsupportedSourceDriver};
use crate::server::framed::FramedWireFactory;
use crate::server::wire::WireFactory;
use crate::server::{Server, ServerOpts};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Conf(#[from] ConfError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Pluggable collaborators of the core (wire codecs, segmenter, signaling,
/// pull sources, process launcher). The defaults are the built-in framed
/// driver and placeholder seams.
pub struct CoreOpts {
    pub rtsp_wire: Arc<dyn WireFactory>,
    pub rtmp_wire: Arc<dyn WireFactory>,
    pub segmenter: Arc<dyn SegmenterFactory>,
    pub signal: Arc<dyn SignalFactory>,
    pub source_driver: Arc<dyn SourceDriver>,
    pub launcher: Arc<dyn Launcher>,
}

impl Default for CoreOpts {
    fn default() -> Self {
        Self {
            rtsp_wire: Arc::new(FramedWireFactory),
            rtmp_wire: Arc::new(FramedWireFactory),
            segmenter: Arc::new(RawSegmenterFactory),
            signal: Arc::new(UnsupportedSignalFactory),
            source_driver: Arc::new(UnsupportedSourceDriver),
            launcher: Arc::new(ProcessLauncher),
        }
    }
}

/// Bound listener addresses, resolved at startup (useful with port 0).
#[derive(Debug, Clone, Default)]
pub struct CoreAddrs {
    pub rtsp: Option<std::net::SocketAddr>,
    pub rtsps: Option<std::net::SocketAddr>,
    pub rtmp: Option<std::net::SocketAddr>,
    pub rtmps: Option<std::net::SocketAddr>,
    pub hls: Option<std::net::SocketAddr>,
    pub webrtc: Option<std::net::SocketAddr>,
    pub api: Option<std::net::SocketAddr>,
    pub metrics: Option<std::net::SocketAddr>,
}

enum CoreEvent {
    /// A new tree arrived through the control API.
    ConfSet(Conf),
    /// The embedder (or a file watcher) asked for a reload from disk.
    ReloadFile,
}

/// A running relay instance.
pub struct Core {
    token: CancellationToken,
    event_tx: mpsc::UnboundedSender<CoreEvent>,
    addrs: CoreAddrs,
    done: tokio::task::JoinHandle<()>,
}

impl Core {
    /// Loads the configuration and starts every subsystem. A failure here is
    /// fatal to the process.
    pub async fn start(conf_path: PathBuf, opts: CoreOpts) -> Result<Core, CoreError> {
        let (conf, conf_found) = Conf::load(&conf_path)?;
        let log = logger::init(&conf)?;

        tracing::info!(version = VERSION, "mediarelay starting");
        if !conf_found {
            tracing::warn!(
                path = %conf_path.display(),
                "configuration file not found, using defaults"
            );
        }

        let token = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (conf_set_tx, mut conf_set_rx) = mpsc::unbounded_channel::<Conf>();

        // the API posts raw trees; wrap them as events
        {
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                while let Some(conf) = conf_set_rx.recv().await {
                    let _ = event_tx.send(CoreEvent::ConfSet(conf));
                }
            });
        }

        let mut inner = CoreInner {
            conf: Arc::new(conf),
            conf_path,
            opts,
            log,
            token: token.clone(),
            pool: None,
            conf_set_tx,
            resources: Resources::default(),
        };
        inner.create_resources(true).await?;
        let addrs = inner.addrs();

        let done = tokio::spawn(inner.run(event_rx));

        Ok(Core {
            token,
            event_tx,
            addrs,
            done,
        })
    }

    /// Asks the supervisor to reload the configuration file. This is the
    /// hook a file watcher plugs into.
    pub fn reload(&self) {
        let _ = self.event_tx.send(CoreEvent::ReloadFile);
    }

    /// Begins a graceful shutdown.
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Listener addresses bound at startup.
    pub fn addrs(&self) -> &CoreAddrs {
        &self.addrs
    }

    /// Waits until the supervisor has torn everything down.
    pub async fn wait(self) {
        let _ = self.done.await;
    }
}

#[derive(Default)]
struct Resources {
    metrics: Option<Metrics>,
    manager: Option<(PathManagerHandle, CancellationToken)>,
    rtsp: Option<Server>,
    rtsps: Option<Server>,
    rtmp: Option<Server>,
    rtmps: Option<Server>,
    hls: Option<HlsServer>,
    webrtc: Option<WebRtcServer>,
    api: Option<ApiServer>,
}

struct CoreInner {
    conf: Arc<Conf>,
    conf_path: PathBuf,
    opts: CoreOpts,
    log: LogHandle,
    token: CancellationToken,
    pool: Option<Pool>,
    conf_set_tx: mpsc::UnboundedSender<Conf>,
    resources: Resources,
}

impl CoreInner {
    async fn run(mut self, mut event_rx: mpsc::UnboundedReceiver<CoreEvent>) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutting down gracefully");
                    break;
                }
                event = event_rx.recv() => match event {
                    Some(CoreEvent::ConfSet(conf)) => {
                        tracing::info!("reloading configuration (API request)");
                        if let Err(e) = self.reload(conf, true).await {
                            tracing::error!(error = %e, "reload failed");
                            break;
                        }
                    }
                    Some(CoreEvent::ReloadFile) => {
                        tracing::info!("reloading configuration (file changed)");
                        match Conf::load(&self.conf_path) {
                            Ok((conf, _)) => {
                                if let Err(e) = self.reload(conf, false).await {
                                    tracing::error!(error = %e, "reload failed");
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "cannot load configuration");
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
        }

        self.token.cancel();
        self.close_resources(None, false).await;
        if let Some(pool) = self.pool.take() {
            tracing::info!("waiting for external commands");
            pool.close().await;
        }
    }

    async fn reload(&mut self, new_conf: Conf, called_by_api: bool) -> Result<(), CoreError> {
        let new_conf = Arc::new(new_conf);
        self.close_resources(Some(&new_conf), called_by_api).await;
        self.conf = new_conf;
        self.create_resources(false).await?;
        Ok(())
    }

    fn addrs(&self) -> CoreAddrs {
        CoreAddrs {
            rtsp: self.resources.rtsp.as_ref().map(|s| s.local_addr()),
            rtsps: self.resources.rtsps.as_ref().map(|s| s.local_addr()),
            rtmp: self.resources.rtmp.as_ref().map(|s| s.local_addr()),
            rtmps: self.resources.rtmps.as_ref().map(|s| s.local_addr()),
            hls: self.resources.hls.as_ref().map(|s| s.local_addr()),
            webrtc: self.resources.webrtc.as_ref().map(|s| s.local_addr()),
            api: self.resources.api.as_ref().map(|s| s.local_addr()),
            metrics: self.resources.metrics.as_ref().map(|m| m.local_addr()),
        }
    }

    async fn create_resources(&mut self, initial: bool) -> Result<(), CoreError> {
        let conf = self.conf.clone();

        if initial {
            self.pool = Some(Pool::new(self.opts.launcher.clone()));
        }
        let pool = self.pool.clone().expect("command pool exists");

        if conf.metrics && self.resources.metrics.is_none() {
            self.resources.metrics =
                Some(Metrics::new(&conf.metrics_address, &self.token).await?);
        }

        if self.resources.manager.is_none() {
            let mgr_token = self.token.child_token();
            let handle = PathManager::spawn(
                PathManagerOpts {
                    read_buffer_count: conf.read_buffer_count,
                    auth_timeout: *conf.read_timeout,
                    external_auth_url: Some(conf.external_authentication_url.clone()),
                    paths: conf.paths.clone(),
                    pool: pool.clone(),
                    source_driver: self.opts.source_driver.clone(),
                },
                mgr_token.clone(),
            );
            self.resources.manager = Some((handle, mgr_token));
        }
        let manager = self
            .resources
            .manager
            .as_ref()
            .expect("path manager just created")
            .0
            .clone();

        if !conf.rtsp_disable
            && matches!(conf.rtsp_encryption, Encryption::No | Encryption::Optional)
            && self.resources.rtsp.is_none()
        {
            self.resources.rtsp = Some(
                Server::new(
                    ServerOpts {
                        protocol: "rtsp",
                        address: conf.rtsp_address.clone(),
                        read_timeout: *conf.read_timeout,
                        write_timeout: *conf.write_timeout,
                        factory: self.opts.rtsp_wire.clone(),
                    },
                    manager.clone(),
                    &self.token,
                )
                .await?,
            );
        }

        if !conf.rtsp_disable
            && matches!(conf.rtsp_encryption, Encryption::Strict | Encryption::Optional)
            && self.resources.rtsps.is_none()
        {
            self.resources.rtsps = Some(
                Server::new(
                    ServerOpts {
                        protocol: "rtsps",
                        address: conf.rtsps_address.clone(),
                        read_timeout: *conf.read_timeout,
                        write_timeout: *conf.write_timeout,
                        factory: self.opts.rtsp_wire.clone(),
                    },
                    manager.clone(),
                    &self.token,
                )
                .await?,
            );
        }

        if !conf.rtmp_disable
            && matches!(conf.rtmp_encryption, Encryption::No | Encryption::Optional)
            && self.resources.rtmp.is_none()
        {
            self.resources.rtmp = Some(
                Server::new(
                    ServerOpts {
                        protocol: "rtmp",
                        address: conf.rtmp_address.clone(),
                        read_timeout: *conf.read_timeout,
                        write_timeout: *conf.write_timeout,
                        factory: self.opts.rtmp_wire.clone(),
                    },
                    manager.clone(),
                    &self.token,
                )
                .await?,
            );
        }

        if !conf.rtmp_disable
            && matches!(conf.rtmp_encryption, Encryption::Strict | Encryption::Optional)
            && self.resources.rtmps.is_none()
        {
            self.resources.rtmps = Some(
                Server::new(
                    ServerOpts {
                        protocol: "rtmps",
                        address: conf.rtmps_address.clone(),
                        read_timeout: *conf.read_timeout,
                        write_timeout: *conf.write_timeout,
                        factory: self.opts.rtmp_wire.clone(),
                    },
                    manager.clone(),
                    &self.token,
                )
                .await?,
            );
        }

        if !conf.hls_disable && self.resources.hls.is_none() {
            self.resources.hls = Some(
                HlsServer::new(
                    HlsServerOpts {
                        address: conf.hls_address.clone(),
                        segment_count: conf.hls_segment_count,
                        segment_duration: *conf.hls_segment_duration,
                        allow_origin: conf.hls_allow_origin.clone(),
                        segmenter: self.opts.segmenter.clone(),
                    },
                    manager.clone(),
                    &self.token,
                )
                .await?,
            );
        }

        if !conf.webrtc_disable && self.resources.webrtc.is_none() {
            self.resources.webrtc = Some(
                WebRtcServer::new(
                    WebRtcServerOpts {
                        address: conf.webrtc_address.clone(),
                        ice_servers: conf.webrtc_ice_servers.clone(),
                        ice_udp_mux_address: conf.webrtc_ice_udp_mux_address.clone(),
                        ice_tcp_mux_address: conf.webrtc_ice_tcp_mux_address.clone(),
                        signal: self.opts.signal.clone(),
                    },
                    manager.clone(),
                    &self.token,
                )
                .await?,
            );
        }

        if conf.api && self.resources.api.is_none() {
            self.resources.api = Some(
                ApiServer::new(
                    &conf.api_address,
                    conf.clone(),
                    ApiHandles {
                        manager: manager.clone(),
                        rtsp: self.resources.rtsp.as_ref().map(|s| s.handle()),
                        rtsps: self.resources.rtsps.as_ref().map(|s| s.handle()),
                        rtmp: self.resources.rtmp.as_ref().map(|s| s.handle()),
                        rtmps: self.resources.rtmps.as_ref().map(|s| s.handle()),
                        hls: self.resources.hls.as_ref().map(|s| s.handle()),
                        webrtc: self.resources.webrtc.as_ref().map(|s| s.handle()),
                    },
                    self.conf_set_tx.clone(),
                    &self.token,
                )
                .await?,
            );
        }

        // every (re)build refreshes the metrics registrations
        if let Some(metrics) = &self.resources.metrics {
            metrics.clear();
            metrics.set_path_manager(manager.clone());
            for (label, server) in [
                ("rtsp", &self.resources.rtsp),
                ("rtsps", &self.resources.rtsps),
                ("rtmp", &self.resources.rtmp),
                ("rtmps", &self.resources.rtmps),
            ] {
                if let Some(server) = server {
                    metrics.set_server(label, server.handle());
                }
            }
            if let Some(hls) = &self.resources.hls {
                metrics.set_hls(hls.handle());
            }
            if let Some(webrtc) = &self.resources.webrtc {
                metrics.set_webrtc(webrtc.handle());
            }
        }

        Ok(())
    }

    /// Computes per-subsystem restart verdicts against `new_conf` and closes
    /// what must go, in dependency order. `new_conf == None` closes
    /// everything (shutdown).
    async fn close_resources(&mut self, new_conf: Option<&Arc<Conf>>, called_by_api: bool) {
        let old = &self.conf;

        let close_logger = match new_conf {
            None => true,
            Some(new) => {
                new.log_level != old.log_level
                    || new.log_destinations != old.log_destinations
                    || new.log_file != old.log_file
            }
        };

        let close_metrics = match new_conf {
            None => true,
            Some(new) => new.metrics != old.metrics || new.metrics_address != old.metrics_address,
        };

        let close_path_manager = match new_conf {
            None => true,
            Some(new) => {
                new.read_timeout != old.read_timeout
                    || new.write_timeout != old.write_timeout
                    || new.read_buffer_count != old.read_buffer_count
                    || new.external_authentication_url != old.external_authentication_url
                    || close_metrics
            }
        };
        if !close_path_manager {
            if let Some(new) = new_conf {
                if new.paths != old.paths {
                    if let Some((manager, _)) = &self.resources.manager {
                        manager.conf_reload(new.paths.clone());
                    }
                }
            }
        }

        let common_changed = |new: &Conf| {
            new.read_timeout != old.read_timeout || new.write_timeout != old.write_timeout
        };

        let close_rtsp = match new_conf {
            None => true,
            Some(new) => {
                new.rtsp_disable != old.rtsp_disable
                    || new.rtsp_encryption != old.rtsp_encryption
                    || new.rtsp_address != old.rtsp_address
                    || common_changed(new)
                    || close_path_manager
            }
        };

        let close_rtsps = match new_conf {
            None => true,
            Some(new) => {
                new.rtsp_disable != old.rtsp_disable
                    || new.rtsp_encryption != old.rtsp_encryption
                    || new.rtsps_address != old.rtsps_address
                    || new.server_cert != old.server_cert
                    || new.server_key != old.server_key
                    || common_changed(new)
                    || close_path_manager
            }
        };

        let close_rtmp = match new_conf {
            None => true,
            Some(new) => {
                new.rtmp_disable != old.rtmp_disable
                    || new.rtmp_encryption != old.rtmp_encryption
                    || new.rtmp_address != old.rtmp_address
                    || common_changed(new)
                    || close_path_manager
            }
        };

        let close_rtmps = match new_conf {
            None => true,
            Some(new) => {
                new.rtmp_disable != old.rtmp_disable
                    || new.rtmp_encryption != old.rtmp_encryption
                    || new.rtmps_address != old.rtmps_address
                    || new.rtmp_server_cert != old.rtmp_server_cert
                    || new.rtmp_server_key != old.rtmp_server_key
                    || common_changed(new)
                    || close_path_manager
            }
        };

        let close_hls = match new_conf {
            None => true,
            Some(new) => {
                new.hls_disable != old.hls_disable
                    || new.hls_address != old.hls_address
                    || new.hls_segment_count != old.hls_segment_count
                    || new.hls_segment_duration != old.hls_segment_duration
                    || new.hls_allow_origin != old.hls_allow_origin
                    || close_path_manager
            }
        };

        let close_webrtc = match new_conf {
            None => true,
            Some(new) => {
                new.webrtc_disable != old.webrtc_disable
                    || new.webrtc_address != old.webrtc_address
                    || new.webrtc_ice_servers != old.webrtc_ice_servers
                    || new.webrtc_ice_udp_mux_address != old.webrtc_ice_udp_mux_address
                    || new.webrtc_ice_tcp_mux_address != old.webrtc_ice_tcp_mux_address
                    || close_path_manager
            }
        };

        let close_api = match new_conf {
            None => true,
            Some(new) => {
                new.api != old.api
                    || new.api_address != old.api_address
                    || close_path_manager
                    || close_rtsp
                    || close_rtsps
                    || close_rtmp
                    || close_rtmps
                    || close_hls
                    || close_webrtc
            }
        };

        // teardown order: API, then servers, then the manager, then metrics,
        // then the logger
        if close_api {
            if let Some(api) = self.resources.api.take() {
                api.close().await;
            }
        } else if !called_by_api {
            if let (Some(api), Some(new)) = (&self.resources.api, new_conf) {
                api.conf_reload(new.clone());
            }
        }

        if close_rtsps {
            if let Some(server) = self.resources.rtsps.take() {
                server.close().await;
            }
        }
        if close_rtsp {
            if let Some(server) = self.resources.rtsp.take() {
                server.close().await;
            }
        }
        if close_rtmps {
            if let Some(server) = self.resources.rtmps.take() {
                server.close().await;
            }
        }
        if close_rtmp {
            if let Some(server) = self.resources.rtmp.take() {
                server.close().await;
            }
        }
        if close_webrtc {
            if let Some(server) = self.resources.webrtc.take() {
                server.close().await;
            }
        }
        if close_hls {
            if let Some(server) = self.resources.hls.take() {
                server.close().await;
            }
        }

        if close_path_manager {
            if let Some((_, mgr_token)) = self.resources.manager.take() {
                mgr_token.cancel();
            }
        }

        if close_metrics {
            if let Some(metrics) = self.resources.metrics.take() {
                metrics.close().await;
            }
        }

        if close_logger {
            if let Some(new) = new_conf {
                if let Err(e) = self.log.reconfigure(new) {
                    tracing::warn!(error = %e, "cannot reconfigure logging");
                }
            }
        }
    }
}

//! Path manager: the registry of all paths
//!
//! A single actor owns the path map and the ordered pattern table, so path
//! creation races (two readers describing the same on-demand path at once)
//! and reload-versus-request races collapse into plain sequential code. The
//! media hot path does not traverse the manager: once a publisher or reader
//! holds its guard, units flow through the stream object directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::source::SourceDriver;
use super::{DescribeAnswer, PathClosed, PathInfo, PathMessage, PathOpts, PublishGuard, ReadGuard};
use crate::auth::{AccessInfo, AuthAction, Authenticator};
use crate::conf::{compile_pattern, PathConf, PathConfs};
use crate::error::RelayError;
use crate::externalcmd::Pool;
use crate::stream::MediaInfo;

/// Construction parameters of the manager.
pub struct PathManagerOpts {
    pub read_buffer_count: usize,
    /// Bound on one external-authentication round trip.
    pub auth_timeout: Duration,
    pub external_auth_url: Option<String>,
    pub paths: PathConfs,
    pub pool: Pool,
    pub source_driver: Arc<dyn SourceDriver>,
}

enum ManagerRequest {
    Describe {
        name: String,
        access: AccessInfo,
        reply: oneshot::Sender<Result<DescribeAnswer, RelayError>>,
    },
    Publish {
        name: String,
        access: AccessInfo,
        info: MediaInfo,
        reply: oneshot::Sender<Result<PublishGuard, RelayError>>,
    },
    Read {
        name: String,
        access: AccessInfo,
        tracks: Option<Vec<usize>>,
        reply: oneshot::Sender<Result<ReadGuard, RelayError>>,
    },
    ConfReload {
        paths: PathConfs,
    },
    ApiList {
        reply: oneshot::Sender<Vec<PathInfo>>,
    },
    ApiKick {
        name: String,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
}

/// Cheap handle used by front-ends, the API and the supervisor.
#[derive(Clone)]
pub struct PathManagerHandle {
    tx: mpsc::UnboundedSender<ManagerRequest>,
}

impl PathManagerHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, RelayError>>) -> ManagerRequest,
    ) -> Result<T, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| RelayError::Terminated)?;
        rx.await.map_err(|_| RelayError::Terminated)?
    }

    /// Resolves a path and returns its media description or a redirect. May
    /// wait while an on-demand source starts, up to its start timeout.
    pub async fn describe(
        &self,
        name: &str,
        access: AccessInfo,
    ) -> Result<DescribeAnswer, RelayError> {
        self.request(|reply| ManagerRequest::Describe {
            name: name.to_string(),
            access,
            reply,
        })
        .await
    }

    /// Attaches a publisher to a path.
    pub async fn publish(
        &self,
        name: &str,
        access: AccessInfo,
        info: MediaInfo,
    ) -> Result<PublishGuard, RelayError> {
        self.request(|reply| ManagerRequest::Publish {
            name: name.to_string(),
            access,
            info,
            reply,
        })
        .await
    }

    /// Attaches a reader to a path. May wait for an on-demand source.
    pub async fn read(
        &self,
        name: &str,
        access: AccessInfo,
        tracks: Option<Vec<usize>>,
    ) -> Result<ReadGuard, RelayError> {
        self.request(|reply| ManagerRequest::Read {
            name: name.to_string(),
            access,
            tracks,
            reply,
        })
        .await
    }

    /// Swaps the path table. Paths whose entry is unchanged keep running.
    pub fn conf_reload(&self, paths: PathConfs) {
        let _ = self.tx.send(ManagerRequest::ConfReload { paths });
    }

    pub async fn api_paths_list(&self) -> Result<Vec<PathInfo>, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerRequest::ApiList { reply })
            .map_err(|_| RelayError::Terminated)?;
        rx.await.map_err(|_| RelayError::Terminated)
    }

    pub async fn api_paths_kick(&self, name: &str) -> Result<(), RelayError> {
        self.request(|reply| ManagerRequest::ApiKick {
            name: name.to_string(),
            reply,
        })
        .await
    }
}

struct ConfEntry {
    name: String,
    conf: Arc<PathConf>,
    regex: Option<Regex>,
}

struct PathSlot {
    tx: mpsc::UnboundedSender<PathMessage>,
    token: CancellationToken,
    conf: Arc<PathConf>,
    conf_name: String,
    path_id: u64,
}

pub struct PathManager {
    read_buffer_count: usize,
    authenticator: Arc<Authenticator>,
    pool: Pool,
    source_driver: Arc<dyn SourceDriver>,
    token: CancellationToken,

    entries: Vec<ConfEntry>,
    paths: HashMap<String, PathSlot>,
    next_path_id: u64,

    rx: mpsc::UnboundedReceiver<ManagerRequest>,
    closed_tx: mpsc::UnboundedSender<PathClosed>,
    closed_rx: mpsc::UnboundedReceiver<PathClosed>,
}

impl PathManager {
    /// Spawns the manager actor; it stops when `token` is cancelled.
    pub fn spawn(opts: PathManagerOpts, token: CancellationToken) -> PathManagerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();

        let mut manager = PathManager {
            read_buffer_count: opts.read_buffer_count,
            authenticator: Arc::new(Authenticator::new(
                opts.external_auth_url,
                opts.auth_timeout,
            )),
            pool: opts.pool,
            source_driver: opts.source_driver,
            token,
            entries: build_entries(&opts.paths),
            paths: HashMap::new(),
            next_path_id: 0,
            rx,
            closed_tx,
            closed_rx,
        };

        tokio::spawn(async move {
            manager.create_eager_paths();
            manager.run().await;
        });

        PathManagerHandle { tx }
    }

    async fn run(&mut self) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                req = self.rx.recv() => match req {
                    Some(req) => self.handle(req).await,
                    None => break,
                },
                closed = self.closed_rx.recv() => {
                    if let Some(closed) = closed {
                        self.on_path_closed(closed);
                    }
                }
            }
        }
        // child tokens take every path actor down with us
        tracing::debug!("path manager stopped");
    }

    async fn handle(&mut self, req: ManagerRequest) {
        match req {
            ManagerRequest::Describe {
                name,
                access,
                reply,
            } => {
                match self.route(&name, &access, AuthAction::Read).await {
                    Ok(tx) => {
                        // a path that removed itself moments ago counts as absent
                        if let Err(sent) = tx.send(PathMessage::Describe { reply }) {
                            if let PathMessage::Describe { reply } = sent.0 {
                                let _ = reply.send(Err(RelayError::NotFound(name)));
                            }
                        }
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                };
            }
            ManagerRequest::Publish {
                name,
                access,
                info,
                reply,
            } => {
                // wire publishers are only allowed on publisher-sourced paths
                let has_static = self
                    .find_entry(&name)
                    .is_some_and(|(entry, _)| entry.conf.source != "publisher");
                let routed = if has_static {
                    Err(RelayError::Busy(name.clone()))
                } else {
                    self.route(&name, &access, AuthAction::Publish).await
                };
                match routed {
                    Ok(tx) => {
                        if let Err(sent) = tx.send(PathMessage::Publish {
                            info,
                            internal: false,
                            reply,
                        }) {
                            if let PathMessage::Publish { reply, .. } = sent.0 {
                                let _ = reply.send(Err(RelayError::NotFound(name)));
                            }
                        }
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            ManagerRequest::Read {
                name,
                access,
                tracks,
                reply,
            } => {
                match self.route(&name, &access, AuthAction::Read).await {
                    Ok(tx) => {
                        if let Err(sent) = tx.send(PathMessage::Read { tracks, reply }) {
                            if let PathMessage::Read { reply, .. } = sent.0 {
                                let _ = reply.send(Err(RelayError::NotFound(name)));
                            }
                        }
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                };
            }
            ManagerRequest::ConfReload { paths } => self.conf_reload(paths),
            ManagerRequest::ApiList { reply } => self.api_list(reply),
            ManagerRequest::ApiKick { name, reply } => {
                let _ = reply.send(self.api_kick(&name));
            }
        }
    }

    /// Matches, authenticates and (if needed) creates the path, returning its
    /// inbox for the request to be forwarded to.
    async fn route(
        &mut self,
        name: &str,
        access: &AccessInfo,
        action: AuthAction,
    ) -> Result<mpsc::UnboundedSender<PathMessage>, RelayError> {
        if name.is_empty() || name.starts_with('~') || name.starts_with('/') {
            return Err(RelayError::NotFound(name.to_string()));
        }

        let (conf, conf_name, exact) = {
            let (entry, exact) = self
                .find_entry(name)
                .ok_or_else(|| RelayError::NotFound(name.to_string()))?;
            (entry.conf.clone(), entry.name.clone(), exact)
        };

        let auth_result = self
            .authenticator
            .authenticate(name, &conf, access, action)
            .await;
        if let Err(e) = auth_result {
            if e.is_critical() {
                tracing::warn!(path = %name, ip = %access.ip, error = %e, "authentication failed");
            }
            return Err(e);
        }

        if !self.paths.contains_key(name) {
            self.create_path(name.to_string(), conf, conf_name, !exact);
        }
        Ok(self.paths[name].tx.clone())
    }

    /// First exact-name match wins, then the first matching pattern, both in
    /// definition order.
    fn find_entry(&self, name: &str) -> Option<(&ConfEntry, bool)> {
        if let Some(entry) = self
            .entries
            .iter()
            .find(|e| e.regex.is_none() && e.name == name)
        {
            return Some((entry, true));
        }
        self.entries
            .iter()
            .find(|e| e.regex.as_ref().is_some_and(|re| re.is_match(name)))
            .map(|e| (e, false))
    }

    fn create_path(&mut self, name: String, conf: Arc<PathConf>, conf_name: String, dynamic: bool) {
        let path_id = self.next_path_id;
        self.next_path_id += 1;
        let token = self.token.child_token();

        let tx = super::spawn(PathOpts {
            name: name.clone(),
            conf: conf.clone(),
            conf_name: conf_name.clone(),
            dynamic,
            read_buffer_count: self.read_buffer_count,
            pool: self.pool.clone(),
            source_driver: self.source_driver.clone(),
            manager_tx: self.closed_tx.clone(),
            path_id,
            token: token.clone(),
        });

        self.paths.insert(
            name,
            PathSlot {
                tx,
                token,
                conf,
                conf_name,
                path_id,
            },
        );
    }

    /// Statically named entries get a path up front.
    fn create_eager_paths(&mut self) {
        let missing: Vec<(String, Arc<PathConf>)> = self
            .entries
            .iter()
            .filter(|e| e.regex.is_none() && !self.paths.contains_key(&e.name))
            .map(|e| (e.name.clone(), e.conf.clone()))
            .collect();
        for (name, conf) in missing {
            self.create_path(name.clone(), conf, name, false);
        }
    }

    fn conf_reload(&mut self, paths: PathConfs) {
        let new_entries = build_entries(&paths);

        let mut to_close = Vec::new();
        for (name, slot) in &self.paths {
            let kept = match find_entry_in(&new_entries, name) {
                Some((entry, _))
                    if entry.name == slot.conf_name && *entry.conf == *slot.conf =>
                {
                    Some(entry.conf.clone())
                }
                _ => None,
            };
            match kept {
                Some(conf) => {
                    let _ = slot.tx.send(PathMessage::ConfReload { conf });
                }
                None => to_close.push(name.clone()),
            }
        }

        for name in to_close {
            tracing::info!(path = %name, "closing path (configuration changed)");
            self.close_path(&name);
        }

        self.entries = new_entries;
        self.create_eager_paths();
    }

    fn close_path(&mut self, name: &str) {
        if let Some(slot) = self.paths.remove(name) {
            let _ = slot.tx.send(PathMessage::Close);
            slot.token.cancel();
        }
    }

    fn on_path_closed(&mut self, closed: PathClosed) {
        // ignore notifications of actors this manager already replaced
        if self
            .paths
            .get(&closed.name)
            .is_some_and(|slot| slot.path_id == closed.path_id)
        {
            self.paths.remove(&closed.name);
        }
    }

    fn api_list(&self, reply: oneshot::Sender<Vec<PathInfo>>) {
        let txs: Vec<mpsc::UnboundedSender<PathMessage>> =
            self.paths.values().map(|s| s.tx.clone()).collect();

        // aggregate outside the manager loop
        tokio::spawn(async move {
            let mut out = Vec::with_capacity(txs.len());
            for tx in txs {
                let (info_tx, info_rx) = oneshot::channel();
                if tx.send(PathMessage::ApiInfo { reply: info_tx }).is_err() {
                    continue;
                }
                if let Ok(Ok(info)) =
                    tokio::time::timeout(Duration::from_secs(1), info_rx).await
                {
                    out.push(info);
                }
            }
            out.sort_by(|a, b| a.name.cmp(&b.name));
            let _ = reply.send(out);
        });
    }

    fn api_kick(&mut self, name: &str) -> Result<(), RelayError> {
        if !self.paths.contains_key(name) {
            return Err(RelayError::NotFound(name.to_string()));
        }
        tracing::info!(path = %name, "closing path (API request)");
        self.close_path(name);
        // a statically named path comes right back, empty
        self.create_eager_paths();
        Ok(())
    }
}

fn build_entries(paths: &PathConfs) -> Vec<ConfEntry> {
    paths
        .iter()
        .filter_map(|(name, conf)| {
            // patterns were validated at configuration load
            let regex = match compile_pattern(name) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(entry = %name, error = %e, "ignoring invalid path entry");
                    return None;
                }
            };
            Some(ConfEntry {
                name: name.clone(),
                conf: Arc::new(conf.clone()),
                regex,
            })
        })
        .collect()
}

fn find_entry_in<'a>(entries: &'a [ConfEntry], name: &str) -> Option<(&'a ConfEntry, bool)> {
    if let Some(entry) = entries.iter().find(|e| e.regex.is_none() && e.name == name) {
        return Some((entry, true));
    }
    entries
        .iter()
        .find(|e| e.regex.as_ref().is_some_and(|re| re.is_match(name)))
        .map(|e| (e, false))
}

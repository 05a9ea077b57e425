//! Uniform connection actor
//!
//! Every front-end runs the same control flow per connection: negotiate the
//! client's intent, resolve it through the path manager, then ferry units
//! between the wire and the stream until one side goes away. Cancellation is
//! cooperative through the server's token and the guard token the path hands
//! out.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::wire::{WireConn, WireIntent};
use super::ServerRequest;
use crate::auth::AccessInfo;
use crate::error::RelayError;
use crate::path::manager::PathManagerHandle;
use crate::stream::StreamReadError;

const STATE_IDLE: u8 = 0;
const STATE_PUBLISH: u8 = 1;
const STATE_READ: u8 = 2;

/// Byte counters and role, shared with the server's registry for API
/// listings.
#[derive(Default)]
pub(crate) struct ConnCounters {
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    state: AtomicU8,
}

impl ConnCounters {
    pub(crate) fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub(crate) fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub(crate) fn state(&self) -> &'static str {
        match self.state.load(Ordering::Relaxed) {
            STATE_PUBLISH => "publish",
            STATE_READ => "read",
            _ => "idle",
        }
    }
}

pub(crate) struct ConnCtx {
    pub id: Uuid,
    pub addr: SocketAddr,
    pub wire: Box<dyn WireConn>,
    pub manager: PathManagerHandle,
    pub protocol: &'static str,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub token: CancellationToken,
    pub counters: Arc<ConnCounters>,
    pub server_tx: mpsc::UnboundedSender<ServerRequest>,
}

pub(crate) async fn run(mut ctx: ConnCtx) {
    match drive(&mut ctx).await {
        Ok(()) => tracing::debug!(id = %ctx.id, "connection closed"),
        Err(e) if e.is_critical() => {
            tracing::warn!(id = %ctx.id, addr = %ctx.addr, error = %e, "connection failed")
        }
        Err(e) => tracing::debug!(id = %ctx.id, error = %e, "connection refused"),
    }
    let _ = ctx.server_tx.send(ServerRequest::ConnClosed { id: ctx.id });
}

fn timeout_err() -> RelayError {
    RelayError::Io(io::Error::new(io::ErrorKind::TimedOut, "i/o timeout"))
}

async fn drive(ctx: &mut ConnCtx) -> Result<(), RelayError> {
    let intent = tokio::select! {
        _ = ctx.token.cancelled() => return Err(RelayError::Terminated),
        r = tokio::time::timeout(ctx.read_timeout, ctx.wire.begin()) => {
            r.map_err(|_| timeout_err())??
        }
    };

    match intent {
        WireIntent::Publish {
            path,
            query,
            user,
            pass,
            info,
        } => {
            let access = AccessInfo {
                ip: ctx.addr.ip(),
                user,
                pass,
                query,
                protocol: ctx.protocol,
            };
            let guard = match ctx.manager.publish(&path, access, info).await {
                Ok(guard) => guard,
                Err(e) => {
                    let _ = ctx.wire.refuse(&e).await;
                    return Err(e);
                }
            };
            ctx.wire.accept(None).await?;
            ctx.counters.state.store(STATE_PUBLISH, Ordering::Relaxed);
            tracing::info!(id = %ctx.id, path = %path, "publishing");

            let evicted = guard.token().clone();
            loop {
                let unit = tokio::select! {
                    _ = ctx.token.cancelled() => return Ok(()),
                    _ = evicted.cancelled() => return Ok(()),
                    r = tokio::time::timeout(ctx.read_timeout, ctx.wire.recv_unit()) => {
                        r.map_err(|_| timeout_err())??
                    }
                };
                let Some(unit) = unit else {
                    return Ok(());
                };
                ctx.counters
                    .bytes_received
                    .fetch_add(unit.payload.len() as u64, Ordering::Relaxed);
                guard
                    .stream()
                    .write(unit.track, unit.pts, unit.key, unit.payload);
            }
        }

        WireIntent::Read {
            path,
            query,
            user,
            pass,
            tracks,
        } => {
            let access = AccessInfo {
                ip: ctx.addr.ip(),
                user,
                pass,
                query,
                protocol: ctx.protocol,
            };
            let mut guard = match ctx.manager.read(&path, access, tracks).await {
                Ok(guard) => guard,
                Err(e) => {
                    let _ = ctx.wire.refuse(&e).await;
                    return Err(e);
                }
            };
            let info = guard.info().clone();
            ctx.wire.accept(Some(&info)).await?;
            ctx.counters.state.store(STATE_READ, Ordering::Relaxed);
            tracing::info!(id = %ctx.id, path = %path, "reading");

            let evicted = guard.token().clone();
            loop {
                let unit = tokio::select! {
                    _ = ctx.token.cancelled() => return Ok(()),
                    _ = evicted.cancelled() => return Ok(()),
                    r = guard.next() => r,
                };
                match unit {
                    Ok(unit) => {
                        ctx.counters
                            .bytes_sent
                            .fetch_add(unit.payload.len() as u64, Ordering::Relaxed);
                        tokio::time::timeout(ctx.write_timeout, ctx.wire.send_unit(&unit))
                            .await
                            .map_err(|_| timeout_err())??;
                    }
                    Err(StreamReadError::Overflow { missed }) => {
                        tracing::warn!(
                            id = %ctx.id,
                            path = %path,
                            missed,
                            "reader too slow, disconnecting"
                        );
                        return Ok(());
                    }
                    Err(StreamReadError::Closed) => return Ok(()),
                }
            }
        }
    }
}

//! Static pull sources
//!
//! A path whose `source` is a pull URL runs a background task that keeps a
//! driver connected to the upstream server, reconnecting after a pause on
//! failure. The wire protocol of the driver lives outside the core; the task
//! here only owns the retry loop and the hand-off into the path.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{PathMessage, PublishGuard};
use crate::error::RelayError;
use crate::stream::MediaInfo;

/// Pause between reconnection attempts of a static source.
pub const RETRY_PAUSE: Duration = Duration::from_secs(5);

/// Driver contract for pull sources (`rtsp://`, `rtmp://`, ...).
///
/// `run` connects to `url`, calls [`SourceFeed::set_ready`] once the media
/// description is known, writes units into the returned stream, and returns
/// when the upstream connection ends. It must return promptly when `token`
/// is cancelled.
#[async_trait]
pub trait SourceDriver: Send + Sync {
    async fn run(
        &self,
        url: &str,
        feed: &SourceFeed,
        token: &CancellationToken,
    ) -> io::Result<()>;
}

/// The driver's way into its path.
pub struct SourceFeed {
    pub(crate) tx: mpsc::UnboundedSender<PathMessage>,
    pub(crate) path: String,
}

impl SourceFeed {
    /// Name of the path being fed.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Registers the driver as the path's source. The returned guard is the
    /// write side of the stream; dropping it tells the path the source is
    /// gone.
    pub async fn set_ready(&self, info: MediaInfo) -> Result<PublishGuard, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PathMessage::Publish {
                info,
                internal: true,
                reply,
            })
            .map_err(|_| RelayError::Terminated)?;
        rx.await.map_err(|_| RelayError::Terminated)?
    }
}

/// Placeholder driver used when no real pull client is wired in.
pub struct UnsupportedSourceDriver;

#[async_trait]
impl SourceDriver for UnsupportedSourceDriver {
    async fn run(
        &self,
        url: &str,
        _feed: &SourceFeed,
        _token: &CancellationToken,
    ) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("no source driver available for '{url}'"),
        ))
    }
}

/// Retry loop of one static source task.
pub(crate) async fn run_static(
    driver: Arc<dyn SourceDriver>,
    url: String,
    feed: SourceFeed,
    token: CancellationToken,
) {
    loop {
        let res = tokio::select! {
            _ = token.cancelled() => return,
            r = driver.run(&url, &feed, &token) => r,
        };

        match res {
            Ok(()) => tracing::info!(path = %feed.path, source = %url, "source disconnected"),
            Err(e) => {
                tracing::warn!(path = %feed.path, source = %url, error = %e, "source error")
            }
        }

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(RETRY_PAUSE) => {}
        }
    }
}

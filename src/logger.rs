//! Logging setup
//!
//! `tracing` with a reloadable filter and a destination switch that can be
//! re-pointed on configuration reload without replacing the process-global
//! subscriber (which can only ever be installed once).

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::sync::{Arc, OnceLock, RwLock};

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Registry;

use crate::conf::{Conf, LogDestination};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

struct Destinations {
    stdout: bool,
    file: Option<File>,
}

#[derive(Clone)]
struct DynMakeWriter(Arc<RwLock<Destinations>>);

struct DynWriter(Arc<RwLock<Destinations>>);

impl Write for DynWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut dest = self.0.write().unwrap_or_else(|e| e.into_inner());
        if dest.stdout {
            io::stdout().write_all(buf)?;
        }
        if let Some(file) = dest.file.as_mut() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut dest = self.0.write().unwrap_or_else(|e| e.into_inner());
        if dest.stdout {
            io::stdout().flush()?;
        }
        if let Some(file) = dest.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for DynMakeWriter {
    type Writer = DynWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DynWriter(self.0.clone())
    }
}

/// Handle the supervisor keeps to retune logging on reload.
#[derive(Clone)]
pub struct LogHandle {
    filter: Arc<FilterHandle>,
    destinations: Arc<RwLock<Destinations>>,
}

static HANDLE: OnceLock<LogHandle> = OnceLock::new();

fn destinations_from_conf(conf: &Conf) -> io::Result<Destinations> {
    let stdout = conf.log_destinations.contains(&LogDestination::Stdout);
    let file = if conf.log_destinations.contains(&LogDestination::File) {
        Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&conf.log_file)?,
        )
    } else {
        None
    };
    Ok(Destinations { stdout, file })
}

/// Installs (or retunes, on repeat calls) the global subscriber.
pub fn init(conf: &Conf) -> io::Result<LogHandle> {
    if let Some(handle) = HANDLE.get() {
        handle.reconfigure(conf)?;
        return Ok(handle.clone());
    }

    let destinations = Arc::new(RwLock::new(destinations_from_conf(conf)?));
    let (filter_layer, filter) =
        reload::Layer::new(EnvFilter::new(conf.log_level.as_filter_str()));

    let subscriber = tracing_subscriber::registry().with(filter_layer).with(
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(DynMakeWriter(destinations.clone())),
    );
    // a second process-wide init (tests) keeps the existing subscriber
    let _ = subscriber.try_init();

    let handle = LogHandle {
        filter: Arc::new(filter),
        destinations,
    };
    let _ = HANDLE.set(handle.clone());
    Ok(handle)
}

impl LogHandle {
    /// Applies new level and destinations.
    pub fn reconfigure(&self, conf: &Conf) -> io::Result<()> {
        let new = destinations_from_conf(conf)?;
        *self
            .destinations
            .write()
            .unwrap_or_else(|e| e.into_inner()) = new;
        self.filter
            .reload(EnvFilter::new(conf.log_level.as_filter_str()))
            .map_err(|e| io::Error::other(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::LogLevel;

    #[test]
    fn test_init_and_reconfigure() {
        let mut conf = Conf::default();
        let handle = init(&conf).unwrap();

        conf.log_level = LogLevel::Debug;
        handle.reconfigure(&conf).unwrap();

        // log to a file destination
        let dir = tempfile::tempdir().unwrap();
        conf.log_file = dir
            .path()
            .join("relay.log")
            .to_string_lossy()
            .into_owned();
        conf.log_destinations = vec![LogDestination::File];
        handle.reconfigure(&conf).unwrap();

        tracing::info!("file destination works");
        // repeated init returns the same global handle
        let again = init(&conf).unwrap();
        again.reconfigure(&Conf::default()).unwrap();
    }
}

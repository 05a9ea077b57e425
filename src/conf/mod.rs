//! Configuration model
//!
//! The configuration is an immutable tree loaded from a YAML file, overlaid
//! with `MEDIARELAY_*` environment variables and optionally wrapped in an
//! encrypted envelope. Every hot reload produces a brand-new [`Conf`]; the
//! supervisor diffs the old and new trees to decide which subsystems restart.
//!
//! Unknown keys are rejected at any level, with the same wording for the
//! top level and for path entries.

pub mod duration;
pub mod encrypt;
pub mod env;

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;

use regex::Regex;
use serde::de::{self, Deserializer, MapAccess};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use thiserror::Error;

pub use self::duration::StringDuration;

/// Configuration loading / validation error
#[derive(Debug, Error)]
pub enum ConfError {
    #[error("{0}")]
    Parse(String),

    #[error("invalid path name '{0}': {1}")]
    PathName(String, String),

    #[error("parameter paths, key {0}: {1}")]
    PathParam(String, String),

    #[error("invalid configuration envelope: {0}")]
    Envelope(String),

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Rewrites serde's unknown-field message into the tool's own wording.
fn rewrite_unknown_field(msg: &str) -> String {
    if let Some(rest) = msg.split("unknown field `").nth(1) {
        if let Some(field) = rest.split('`').next() {
            return format!("non-existent parameter: '{field}'");
        }
    }
    msg.to_string()
}

/// Log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogDestination {
    Stdout,
    File,
}

/// TLS posture of a listener pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Encryption {
    #[default]
    No,
    Optional,
    Strict,
}

/// A single allowlist entry: a literal address or a CIDR range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpRange {
    Single(IpAddr),
    Cidr { net: IpAddr, prefix: u8 },
}

impl IpRange {
    pub fn parse(s: &str) -> Result<IpRange, ConfError> {
        if let Some((addr, prefix)) = s.split_once('/') {
            let net: IpAddr = addr
                .parse()
                .map_err(|_| ConfError::Invalid(format!("invalid IP range: '{s}'")))?;
            let prefix: u8 = prefix
                .parse()
                .map_err(|_| ConfError::Invalid(format!("invalid IP range: '{s}'")))?;
            let max = match net {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            if prefix > max {
                return Err(ConfError::Invalid(format!("invalid IP range: '{s}'")));
            }
            return Ok(IpRange::Cidr { net, prefix });
        }
        let ip: IpAddr = s
            .parse()
            .map_err(|_| ConfError::Invalid(format!("invalid IP: '{s}'")))?;
        Ok(IpRange::Single(ip))
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match self {
            IpRange::Single(a) => *a == ip,
            IpRange::Cidr { net, prefix } => match (net, ip) {
                (IpAddr::V4(n), IpAddr::V4(i)) => {
                    let shift = 32 - u32::from(*prefix);
                    if shift >= 32 {
                        return true;
                    }
                    (u32::from(*n) >> shift) == (u32::from(i) >> shift)
                }
                (IpAddr::V6(n), IpAddr::V6(i)) => {
                    let shift = 128 - u32::from(*prefix);
                    if shift >= 128 {
                        return true;
                    }
                    (u128::from(*n) >> shift) == (u128::from(i) >> shift)
                }
                _ => false,
            },
        }
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpRange::Single(a) => write!(f, "{a}"),
            IpRange::Cidr { net, prefix } => write!(f, "{net}/{prefix}"),
        }
    }
}

/// An IP allowlist. Accepts a single string or a sequence in YAML and from
/// the environment.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IpRanges(pub Vec<IpRange>);

impl IpRanges {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.0.iter().any(|r| r.contains(ip))
    }
}

impl Serialize for IpRanges {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter().map(|r| r.to_string()))
    }
}

impl<'de> Deserialize<'de> for IpRanges {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl<'de> de::Visitor<'de> for Visitor {
            type Value = IpRanges;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an IP, a CIDR range, or a list of them")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(IpRanges(vec![IpRange::parse(v).map_err(de::Error::custom)?]))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut out = Vec::new();
                while let Some(s) = seq.next_element::<String>()? {
                    out.push(IpRange::parse(&s).map_err(de::Error::custom)?);
                }
                Ok(IpRanges(out))
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

/// Per-path configuration entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct PathConf {
    /// Where media comes from: `publisher`, `redirect`, or a pull URL
    /// (`rtsp://`, `rtsps://`, `rtmp://`, `rtmps://`).
    pub source: String,

    /// Start the static source only when the path is first requested.
    pub source_on_demand: bool,
    pub source_on_demand_start_timeout: StringDuration,
    pub source_on_demand_close_after: StringDuration,

    /// Target of a `redirect` source.
    pub source_redirect: String,

    /// Command started when the path is loaded, restarted per flag.
    pub run_on_init: String,
    pub run_on_init_restart: bool,

    /// Command started when the path is first requested; expected to publish.
    pub run_on_demand: String,
    pub run_on_demand_restart: bool,
    pub run_on_demand_start_timeout: StringDuration,
    pub run_on_demand_close_after: StringDuration,

    pub run_on_publish: String,
    pub run_on_publish_restart: bool,
    pub run_on_read: String,
    pub run_on_read_restart: bool,

    pub publish_user: String,
    pub publish_pass: String,
    pub publish_ips: IpRanges,

    pub read_user: String,
    pub read_pass: String,
    pub read_ips: IpRanges,
}

impl Default for PathConf {
    fn default() -> Self {
        Self {
            source: "publisher".into(),
            source_on_demand: false,
            source_on_demand_start_timeout: StringDuration::from_secs(10),
            source_on_demand_close_after: StringDuration::from_secs(10),
            source_redirect: String::new(),
            run_on_init: String::new(),
            run_on_init_restart: false,
            run_on_demand: String::new(),
            run_on_demand_restart: false,
            run_on_demand_start_timeout: StringDuration::from_secs(10),
            run_on_demand_close_after: StringDuration::from_secs(10),
            run_on_publish: String::new(),
            run_on_publish_restart: false,
            run_on_read: String::new(),
            run_on_read_restart: false,
            publish_user: String::new(),
            publish_pass: String::new(),
            publish_ips: IpRanges::default(),
            read_user: String::new(),
            read_pass: String::new(),
            read_ips: IpRanges::default(),
        }
    }
}

impl PathConf {
    /// Whether the source is a pull URL handled by a source driver.
    pub fn has_static_source(&self) -> bool {
        ["rtsp://", "rtsps://", "rtmp://", "rtmps://"]
            .iter()
            .any(|p| self.source.starts_with(p))
    }

    pub fn is_redirect(&self) -> bool {
        self.source == "redirect"
    }

    /// Whether the source is started lazily and stopped when idle.
    pub fn is_on_demand(&self) -> bool {
        (self.has_static_source() && self.source_on_demand) || !self.run_on_demand.is_empty()
    }

    /// Start timeout of whichever on-demand mechanism is configured.
    pub fn on_demand_start_timeout(&self) -> StringDuration {
        if !self.run_on_demand.is_empty() {
            self.run_on_demand_start_timeout
        } else {
            self.source_on_demand_start_timeout
        }
    }

    /// Idle close-after of whichever on-demand mechanism is configured.
    pub fn on_demand_close_after(&self) -> StringDuration {
        if !self.run_on_demand.is_empty() {
            self.run_on_demand_close_after
        } else {
            self.source_on_demand_close_after
        }
    }

    fn check(&self, name: &str) -> Result<(), ConfError> {
        check_path_name(name)?;

        if !(self.source == "publisher" || self.is_redirect() || self.has_static_source()) {
            return Err(ConfError::PathParam(
                name.into(),
                format!("invalid source: '{}'", self.source),
            ));
        }
        if self.is_redirect() && self.source_redirect.is_empty() {
            return Err(ConfError::PathParam(
                name.into(),
                "source 'redirect' requires 'sourceRedirect'".into(),
            ));
        }
        if !self.run_on_demand.is_empty() && self.source != "publisher" {
            return Err(ConfError::PathParam(
                name.into(),
                "'runOnDemand' can only be used when source is 'publisher'".into(),
            ));
        }
        if self.source_on_demand && !self.has_static_source() {
            return Err(ConfError::PathParam(
                name.into(),
                "'sourceOnDemand' can only be used with a pull source".into(),
            ));
        }
        Ok(())
    }
}

/// Validates a path name and, for `~`-prefixed names, compiles the pattern.
pub fn compile_pattern(name: &str) -> Result<Option<Regex>, ConfError> {
    check_path_name(name)?;
    if let Some(pattern) = name.strip_prefix('~') {
        let re = Regex::new(pattern)
            .map_err(|e| ConfError::PathName(name.into(), format!("invalid regex: {e}")))?;
        return Ok(Some(re));
    }
    Ok(None)
}

fn check_path_name(name: &str) -> Result<(), ConfError> {
    if name.is_empty() {
        return Err(ConfError::PathName(name.into(), "cannot be empty".into()));
    }
    if name.starts_with('~') {
        // regex pattern, validated by compile_pattern
        return Ok(());
    }
    if name.starts_with('/') {
        return Err(ConfError::PathName(
            name.into(),
            "can't begin with a slash".into(),
        ));
    }
    if name.ends_with('/') {
        return Err(ConfError::PathName(
            name.into(),
            "can't end with a slash".into(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'))
    {
        return Err(ConfError::PathName(
            name.into(),
            "can contain only alphanumeric characters, underscore, dot, minus or slash".into(),
        ));
    }
    Ok(())
}

/// The path table, in file definition order.
///
/// Order matters: the manager walks entries in definition order and the first
/// match wins, so this is a vector of pairs rather than a map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathConfs(pub Vec<(String, PathConf)>);

impl PathConfs {
    pub fn get(&self, name: &str) -> Option<&PathConf> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, PathConf)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for PathConfs {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, conf) in &self.0 {
            map.serialize_entry(name, conf)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for PathConfs {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl<'de> de::Visitor<'de> for Visitor {
            type Value = PathConfs;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of path name to path configuration")
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(PathConfs::default())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut out = Vec::new();
                let mut seen = HashSet::new();
                while let Some((name, value)) = access.next_entry::<String, Value>()? {
                    if !seen.insert(name.clone()) {
                        return Err(de::Error::custom(format!("duplicate path: '{name}'")));
                    }
                    let conf = if value.is_null() {
                        PathConf::default()
                    } else {
                        serde_yaml::from_value(value).map_err(|e| {
                            de::Error::custom(format!(
                                "parameter paths, key {name}: {}",
                                rewrite_unknown_field(&e.to_string())
                            ))
                        })?
                    };
                    out.push((name, conf));
                }
                Ok(PathConfs(out))
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

/// The whole configuration tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct Conf {
    // general
    pub log_level: LogLevel,
    pub log_destinations: Vec<LogDestination>,
    pub log_file: String,
    pub read_timeout: StringDuration,
    pub write_timeout: StringDuration,
    /// Per-track ring capacity; must be a power of two.
    pub read_buffer_count: usize,
    pub external_authentication_url: String,

    // control API
    pub api: bool,
    pub api_address: String,

    // metrics
    pub metrics: bool,
    pub metrics_address: String,

    // RTSP front-end
    pub rtsp_disable: bool,
    pub rtsp_address: String,
    pub rtsps_address: String,
    pub rtsp_encryption: Encryption,
    pub server_key: String,
    pub server_cert: String,

    // RTMP front-end
    pub rtmp_disable: bool,
    pub rtmp_address: String,
    pub rtmps_address: String,
    pub rtmp_encryption: Encryption,
    pub rtmp_server_key: String,
    pub rtmp_server_cert: String,

    // HLS front-end
    pub hls_disable: bool,
    pub hls_address: String,
    pub hls_segment_count: usize,
    pub hls_segment_duration: StringDuration,
    pub hls_allow_origin: String,

    // WebRTC front-end
    pub webrtc_disable: bool,
    pub webrtc_address: String,
    pub webrtc_ice_servers: Vec<String>,
    pub webrtc_ice_udp_mux_address: String,
    pub webrtc_ice_tcp_mux_address: String,

    pub paths: PathConfs,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_destinations: vec![LogDestination::Stdout],
            log_file: "mediarelay.log".into(),
            read_timeout: StringDuration::from_secs(10),
            write_timeout: StringDuration::from_secs(10),
            read_buffer_count: 512,
            external_authentication_url: String::new(),
            api: false,
            api_address: "127.0.0.1:9997".into(),
            metrics: false,
            metrics_address: "127.0.0.1:9998".into(),
            rtsp_disable: false,
            rtsp_address: ":8554".into(),
            rtsps_address: ":8322".into(),
            rtsp_encryption: Encryption::No,
            server_key: "server.key".into(),
            server_cert: "server.crt".into(),
            rtmp_disable: false,
            rtmp_address: ":1935".into(),
            rtmps_address: ":1936".into(),
            rtmp_encryption: Encryption::No,
            rtmp_server_key: "server.key".into(),
            rtmp_server_cert: "server.crt".into(),
            hls_disable: false,
            hls_address: ":8888".into(),
            hls_segment_count: 7,
            hls_segment_duration: StringDuration::from_secs(1),
            hls_allow_origin: "*".into(),
            webrtc_disable: false,
            webrtc_address: ":8889".into(),
            webrtc_ice_servers: vec!["stun:stun.l.google.com:19302".into()],
            webrtc_ice_udp_mux_address: String::new(),
            webrtc_ice_tcp_mux_address: String::new(),
            paths: PathConfs::default(),
        }
    }
}

impl Conf {
    /// Loads the configuration from `path`, overlaying environment variables.
    ///
    /// A missing file is not an error: defaults plus environment apply and
    /// the second return value is `false`.
    pub fn load(path: &Path) -> Result<(Conf, bool), ConfError> {
        let (mut value, found) = match std::fs::read(path) {
            Ok(content) => {
                let content = match std::env::var(encrypt::CONFKEY_ENV) {
                    Ok(key) if !key.is_empty() => encrypt::decrypt(&content, &key)?,
                    _ => content,
                };
                let value: Value = serde_yaml::from_slice(&content)
                    .map_err(|e| ConfError::Parse(e.to_string()))?;
                (value, true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (Value::Null, false),
            Err(e) => return Err(e.into()),
        };

        if value.is_null() {
            value = Value::Mapping(serde_yaml::Mapping::new());
        }
        env::overlay(&mut value);

        let conf = Self::from_value(value)?;
        conf.validate()?;
        Ok((conf, found))
    }

    /// Decodes a configuration tree, rewriting unknown-key errors.
    pub fn from_value(value: Value) -> Result<Conf, ConfError> {
        serde_yaml::from_value(value)
            .map_err(|e| ConfError::Parse(rewrite_unknown_field(&e.to_string())))
    }

    pub fn validate(&self) -> Result<(), ConfError> {
        if self.read_buffer_count == 0 || !self.read_buffer_count.is_power_of_two() {
            return Err(ConfError::Invalid(
                "'readBufferCount' must be a power of two".into(),
            ));
        }
        if self.log_destinations.is_empty() {
            return Err(ConfError::Invalid(
                "'logDestinations' cannot be empty".into(),
            ));
        }
        for (name, conf) in self.paths.iter() {
            compile_pattern(name)?;
            conf.check(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Mutex, MutexGuard};
    use std::time::Duration;

    // Conf::load reads the process environment, and a couple of tests mutate
    // it; serialize every loader test through this lock.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn env_guard() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_temp(content: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_from_file() {
        let _env = env_guard();
        let f = write_temp(
            b"logLevel: debug\npaths:\n  cam1:\n    runOnDemandStartTimeout: 5s\n",
        );
        let (conf, found) = Conf::load(f.path()).unwrap();
        assert!(found);
        assert_eq!(conf.log_level, LogLevel::Debug);

        let pa = conf.paths.get("cam1").unwrap();
        assert_eq!(pa.source, "publisher");
        assert_eq!(*pa.run_on_demand_start_timeout, Duration::from_secs(5));
        assert_eq!(*pa.source_on_demand_close_after, Duration::from_secs(10));
    }

    #[test]
    fn test_empty_documents() {
        let _env = env_guard();
        for content in [&b""[..], b"paths:", b"paths:\n  mypath:\n"] {
            let f = write_temp(content);
            let (conf, found) = Conf::load(f.path()).unwrap();
            assert!(found, "content {content:?}");
            assert!(conf.validate().is_ok());
        }
    }

    #[test]
    fn test_missing_file_is_not_fatal() {
        let _env = env_guard();
        let (conf, found) =
            Conf::load(Path::new("/nonexistent/mediarelay.yml")).unwrap();
        assert!(!found);
        assert_eq!(conf, Conf::default());
    }

    #[test]
    fn test_unknown_parameter_top_level() {
        let _env = env_guard();
        let f = write_temp(b"invalid: param\n");
        let err = Conf::load(f.path()).unwrap_err();
        assert_eq!(err.to_string(), "non-existent parameter: 'invalid'");
    }

    #[test]
    fn test_unknown_parameter_in_path() {
        let _env = env_guard();
        let f = write_temp(b"paths:\n  mypath:\n    invalid: parameter\n");
        let err = Conf::load(f.path()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "parameter paths, key mypath: non-existent parameter: 'invalid'"
        );
    }

    #[test]
    fn test_invalid_path_name() {
        let _env = env_guard();
        let f = write_temp(b"paths:\n  '':\n    source: publisher\n");
        let err = Conf::load(f.path()).unwrap_err();
        assert_eq!(err.to_string(), "invalid path name '': cannot be empty");
    }

    #[test]
    fn test_source_validation() {
        let _env = env_guard();
        let f = write_temp(b"paths:\n  cam1:\n    source: redirect\n");
        let err = Conf::load(f.path()).unwrap_err();
        assert!(err
            .to_string()
            .contains("source 'redirect' requires 'sourceRedirect'"));

        let f = write_temp(b"paths:\n  cam1:\n    source: ftp://nope\n");
        assert!(Conf::load(f.path()).is_err());
    }

    #[test]
    fn test_read_buffer_count_power_of_two() {
        let _env = env_guard();
        let f = write_temp(b"readBufferCount: 100\n");
        let err = Conf::load(f.path()).unwrap_err();
        assert!(err.to_string().contains("power of two"));
    }

    #[test]
    fn test_env_overlay() {
        let _env = env_guard();
        let f = write_temp(b"{}");
        std::env::set_var("MEDIARELAY_PATHS_CAM1_SOURCE", "rtsp://testing");
        std::env::set_var("MEDIARELAY_READBUFFERCOUNT", "1024");
        let loaded = Conf::load(f.path());
        std::env::remove_var("MEDIARELAY_PATHS_CAM1_SOURCE");
        std::env::remove_var("MEDIARELAY_READBUFFERCOUNT");

        let (conf, found) = loaded.unwrap();
        assert!(found);
        assert_eq!(conf.read_buffer_count, 1024);
        let pa = conf.paths.get("cam1").unwrap();
        assert_eq!(pa.source, "rtsp://testing");
        assert_eq!(*pa.source_on_demand_start_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_encrypted_file() {
        let _env = env_guard();
        let plain = b"paths:\n  path1:\n  path2:\n";
        let key = "testing123testin";
        let sealed = encrypt::encrypt(plain, key, rand::random()).unwrap();
        let f = write_temp(sealed.as_bytes());

        std::env::set_var(encrypt::CONFKEY_ENV, key);
        let loaded = Conf::load(f.path());
        std::env::remove_var(encrypt::CONFKEY_ENV);

        let (conf, _) = loaded.unwrap();
        assert!(conf.paths.get("path1").is_some());
        assert!(conf.paths.get("path2").is_some());
    }

    #[test]
    fn test_serialize_round_trip() {
        let _env = env_guard();
        let f = write_temp(
            b"logLevel: warn\nrtspAddress: ':9554'\npaths:\n  cam1:\n    readUser: u\n    readPass: p\n  '~^cam[0-9]+$':\n    sourceOnDemandCloseAfter: 30s\n",
        );
        let (conf, _) = Conf::load(f.path()).unwrap();

        let dumped = serde_yaml::to_string(&conf).unwrap();
        let reloaded: Conf = Conf::from_value(serde_yaml::from_str(&dumped).unwrap()).unwrap();
        assert_eq!(conf, reloaded);
    }

    #[test]
    fn test_ip_range() {
        let r = IpRange::parse("192.168.0.0/16").unwrap();
        assert!(r.contains("192.168.12.34".parse().unwrap()));
        assert!(!r.contains("10.0.0.1".parse().unwrap()));

        let r = IpRange::parse("127.0.0.1").unwrap();
        assert!(r.contains("127.0.0.1".parse().unwrap()));
        assert!(!r.contains("127.0.0.2".parse().unwrap()));

        assert!(IpRange::parse("500.0.0.1").is_err());
        assert!(IpRange::parse("10.0.0.0/64").is_err());
    }

    #[test]
    fn test_pattern_compile() {
        assert!(compile_pattern("cam1").unwrap().is_none());
        let re = compile_pattern("~^cam[0-9]+$").unwrap().unwrap();
        assert!(re.is_match("cam7"));
        assert!(!re.is_match("mic1"));
        assert!(compile_pattern("~[").is_err());
        assert!(compile_pattern("/leading").is_err());
    }
}

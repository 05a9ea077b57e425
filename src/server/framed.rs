//! Built-in length-prefixed wire driver
//!
//! A minimal framing over TCP used by the test suite and by embedders that
//! bring their own codecs elsewhere. Control frames carry JSON, unit frames
//! are binary:
//!
//! ```text
//! frame  = type:u8, length:u32be, payload
//! unit   = track:u8, flags:u8 (bit0 keyframe), pts:u64be (microseconds), data
//! ```

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::wire::{WireConn, WireFactory, WireIntent};
use crate::error::RelayError;
use crate::stream::{MediaInfo, Unit};

const FRAME_INTENT: u8 = 1;
const FRAME_ACCEPT: u8 = 2;
const FRAME_REFUSE: u8 = 3;
const FRAME_UNIT: u8 = 4;
const FRAME_END: u8 = 5;

/// Upper bound on a single frame; a unit larger than this is malformed.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

const UNIT_HEADER_LEN: usize = 10;
const FLAG_KEY: u8 = 0x01;

#[derive(Debug, Serialize, Deserialize)]
struct IntentMsg {
    action: String,
    path: String,
    #[serde(default)]
    query: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    pass: Option<String>,
    #[serde(default)]
    info: Option<MediaInfo>,
    #[serde(default)]
    tracks: Option<Vec<usize>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AcceptMsg {
    #[serde(default)]
    info: Option<MediaInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RefuseMsg {
    code: String,
    error: String,
}

fn error_code(e: &RelayError) -> &'static str {
    match e {
        RelayError::AuthNotCritical => "authRequired",
        RelayError::AuthCritical(_) => "authFailed",
        RelayError::NotFound(_) => "notFound",
        RelayError::Busy(_) => "busy",
        RelayError::Terminated => "terminated",
        RelayError::Timeout(_) => "timeout",
        RelayError::Io(_) => "io",
    }
}

fn error_from_refuse(msg: RefuseMsg) -> RelayError {
    match msg.code.as_str() {
        "authRequired" => RelayError::AuthNotCritical,
        "authFailed" => RelayError::AuthCritical(msg.error),
        "notFound" => RelayError::NotFound(msg.error),
        "busy" => RelayError::Busy(msg.error),
        "terminated" => RelayError::Terminated,
        "timeout" => RelayError::Timeout(msg.error),
        _ => RelayError::Io(io::Error::other(msg.error)),
    }
}

async fn write_frame(io: &mut TcpStream, kind: u8, payload: &[u8]) -> io::Result<()> {
    let mut header = [0u8; 5];
    header[0] = kind;
    header[1..5].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    io.write_all(&header).await?;
    io.write_all(payload).await?;
    io.flush().await
}

async fn read_frame(io: &mut TcpStream) -> io::Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 5];
    io.read_exact(&mut header).await?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes"),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    io.read_exact(&mut payload).await?;
    Ok((header[0], payload))
}

fn encode_unit(unit: &Unit) -> Vec<u8> {
    let mut out = Vec::with_capacity(UNIT_HEADER_LEN + unit.payload.len());
    out.push(unit.track as u8);
    out.push(if unit.key { FLAG_KEY } else { 0 });
    out.extend_from_slice(&(unit.pts.as_micros() as u64).to_be_bytes());
    out.extend_from_slice(&unit.payload);
    out
}

fn decode_unit(payload: Vec<u8>) -> io::Result<Unit> {
    if payload.len() < UNIT_HEADER_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "short unit frame",
        ));
    }
    let track = payload[0] as usize;
    let key = payload[1] & FLAG_KEY != 0;
    let mut pts = [0u8; 8];
    pts.copy_from_slice(&payload[2..10]);
    let pts = Duration::from_micros(u64::from_be_bytes(pts));
    let data = Bytes::from(payload).slice(UNIT_HEADER_LEN..);
    Ok(Unit::new(track, pts, key, data))
}

fn bad_json(e: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Server-side driver.
pub struct FramedWire {
    io: TcpStream,
}

#[async_trait]
impl WireConn for FramedWire {
    async fn begin(&mut self) -> io::Result<WireIntent> {
        let (kind, payload) = read_frame(&mut self.io).await?;
        if kind != FRAME_INTENT {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "expected intent frame",
            ));
        }
        let msg: IntentMsg = serde_json::from_slice(&payload).map_err(bad_json)?;

        match msg.action.as_str() {
            "publish" => Ok(WireIntent::Publish {
                path: msg.path,
                query: msg.query,
                user: msg.user,
                pass: msg.pass,
                info: msg.info.unwrap_or_default(),
            }),
            "read" => Ok(WireIntent::Read {
                path: msg.path,
                query: msg.query,
                user: msg.user,
                pass: msg.pass,
                tracks: msg.tracks,
            }),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown action: '{other}'"),
            )),
        }
    }

    async fn accept(&mut self, info: Option<&MediaInfo>) -> io::Result<()> {
        let payload = serde_json::to_vec(&AcceptMsg {
            info: info.cloned(),
        })
        .map_err(bad_json)?;
        write_frame(&mut self.io, FRAME_ACCEPT, &payload).await
    }

    async fn refuse(&mut self, reason: &RelayError) -> io::Result<()> {
        let payload = serde_json::to_vec(&RefuseMsg {
            code: error_code(reason).to_string(),
            error: reason.to_string(),
        })
        .map_err(bad_json)?;
        write_frame(&mut self.io, FRAME_REFUSE, &payload).await
    }

    async fn recv_unit(&mut self) -> io::Result<Option<Unit>> {
        let (kind, payload) = read_frame(&mut self.io).await?;
        match kind {
            FRAME_UNIT => Ok(Some(decode_unit(payload)?)),
            FRAME_END => Ok(None),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected frame in unit stream",
            )),
        }
    }

    async fn send_unit(&mut self, unit: &Unit) -> io::Result<()> {
        write_frame(&mut self.io, FRAME_UNIT, &encode_unit(unit)).await
    }
}

/// Factory for [`FramedWire`].
pub struct FramedWireFactory;

impl WireFactory for FramedWireFactory {
    fn open(&self, socket: TcpStream, _addr: SocketAddr) -> Box<dyn WireConn> {
        Box::new(FramedWire { io: socket })
    }
}

/// Client-side publisher, used by tests and tools.
#[derive(Debug)]
pub struct FramedPublisher {
    io: TcpStream,
}

impl FramedPublisher {
    pub async fn connect(
        addr: SocketAddr,
        path: &str,
        user: Option<&str>,
        pass: Option<&str>,
        info: MediaInfo,
    ) -> Result<Self, RelayError> {
        let mut io = TcpStream::connect(addr).await?;

        let msg = IntentMsg {
            action: "publish".into(),
            path: path.into(),
            query: String::new(),
            user: user.map(String::from),
            pass: pass.map(String::from),
            info: Some(info),
            tracks: None,
        };
        let payload = serde_json::to_vec(&msg).map_err(bad_json)?;
        write_frame(&mut io, FRAME_INTENT, &payload).await?;

        let (kind, payload) = read_frame(&mut io).await?;
        match kind {
            FRAME_ACCEPT => Ok(Self { io }),
            FRAME_REFUSE => {
                let msg: RefuseMsg = serde_json::from_slice(&payload).map_err(bad_json)?;
                Err(error_from_refuse(msg))
            }
            _ => Err(RelayError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected reply",
            ))),
        }
    }

    pub async fn send_unit(&mut self, unit: &Unit) -> io::Result<()> {
        write_frame(&mut self.io, FRAME_UNIT, &encode_unit(unit)).await
    }

    /// Announces a clean end of stream.
    pub async fn finish(&mut self) -> io::Result<()> {
        write_frame(&mut self.io, FRAME_END, &[]).await
    }
}

/// Client-side reader, used by tests and tools.
#[derive(Debug)]
pub struct FramedReader {
    io: TcpStream,
    info: MediaInfo,
}

impl FramedReader {
    pub async fn connect(
        addr: SocketAddr,
        path: &str,
        user: Option<&str>,
        pass: Option<&str>,
        tracks: Option<Vec<usize>>,
    ) -> Result<Self, RelayError> {
        let mut io = TcpStream::connect(addr).await?;

        let msg = IntentMsg {
            action: "read".into(),
            path: path.into(),
            query: String::new(),
            user: user.map(String::from),
            pass: pass.map(String::from),
            info: None,
            tracks,
        };
        let payload = serde_json::to_vec(&msg).map_err(bad_json)?;
        write_frame(&mut io, FRAME_INTENT, &payload).await?;

        let (kind, payload) = read_frame(&mut io).await?;
        match kind {
            FRAME_ACCEPT => {
                let msg: AcceptMsg = serde_json::from_slice(&payload).map_err(bad_json)?;
                Ok(Self {
                    io,
                    info: msg.info.unwrap_or_default(),
                })
            }
            FRAME_REFUSE => {
                let msg: RefuseMsg = serde_json::from_slice(&payload).map_err(bad_json)?;
                Err(error_from_refuse(msg))
            }
            _ => Err(RelayError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected reply",
            ))),
        }
    }

    pub fn info(&self) -> &MediaInfo {
        &self.info
    }

    /// Next unit from the server; `None` when the server closed the stream.
    pub async fn recv_unit(&mut self) -> io::Result<Option<Unit>> {
        match read_frame(&mut self.io).await {
            Ok((FRAME_UNIT, payload)) => Ok(Some(decode_unit(payload)?)),
            Ok((FRAME_END, _)) => Ok(None),
            Ok(_) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected frame in unit stream",
            )),
            // server closing the socket is a normal end of stream
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_codec() {
        let unit = Unit::new(2, Duration::from_micros(123_456), true, Bytes::from_static(b"payload"));
        let encoded = encode_unit(&unit);
        let decoded = decode_unit(encoded).unwrap();
        assert_eq!(decoded.track, 2);
        assert!(decoded.key);
        assert_eq!(decoded.pts, Duration::from_micros(123_456));
        assert_eq!(decoded.payload.as_ref(), b"payload");
    }

    #[test]
    fn test_short_unit_rejected() {
        assert!(decode_unit(vec![0; 4]).is_err());
    }

    #[test]
    fn test_error_codes_round_trip() {
        for err in [
            RelayError::AuthNotCritical,
            RelayError::AuthCritical("bad".into()),
            RelayError::NotFound("cam1".into()),
            RelayError::Busy("cam1".into()),
            RelayError::Terminated,
            RelayError::Timeout("cam1".into()),
        ] {
            let msg = RefuseMsg {
                code: error_code(&err).to_string(),
                error: "x".into(),
            };
            let back = error_from_refuse(msg);
            assert_eq!(error_code(&back), error_code(&err));
        }
    }
}

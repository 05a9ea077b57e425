//! Live stream object and reader fan-out
//!
//! A [`Stream`] exists while its path has a source; it owns one ring per
//! track and hands out independent [`StreamReader`]s. Media units are cheap
//! to clone (`bytes::Bytes` payloads are reference-counted), so fan-out never
//! copies payload data.

mod ring;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

pub use self::ring::RingReadError;
use self::ring::{Cursor, Ring};

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

/// Description of one track of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub kind: TrackKind,
    /// Codec label as the wire protocol names it ("h264", "aac", ...).
    pub codec: String,
    /// Codec initialization section (SPS/PPS, AudioSpecificConfig, ...).
    #[serde(with = "bytes_b64", default, skip_serializing_if = "Bytes::is_empty")]
    pub init: Bytes,
}

/// The media description a source supplies when it becomes ready.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub tracks: Vec<Track>,
}

impl fmt::Display for MediaInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<&str> = self.tracks.iter().map(|t| t.codec.as_str()).collect();
        write!(f, "{} tracks ({})", self.tracks.len(), labels.join(", "))
    }
}

/// One media unit (an access unit, a frame, a packet group).
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    /// Index of the track inside the stream's `MediaInfo`.
    pub track: usize,
    /// Per-track sequence number assigned by the ring at write time.
    pub seq: u64,
    pub pts: Duration,
    /// Random access point (keyframe) marker.
    pub key: bool,
    pub payload: Bytes,
}

impl Unit {
    pub fn new(track: usize, pts: Duration, key: bool, payload: Bytes) -> Self {
        Self {
            track,
            seq: 0,
            pts,
            key,
            payload,
        }
    }
}

/// Error observed by a [`StreamReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StreamReadError {
    /// The reader fell too far behind and must detach.
    #[error("reader fell behind, {missed} units lost")]
    Overflow { missed: u64 },
    /// The source left; the stream is over.
    #[error("stream closed")]
    Closed,
}

/// The live media object of an active path.
pub struct Stream {
    info: MediaInfo,
    rings: Vec<Arc<Ring>>,
    bytes_received: AtomicU64,
}

impl Stream {
    /// `capacity` is the configured `readBufferCount` (power of two).
    pub fn new(info: MediaInfo, capacity: usize) -> Self {
        let rings = info.tracks.iter().map(|_| Arc::new(Ring::new(capacity))).collect();
        Self {
            info,
            rings,
            bytes_received: AtomicU64::new(0),
        }
    }

    pub fn info(&self) -> &MediaInfo {
        &self.info
    }

    /// Publishes a unit on `track`. Returns the assigned sequence number, or
    /// `None` if the track does not exist.
    pub fn write(&self, track: usize, pts: Duration, key: bool, payload: Bytes) -> Option<u64> {
        let ring = self.rings.get(track)?;
        self.bytes_received
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        Some(ring.write(Unit::new(track, pts, key, payload)))
    }

    /// Attaches a reader to the given tracks (`None` = every track).
    ///
    /// The reader starts at the live edge.
    pub fn reader(&self, tracks: Option<&[usize]>) -> Option<StreamReader> {
        let track_ids: Vec<usize> = match tracks {
            Some(ids) => {
                if ids.iter().any(|&id| id >= self.rings.len()) {
                    return None;
                }
                ids.to_vec()
            }
            None => (0..self.rings.len()).collect(),
        };

        let notify = Arc::new(Notify::new());
        let cursors = track_ids
            .iter()
            .map(|&id| Cursor::new(self.rings[id].clone(), &notify))
            .collect();

        Some(StreamReader {
            cursors,
            notify,
            next: 0,
        })
    }

    /// Ends the stream: readers drain what is buffered, then observe
    /// [`StreamReadError::Closed`].
    pub fn close(&self) {
        for ring in &self.rings {
            ring.close();
        }
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}

/// An independent consumer of a stream.
///
/// `next` yields units of the subscribed tracks; within one track, units
/// arrive in publisher order.
pub struct StreamReader {
    cursors: Vec<Cursor>,
    notify: Arc<Notify>,
    /// Round-robin start index so one busy track cannot starve the others.
    next: usize,
}

impl StreamReader {
    /// Waits for and returns the next unit.
    pub async fn next(&mut self) -> Result<Unit, StreamReadError> {
        loop {
            if let Some(u) = self.poll_once()? {
                return Ok(u);
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`next`](Self::next); `Ok(None)` means no
    /// unit is currently buffered.
    pub fn poll_once(&mut self) -> Result<Option<Unit>, StreamReadError> {
        let len = self.cursors.len();
        let mut open = false;

        for i in 0..len {
            let idx = (self.next + i) % len;
            match self.cursors[idx].try_next() {
                Ok(Some(u)) => {
                    self.next = (idx + 1) % len;
                    return Ok(Some(u));
                }
                Ok(None) => open = true,
                Err(RingReadError::Closed) => {}
                Err(RingReadError::Overflow { missed }) => {
                    return Err(StreamReadError::Overflow { missed });
                }
            }
        }

        if open {
            Ok(None)
        } else {
            Err(StreamReadError::Closed)
        }
    }
}

mod bytes_b64 {
    //! `Bytes` as base64 in JSON-facing structures.

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(b: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(b))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64
            .decode(s)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_track_info() -> MediaInfo {
        MediaInfo {
            tracks: vec![
                Track {
                    kind: TrackKind::Video,
                    codec: "h264".into(),
                    init: Bytes::from_static(b"\x67\x42"),
                },
                Track {
                    kind: TrackKind::Audio,
                    codec: "aac".into(),
                    init: Bytes::new(),
                },
            ],
        }
    }

    #[tokio::test]
    async fn test_publisher_order_is_preserved() {
        let stream = Stream::new(two_track_info(), 256);
        let mut reader = stream.reader(None).unwrap();

        for i in 0..100u64 {
            stream
                .write(0, Duration::from_millis(i), i == 0, Bytes::from(vec![i as u8]))
                .unwrap();
        }

        for i in 0..100u64 {
            let u = reader.next().await.unwrap();
            assert_eq!(u.seq, i);
            assert_eq!(u.payload[0], i as u8);
        }
    }

    #[tokio::test]
    async fn test_readers_are_independent() {
        let stream = Stream::new(two_track_info(), 256);
        let mut r1 = stream.reader(None).unwrap();
        let mut r2 = stream.reader(None).unwrap();

        stream.write(0, Duration::ZERO, true, Bytes::from_static(b"a"));
        assert_eq!(r1.next().await.unwrap().seq, 0);
        assert_eq!(r2.next().await.unwrap().seq, 0);

        stream.write(0, Duration::ZERO, false, Bytes::from_static(b"b"));
        assert_eq!(r1.next().await.unwrap().seq, 1);
        assert_eq!(r2.next().await.unwrap().seq, 1);
    }

    #[tokio::test]
    async fn test_track_selection() {
        let stream = Stream::new(two_track_info(), 256);
        let mut audio_only = stream.reader(Some(&[1])).unwrap();

        stream.write(0, Duration::ZERO, true, Bytes::from_static(b"v"));
        stream.write(1, Duration::ZERO, false, Bytes::from_static(b"a"));

        let u = audio_only.next().await.unwrap();
        assert_eq!(u.track, 1);
        assert_eq!(u.payload.as_ref(), b"a");

        assert!(stream.reader(Some(&[5])).is_none());
    }

    #[tokio::test]
    async fn test_slow_reader_evicted_fast_reader_unaffected() {
        let stream = Stream::new(two_track_info(), 8);
        let mut slow = stream.reader(None).unwrap();
        let mut fast = stream.reader(None).unwrap();

        for i in 0..50u64 {
            stream.write(0, Duration::from_millis(i), false, Bytes::from(vec![0u8]));
            // the fast reader keeps up
            assert_eq!(fast.next().await.unwrap().seq, i);
        }

        // the slow reader never consumed anything and is now far behind
        assert!(matches!(
            slow.next().await,
            Err(StreamReadError::Overflow { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_ends_readers() {
        let stream = Stream::new(two_track_info(), 8);
        let mut reader = stream.reader(None).unwrap();

        stream.write(0, Duration::ZERO, true, Bytes::from_static(b"x"));
        stream.close();

        assert!(reader.next().await.is_ok());
        assert_eq!(reader.next().await, Err(StreamReadError::Closed));
    }

    #[test]
    fn test_bytes_counter() {
        let stream = Stream::new(two_track_info(), 8);
        stream.write(0, Duration::ZERO, true, Bytes::from_static(b"abcd"));
        stream.write(1, Duration::ZERO, false, Bytes::from_static(b"ef"));
        assert_eq!(stream.bytes_received(), 6);
    }

    #[test]
    fn test_media_info_json_round_trip() {
        let info = two_track_info();
        let json = serde_json::to_string(&info).unwrap();
        let back: MediaInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(info, back);
    }
}

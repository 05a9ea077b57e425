//! Protocol front-ends
//!
//! The raw-TCP protocols (RTSP, RTSPS, RTMP, RTMPS) are direct
//! instantiations of the generic [`server::Server`](crate::server::Server)
//! skeleton and are wired up by the supervisor. The HTTP-shaped front-ends
//! live here: HLS (muxer per path, segment serving) and WebRTC (signaling,
//! session registry, embedded player page).

pub mod hls;
pub mod webrtc;

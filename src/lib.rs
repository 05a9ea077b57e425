//! mediarelay: multi-protocol live media relay
//!
//! Publishers push streams to named *paths*; readers pull the same streams
//! back out over RTSP(S), RTMP(S), HLS and WebRTC front-ends. The path
//! manager mediates: at most one publisher per path, authentication,
//! on-demand source activation, bounded per-reader fan-out, and hot
//! configuration reload that leaves unaffected streams running.
//!
//! Wire-level codecs are pluggable through the seams in [`server::wire`],
//! [`front::hls`], [`front::webrtc`] and [`path::source`]; the crate ships a
//! simple length-prefixed TCP driver for tests and tooling.
//!
//! # Example
//! ```no_run
//! use mediarelay::core::{Core, CoreOpts};
//!
//! # async fn example() -> Result<(), mediarelay::core::CoreError> {
//! let core = Core::start("mediarelay.yml".into(), CoreOpts::default()).await?;
//! core.wait().await;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod conf;
pub mod core;
pub mod error;
pub mod externalcmd;
pub mod front;
pub mod logger;
pub mod metrics;
pub mod path;
pub mod server;
pub mod stream;

pub use error::{RelayError, Result};

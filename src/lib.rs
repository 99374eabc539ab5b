//! # gpspod - GpsPod USB GPS recorder client
//!
//! A Rust library (and CLI) for talking to the GpsPod GPS track recorder
//! over USB HID and decoding the recordings stored in its internal data
//! file.
//!
//! ## Features
//!
//! - Chunked request/reply packet framing with CRC-16 validation
//! - Typed commands: device info, battery status, settings, timed memory
//!   reads, file listing
//! - Lazy, cached byte view over the 0x3C0000-byte on-device data region
//! - Decoder for the doubly-linked entry-block chains and the tagged
//!   sample records they hold
//! - Session recording and offline replay for protocol work without a
//!   device
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use gpspod::{HidTransport, Pacing, Session};
//!
//! fn main() -> gpspod::Result<()> {
//!     let transport = HidTransport::open()?;
//!     let mut session = Session::new(transport, Pacing::from_env());
//!
//!     let info = session.device_info()?;
//!     println!("connected to {} ({})", info.model(), info.serial());
//!
//!     let log = session.tracks()?;
//!     for track in &log.tracks {
//!         println!("{} samples starting {}", track.samples.len(), track.start_time);
//!     }
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod command;
pub mod error;
pub mod gpx;
pub mod memory;
pub mod pmem;
pub mod samples;
pub mod session;
pub mod transport;

pub use error::{Error, Result};
pub use session::Session;
pub use transport::{HidTransport, Pacing, RecordingTransport, ReplayTransport, Transport};

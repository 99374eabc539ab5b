//! Report-level transport abstraction.
//!
//! The core only needs two primitives: write one fixed-size report, read one
//! back with a timeout. The live backend is USB HID ([`HidTransport`]); the
//! recording and replay wrappers ([`RecordingTransport`], [`ReplayTransport`])
//! exist for offline protocol work.

pub mod hid;
pub mod replay;

use std::fmt;
use std::time::Duration;

use crate::error::Result;

pub use hid::HidTransport;
pub use replay::{RecordingTransport, ReplayTransport};

/// Report size for the HID profile.
pub const DEFAULT_REPORT_LEN: usize = 64;

/// Environment variables backing the pacing knobs.
pub const ENV_READ_TIMEOUT: &str = "GPSPOD_READ_TIMEOUT";
pub const ENV_READ_SLEEP_MINSIZE: &str = "GPSPOD_READ_SLEEP_MINSIZE";
pub const ENV_READ_SLEEP_DURATION: &str = "GPSPOD_READ_SLEEP_DURATION";

/// One exclusively-owned endpoint to the device.
pub trait Transport {
    /// Write one report, already padded to `report_len` bytes; backends
    /// prepend their report ID.
    fn write_report(&mut self, report: &[u8]) -> Result<()>;

    /// Read one report, blocking up to `timeout`.
    fn read_report(&mut self, timeout: Duration) -> Result<Vec<u8>>;

    fn report_len(&self) -> usize;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write_report(&mut self, report: &[u8]) -> Result<()> {
        (**self).write_report(report)
    }

    fn read_report(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        (**self).read_report(timeout)
    }

    fn report_len(&self) -> usize {
        (**self).report_len()
    }
}

/// Direction of a report on the bus, as seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::HostToDevice => write!(f, ">"),
            Direction::DeviceToHost => write!(f, "<"),
        }
    }
}

/// Read pacing configuration.
///
/// Some host USB stacks (small embedded boards in particular) corrupt
/// transfers that follow a large read too closely; the sleep knobs insert a
/// pause after any read larger than the threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pacing {
    /// Timeout for one report read.
    pub read_timeout: Duration,
    /// Transfer size above which the post-read sleep applies.
    pub sleep_min_size: usize,
    /// Duration of the post-read sleep.
    pub sleep_duration: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(3000),
            sleep_min_size: 16 * 1024,
            sleep_duration: Duration::from_millis(100),
        }
    }
}

impl Pacing {
    /// Defaults overridden by the `GPSPOD_*` environment variables.
    pub fn from_env() -> Self {
        let mut pacing = Self::default();
        if let Some(ms) = env_millis(ENV_READ_TIMEOUT) {
            pacing.read_timeout = ms;
        }
        if let Some(bytes) = env_usize(ENV_READ_SLEEP_MINSIZE) {
            pacing.sleep_min_size = bytes;
        }
        if let Some(ms) = env_millis(ENV_READ_SLEEP_DURATION) {
            pacing.sleep_duration = ms;
        }
        pacing
    }

    /// Observe the sleep policy after a transfer of `transferred` bytes.
    pub fn post_read(&self, transferred: usize) {
        if transferred >= self.sleep_min_size && !self.sleep_duration.is_zero() {
            tracing::debug!(
                transferred,
                sleep_ms = self.sleep_duration.as_millis() as u64,
                "pacing sleep after large read"
            );
            std::thread::sleep(self.sleep_duration);
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    env_usize(name).map(|ms| Duration::from_millis(ms as u64))
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pacing_defaults() {
        let pacing = Pacing::default();
        assert_eq!(pacing.read_timeout, Duration::from_millis(3000));
        assert_eq!(pacing.sleep_min_size, 16 * 1024);
    }

    #[test]
    fn direction_symbols() {
        assert_eq!(Direction::HostToDevice.to_string(), ">");
        assert_eq!(Direction::DeviceToHost.to_string(), "<");
    }
}

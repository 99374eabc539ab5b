//! Session recording and offline replay.
//!
//! The recording format is line oriented and diff-friendly: one report per
//! line, a `>` or `<` direction marker, a space, then the report bytes in
//! lowercase hex. Lines starting with `#` are comments.
//!
//! ```text
//! # DeviceInfo exchange
//! > 5d000000060002000000d58a00000000...
//! < 5d0000003a0082003400477073506f64...
//! ```

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::{Direction, Transport, DEFAULT_REPORT_LEN};

/// Tee wrapper persisting every exchanged report to a log.
pub struct RecordingTransport<T: Transport, W: Write> {
    inner: T,
    sink: W,
}

impl<T: Transport, W: Write> RecordingTransport<T, W> {
    pub fn new(inner: T, sink: W) -> Self {
        Self { inner, sink }
    }

    pub fn into_inner(self) -> (T, W) {
        (self.inner, self.sink)
    }
}

impl<T: Transport, W: Write> Transport for RecordingTransport<T, W> {
    fn write_report(&mut self, report: &[u8]) -> Result<()> {
        writeln!(self.sink, "> {}", hex::encode(report))?;
        self.inner.write_report(report)
    }

    fn read_report(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let report = self.inner.read_report(timeout)?;
        writeln!(self.sink, "< {}", hex::encode(&report))?;
        Ok(report)
    }

    fn report_len(&self) -> usize {
        self.inner.report_len()
    }
}

/// Substitute transport that feeds pre-recorded reports.
///
/// Reads pop the next recorded device report; writes are verified
/// byte-for-byte against the recorded host report, so a replayed session
/// proves the client still produces the captured bytes.
pub struct ReplayTransport {
    entries: VecDeque<(Direction, Vec<u8>)>,
    report_len: usize,
}

impl ReplayTransport {
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut entries = VecDeque::new();
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let direction = match line.as_bytes()[0] {
                b'>' => Direction::HostToDevice,
                b'<' => Direction::DeviceToHost,
                other => {
                    return Err(Error::Transport(format!(
                        "replay log line {}: unknown direction marker {:?}",
                        number + 1,
                        other as char
                    )))
                }
            };
            let bytes = hex::decode(line[1..].trim()).map_err(|e| {
                Error::Transport(format!("replay log line {}: bad hex: {e}", number + 1))
            })?;
            entries.push_back((direction, bytes));
        }
        debug!(reports = entries.len(), "loaded replay log");
        Ok(Self {
            entries,
            report_len: DEFAULT_REPORT_LEN,
        })
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_reader(BufReader::new(std::fs::File::open(path)?))
    }

    /// All recorded reports, in order. Used by the protocol inspector.
    pub fn entries(&self) -> impl Iterator<Item = &(Direction, Vec<u8>)> {
        self.entries.iter()
    }

    pub fn is_exhausted(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Transport for ReplayTransport {
    fn write_report(&mut self, report: &[u8]) -> Result<()> {
        match self.entries.pop_front() {
            None => Err(Error::Transport("replay log exhausted on write".to_string())),
            Some((Direction::DeviceToHost, _)) => Err(Error::Protocol(
                "replay log expected a device report here, host wrote instead".to_string(),
            )),
            Some((Direction::HostToDevice, recorded)) => {
                if recorded != report {
                    return Err(Error::Protocol(format!(
                        "host report diverges from recording (recorded {}, wrote {})",
                        hex::encode(&recorded),
                        hex::encode(report)
                    )));
                }
                Ok(())
            }
        }
    }

    fn read_report(&mut self, _timeout: Duration) -> Result<Vec<u8>> {
        match self.entries.pop_front() {
            None => Err(Error::Transport("replay log exhausted on read".to_string())),
            Some((Direction::HostToDevice, _)) => Err(Error::Protocol(
                "replay log expected a host report here, host read instead".to_string(),
            )),
            Some((Direction::DeviceToHost, recorded)) => Ok(recorded),
        }
    }

    fn report_len(&self) -> usize {
        self.report_len
    }
}

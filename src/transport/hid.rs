//! USB HID backend.

use std::time::Duration;

use hidapi::{HidApi, HidDevice};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::transport::{Transport, DEFAULT_REPORT_LEN};

pub const VENDOR_ID: u16 = 0x1493;
pub const PRODUCT_ID: u16 = 0x0020;

/// Report ID prepended to every output report and stripped from input.
pub const REPORT_ID: u8 = 0x3F;

/// HID transport over a GpsPod matched by vendor/product ID.
///
/// The device enumerates slowly after plug-in; an open failure is often
/// cured by simply trying again a few seconds later.
pub struct HidTransport {
    device: HidDevice,
    report_len: usize,
}

impl HidTransport {
    pub fn open() -> Result<Self> {
        Self::open_ids(VENDOR_ID, PRODUCT_ID)
    }

    pub fn open_ids(vendor_id: u16, product_id: u16) -> Result<Self> {
        let api = HidApi::new()
            .map_err(|e| Error::Transport(format!("HID subsystem init failed: {e}")))?;
        let device = api.open(vendor_id, product_id).map_err(|e| {
            Error::Transport(format!(
                "could not open HID device {vendor_id:04x}:{product_id:04x}: {e}"
            ))
        })?;
        info!("opened HID device {vendor_id:04x}:{product_id:04x}");
        Ok(Self {
            device,
            report_len: DEFAULT_REPORT_LEN,
        })
    }
}

impl Transport for HidTransport {
    fn write_report(&mut self, report: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(self.report_len + 1);
        buf.push(REPORT_ID);
        buf.extend_from_slice(report);
        buf.resize(self.report_len + 1, 0);

        let written = self
            .device
            .write(&buf)
            .map_err(|e| Error::Transport(format!("report write failed: {e}")))?;
        if written < buf.len() {
            return Err(Error::Transport(format!(
                "short report write ({written} of {} bytes)",
                buf.len()
            )));
        }
        debug!(bytes = report.len(), "wrote report");
        Ok(())
    }

    fn read_report(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.report_len + 1];
        let n = self
            .device
            .read_timeout(&mut buf, timeout.as_millis() as i32)
            .map_err(|e| Error::Transport(format!("report read failed: {e}")))?;
        if n == 0 {
            return Err(Error::Timeout(timeout));
        }

        buf.truncate(n);
        // Numbered input reports lead with the report ID on some platforms.
        if buf.first() == Some(&REPORT_ID) && buf.len() > self.report_len {
            buf.remove(0);
        }
        debug!(bytes = buf.len(), "read report");
        Ok(buf)
    }

    fn report_len(&self) -> usize {
        self.report_len
    }
}

//! One exclusive session against a GpsPod.
//!
//! The device assumes strict request/reply pairing: one command in flight,
//! sequence numbers issued in order, no pipelining. The session owns the
//! transport, the packet codec and the memory-view cache, and frees them
//! together.

use tracing::{debug, info};

use crate::codec::PacketCodec;
use crate::command::{self, CommandId};
use crate::command::files::{DirectoryEntry, ListFilesReply, ListFilesRequest};
use crate::command::memory::{
    ReadMemoryReply, ReadMemoryRequest, WriteSettingReply, WriteSettingRequest, SETTINGS_LEN,
};
use crate::command::system::{DeviceInfoReply, DeviceStatusReply};
use crate::error::{Error, Result};
use crate::memory::{MemoryView, REGION_SIZE};
use crate::samples::{self, TrackLog};
use crate::transport::{Pacing, Transport};

/// Region offset of the settings blob, for cache invalidation on write.
pub const SETTINGS_BASE: u32 = 0x0100;

pub struct Session<T: Transport> {
    transport: T,
    codec: PacketCodec,
    pacing: Pacing,
    view: MemoryView,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, pacing: Pacing) -> Self {
        let report_len = transport.report_len();
        info!(report_len, "session opened");
        Self {
            transport,
            codec: PacketCodec::new(report_len),
            pacing,
            view: MemoryView::new(),
        }
    }

    /// Tear the session down and hand the transport back.
    pub fn into_transport(self) -> T {
        self.transport
    }

    fn run(&mut self, id: CommandId, body: &[u8]) -> Result<Vec<u8>> {
        command::dispatch(&mut self.transport, &mut self.codec, &self.pacing, id, body)
    }

    pub fn device_info(&mut self) -> Result<DeviceInfoReply> {
        let reply = self.run(CommandId::DeviceInfo, &[])?;
        DeviceInfoReply::try_from(reply.as_slice())
    }

    pub fn device_status(&mut self) -> Result<DeviceStatusReply> {
        let reply = self.run(CommandId::DeviceStatus, &[])?;
        DeviceStatusReply::try_from(reply.as_slice())
    }

    /// The 2 KiB opaque settings blob.
    pub fn read_settings(&mut self) -> Result<Vec<u8>> {
        let reply = self.run(CommandId::ReadSettings, &[])?;
        if reply.len() != SETTINGS_LEN {
            return Err(Error::Protocol(format!(
                "settings blob of {} bytes, expected {SETTINGS_LEN}",
                reply.len()
            )));
        }
        Ok(reply)
    }

    /// Write a range of the settings blob.
    ///
    /// Repeated writes of identical bytes are safe. Cached memory chunks
    /// overlapping the written range are invalidated so a later read
    /// observes the new value.
    pub fn write_setting(&mut self, offset: u16, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Err(Error::Usage("empty settings write".to_string()));
        }
        if offset as usize + bytes.len() > SETTINGS_LEN {
            return Err(Error::Usage(format!(
                "settings write of {} bytes at {offset} crosses the {SETTINGS_LEN}-byte blob",
                bytes.len()
            )));
        }

        let request = WriteSettingRequest::new(offset, bytes.to_vec());
        let reply = self.run(CommandId::WriteSetting, &request.to_bytes()?)?;
        let ack = WriteSettingReply::try_from(reply.as_slice())?;
        if ack.status != 0 {
            return Err(Error::Device {
                command: CommandId::WriteSetting.name(),
                status: ack.status,
            });
        }

        self.view
            .invalidate(SETTINGS_BASE + offset as u32, bytes.len() as u32);
        debug!(offset, len = bytes.len(), "setting written");
        Ok(())
    }

    /// One raw timed read, bypassing the memory cache.
    pub fn read_memory(&mut self, offset: u32, length: u32) -> Result<Vec<u8>> {
        fetch_window(
            &mut self.transport,
            &mut self.codec,
            &self.pacing,
            offset,
            length,
        )
    }

    /// Directory of the on-device volume, following pagination.
    pub fn list_files(&mut self) -> Result<Vec<DirectoryEntry>> {
        let mut entries = Vec::new();
        let mut page = 0u16;
        loop {
            let request = ListFilesRequest { page };
            let reply = self.run(CommandId::ListFiles, &request.to_bytes()?)?;
            let reply = ListFilesReply::try_from(reply.as_slice())?;
            if reply.status != 0 {
                return Err(Error::Device {
                    command: CommandId::ListFiles.name(),
                    status: reply.status,
                });
            }
            entries.extend(reply.entries);
            if reply.more_pages == 0 {
                return Ok(entries);
            }
            page += 1;
        }
    }

    /// Cached read of `[offset, offset + len)` from the data region.
    pub fn memory_read(&mut self, offset: u32, len: u32) -> Result<&[u8]> {
        let Self {
            transport,
            codec,
            pacing,
            view,
        } = self;
        view.read_with(offset, len, |window_offset, window_len| {
            fetch_window(transport, codec, pacing, window_offset, window_len)
        })
    }

    /// The whole data region, fetched through the cache.
    pub fn dump(&mut self) -> Result<&[u8]> {
        self.memory_read(0, REGION_SIZE)
    }

    /// Decode the recorded tracks from the device's track chain.
    pub fn tracks(&mut self) -> Result<TrackLog> {
        let Self {
            transport,
            codec,
            pacing,
            view,
        } = self;
        samples::read_tracks(|offset, len| {
            view.read_with(offset, len, |window_offset, window_len| {
                fetch_window(transport, codec, pacing, window_offset, window_len)
            })
            .map(|bytes| bytes.to_vec())
        })
    }
}

/// Issue one ReadMemory command and validate the echoed window.
fn fetch_window<T: Transport + ?Sized>(
    transport: &mut T,
    codec: &mut PacketCodec,
    pacing: &Pacing,
    offset: u32,
    length: u32,
) -> Result<Vec<u8>> {
    let request = ReadMemoryRequest { offset, length };
    let reply = command::dispatch(
        transport,
        codec,
        pacing,
        CommandId::ReadMemory,
        &request.to_bytes()?,
    )?;
    let reply = ReadMemoryReply::try_from(reply.as_slice())?;
    if reply.status != 0 {
        return Err(Error::Device {
            command: CommandId::ReadMemory.name(),
            status: reply.status,
        });
    }
    if reply.offset != offset || reply.length != length {
        return Err(Error::Protocol(format!(
            "read window mismatch: asked for {length} bytes at {offset:#x}, device answered {} at {:#x}",
            reply.length, reply.offset
        )));
    }
    pacing.post_read(reply.bytes.len());
    Ok(reply.bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::command::system::{pad_str, StatusFlags, Version};
    use crate::transport::{ReplayTransport, DEFAULT_REPORT_LEN};
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::time::Duration;

    fn fast_pacing() -> Pacing {
        Pacing {
            read_timeout: Duration::from_millis(50),
            sleep_min_size: usize::MAX,
            sleep_duration: Duration::ZERO,
        }
    }

    /// Build a replay log for one request/reply exchange.
    fn exchange_log(seq: u8, id: CommandId, request_body: &[u8], reply_body: &[u8]) -> String {
        let codec = PacketCodec::new(DEFAULT_REPORT_LEN);
        let mut log = String::new();
        for packet in codec.encode_message(seq, id.as_u16(), request_body).unwrap() {
            log.push_str(&format!("> {}\n", hex::encode(packet)));
        }
        for packet in codec
            .encode_message(seq, id.reply_code(), reply_body)
            .unwrap()
        {
            log.push_str(&format!("< {}\n", hex::encode(packet)));
        }
        log
    }

    #[test]
    fn device_info_over_replay() {
        let reply = DeviceInfoReply {
            model: pad_str("GpsPod"),
            serial: pad_str("8761994617001000"),
            firmware: Version {
                major: 1,
                minor: 6,
                patch: 39,
                build: 0,
            },
            hardware: Version {
                major: 66,
                minor: 2,
                patch: 0,
                build: 0,
            },
            bootloader: Version {
                major: 1,
                minor: 4,
                patch: 3,
                build: 0,
            },
        };
        let log = exchange_log(0, CommandId::DeviceInfo, &[], &reply.to_bytes().unwrap());

        let transport = ReplayTransport::from_reader(Cursor::new(log)).unwrap();
        let mut session = Session::new(transport, fast_pacing());
        let info = session.device_info().unwrap();
        assert_eq!(info.model(), "GpsPod");
        assert_eq!(info.serial(), "8761994617001000");
        assert_eq!(info.firmware.to_string(), "1.6.39.0");
        assert_eq!(info.hardware.to_string(), "66.2.0.0");
        assert_eq!(info.bootloader.to_string(), "1.4.3.0");
    }

    #[test]
    fn device_status_over_replay() {
        let reply = DeviceStatusReply {
            charge: 93,
            flags: StatusFlags::CHARGER_CONNECTED,
        };
        let log = exchange_log(0, CommandId::DeviceStatus, &[], &reply.to_bytes().unwrap());

        let transport = ReplayTransport::from_reader(Cursor::new(log)).unwrap();
        let mut session = Session::new(transport, fast_pacing());
        let status = session.device_status().unwrap();
        assert_eq!(format!("Charge: {}%", status.charge), "Charge: 93%");
    }

    #[test]
    fn unexpected_reply_code_is_a_protocol_error() {
        // Device answers a DeviceInfo request with a DeviceStatus reply.
        let codec = PacketCodec::new(DEFAULT_REPORT_LEN);
        let mut log = String::new();
        for packet in codec
            .encode_message(0, CommandId::DeviceInfo.as_u16(), &[])
            .unwrap()
        {
            log.push_str(&format!("> {}\n", hex::encode(packet)));
        }
        for packet in codec
            .encode_message(0, CommandId::DeviceStatus.reply_code(), &[93, 0])
            .unwrap()
        {
            log.push_str(&format!("< {}\n", hex::encode(packet)));
        }

        let transport = ReplayTransport::from_reader(Cursor::new(log)).unwrap();
        let mut session = Session::new(transport, fast_pacing());
        assert!(matches!(session.device_info(), Err(Error::Protocol(_))));
    }

    /// A device simulator answering ReadMemory commands out of a byte image,
    /// with optional one-shot reply corruption.
    struct SimulatedDevice {
        memory: Vec<u8>,
        assembling: Vec<u8>,
        pending: VecDeque<Vec<u8>>,
        corrupt_replies: usize,
        commands_served: usize,
    }

    impl SimulatedDevice {
        fn new(memory: Vec<u8>) -> Self {
            Self {
                memory,
                assembling: Vec::new(),
                pending: VecDeque::new(),
                corrupt_replies: 0,
                commands_served: 0,
            }
        }
    }

    impl Transport for SimulatedDevice {
        fn write_report(&mut self, report: &[u8]) -> Result<()> {
            let index = report[2];
            let total = report[3];
            let len = report[4] as usize;
            self.assembling.extend_from_slice(&report[5..5 + len]);
            if index != total {
                return Ok(());
            }

            let message = std::mem::take(&mut self.assembling);
            let (code, body) = codec::parse_message(&message).unwrap();
            assert_eq!(code, CommandId::ReadMemory.as_u16());
            let request = ReadMemoryRequest::try_from(body.as_slice()).unwrap();

            let start = request.offset as usize;
            let end = start + request.length as usize;
            let reply = ReadMemoryReply {
                status: 0,
                offset: request.offset,
                length: request.length,
                bytes: self.memory[start..end].to_vec(),
            };

            let reply_codec = PacketCodec::new(DEFAULT_REPORT_LEN);
            let seq = report[1];
            let mut packets = reply_codec
                .encode_message(seq, CommandId::ReadMemory.reply_code(), &reply.to_bytes().unwrap())
                .unwrap();
            if self.corrupt_replies > 0 {
                self.corrupt_replies -= 1;
                // Flip one payload byte of the first reply packet so its
                // CRC no longer matches.
                packets[0][6] ^= 0xFF;
            }
            self.pending.extend(packets);
            self.commands_served += 1;
            Ok(())
        }

        fn read_report(&mut self, timeout: Duration) -> Result<Vec<u8>> {
            self.pending.pop_front().ok_or(Error::Timeout(timeout))
        }

        fn report_len(&self) -> usize {
            DEFAULT_REPORT_LEN
        }
    }

    #[test]
    fn corrupted_reply_packet_triggers_one_retry() {
        let memory: Vec<u8> = (0..REGION_SIZE).map(|i| (i % 253) as u8).collect();
        let expected = memory[0..1024].to_vec();

        let mut device = SimulatedDevice::new(memory);
        device.corrupt_replies = 1;
        let mut session = Session::new(device, fast_pacing());

        let bytes = session.memory_read(0, 1024).unwrap().to_vec();
        assert_eq!(bytes, expected);
        assert_eq!(
            session.into_transport().commands_served,
            2,
            "one corrupt attempt plus one clean retry"
        );
    }

    #[test]
    fn memory_reads_are_cached_across_calls() {
        let memory: Vec<u8> = (0..REGION_SIZE).map(|i| (i % 253) as u8).collect();
        let mut session = Session::new(SimulatedDevice::new(memory), fast_pacing());

        let first = session.memory_read(100, 300).unwrap().to_vec();
        let second = session.memory_read(100, 300).unwrap().to_vec();
        assert_eq!(first, second);
        assert_eq!(session.into_transport().commands_served, 1);
    }

    #[test]
    fn desync_is_not_retried() {
        // A device that always answers under the wrong sequence number.
        struct WrongSeqDevice {
            inner: SimulatedDevice,
        }

        impl Transport for WrongSeqDevice {
            fn write_report(&mut self, report: &[u8]) -> Result<()> {
                let mut shifted = report.to_vec();
                shifted[1] = shifted[1].wrapping_add(7);
                // Re-frame under the shifted sequence so only the sequence
                // check can fail.
                let len = shifted[4] as usize;
                let crc = codec::TRANSFER_CRC.checksum(&shifted[..5 + len]);
                shifted[5 + len..5 + len + 2].copy_from_slice(&crc.to_le_bytes());
                self.inner.write_report(&shifted)
            }

            fn read_report(&mut self, timeout: Duration) -> Result<Vec<u8>> {
                self.inner.read_report(timeout)
            }

            fn report_len(&self) -> usize {
                self.inner.report_len()
            }
        }

        let memory = vec![0u8; REGION_SIZE as usize];
        let device = WrongSeqDevice {
            inner: SimulatedDevice::new(memory),
        };
        let mut session = Session::new(device, fast_pacing());
        assert!(matches!(
            session.memory_read(0, 512),
            Err(Error::Desync { .. })
        ));
    }
}

use binrw::{binrw, BinRead, BinWrite};
use bitflags::bitflags;

use crate::command::impl_wire_conversions;

/// Four-component version as reported by the device, e.g. `1.6.39.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub build: u8,
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.patch, self.build
        )
    }
}

bitflags! {
    /// Device status bitmask in the DeviceStatus reply
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[binrw]
    #[br(map = |x: u8| StatusFlags::from_bits_truncate(x))]
    #[bw(map = |x: &StatusFlags| x.bits())]
    pub struct StatusFlags: u8 {
        const CHARGER_CONNECTED = 1 << 0;
        const CHARGING = 1 << 1;
        const LOGGING_ACTIVE = 1 << 2;
        const MEMORY_LOW = 1 << 3;
        const GPS_FIX = 1 << 4;
    }
}

impl StatusFlags {
    pub fn active_names(self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.contains(Self::CHARGER_CONNECTED) {
            names.push("charger connected");
        }
        if self.contains(Self::CHARGING) {
            names.push("charging");
        }
        if self.contains(Self::LOGGING_ACTIVE) {
            names.push("logging");
        }
        if self.contains(Self::MEMORY_LOW) {
            names.push("memory low");
        }
        if self.contains(Self::GPS_FIX) {
            names.push("GPS fix");
        }
        names
    }
}

/// Device information reply (DeviceInfo 0x0200, length 44) - Read only
#[derive(Debug, Clone, PartialEq, BinRead, BinWrite)]
#[brw(little)]
pub struct DeviceInfoReply {
    /// Model name, NUL padded
    pub model: [u8; 16],
    /// Serial number, NUL padded
    pub serial: [u8; 16],
    pub firmware: Version,
    pub hardware: Version,
    pub bootloader: Version,
}

impl_wire_conversions!(DeviceInfoReply);

impl DeviceInfoReply {
    pub fn model(&self) -> String {
        padded_str(&self.model)
    }

    pub fn serial(&self) -> String {
        padded_str(&self.serial)
    }
}

/// Device status reply (DeviceStatus 0x0306, length 2) - Read only
#[derive(Debug, Clone, Copy, PartialEq, BinRead, BinWrite)]
#[brw(little)]
pub struct DeviceStatusReply {
    /// Battery charge in percent
    pub charge: u8,
    pub flags: StatusFlags,
}

impl_wire_conversions!(DeviceStatusReply);

fn padded_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Build a NUL-padded fixed-size field from a string, for tests and tools.
pub fn pad_str<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let bytes = s.as_bytes();
    let n = bytes.len().min(N);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

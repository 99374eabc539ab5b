use binrw::{BinRead, BinWrite};

use crate::command::impl_wire_conversions;

/// Size of the opaque settings blob returned by ReadSettings.
pub const SETTINGS_LEN: usize = 2048;

/// Timed memory read request (ReadMemory 0x0B17) - Write only
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct ReadMemoryRequest {
    /// Absolute offset within the data region
    pub offset: u32,
    /// Bytes to read
    pub length: u32,
}

impl_wire_conversions!(ReadMemoryRequest);

/// Timed memory read reply - Read only
///
/// The device echoes the requested window ahead of the data, which lets the
/// host detect a short or shifted read without counting bytes.
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct ReadMemoryReply {
    pub status: u8,
    pub offset: u32,
    pub length: u32,
    #[br(count = length)]
    pub bytes: Vec<u8>,
}

impl_wire_conversions!(ReadMemoryReply);

/// Settings write request (WriteSetting 0x0B01) - Write only
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct WriteSettingRequest {
    /// Offset within the settings blob
    pub offset: u16,
    pub length: u16,
    #[br(count = length)]
    pub bytes: Vec<u8>,
}

impl_wire_conversions!(WriteSettingRequest);

impl WriteSettingRequest {
    pub fn new(offset: u16, bytes: Vec<u8>) -> Self {
        Self {
            offset,
            length: bytes.len() as u16,
            bytes,
        }
    }
}

/// Settings write acknowledgement - Read only
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct WriteSettingReply {
    pub status: u8,
}

impl_wire_conversions!(WriteSettingReply);

pub mod files;
pub mod memory;
pub mod system;

use std::time::Duration;

use tracing::warn;

use crate::codec::{self, PacketCodec};
use crate::error::{Error, Result};
use crate::transport::{Pacing, Transport};

/// Reply codes set the high bit of the request code.
pub const REPLY_FLAG: u16 = 0x8000;

/// Backoff between retries of a command that failed transiently.
pub const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_millis(10),
    Duration::from_millis(40),
    Duration::from_millis(160),
];

/// Read timeout used when draining a half-received reply before a retry.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(50);

/// Command codes understood by the GpsPod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandId {
    DeviceInfo = 0x0200,
    DeviceStatus = 0x0306,
    ReadSettings = 0x0B00,
    WriteSetting = 0x0B01,
    ListFiles = 0x0B05,
    ReadMemory = 0x0B17,
}

impl CommandId {
    /// Convert a u16 value to a CommandId
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0200 => Some(Self::DeviceInfo),
            0x0306 => Some(Self::DeviceStatus),
            0x0B00 => Some(Self::ReadSettings),
            0x0B01 => Some(Self::WriteSetting),
            0x0B05 => Some(Self::ListFiles),
            0x0B17 => Some(Self::ReadMemory),
            _ => None,
        }
    }

    /// Get the u16 value of the CommandId
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// The command code the device answers with.
    pub fn reply_code(self) -> u16 {
        self.as_u16() | REPLY_FLAG
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::DeviceInfo => "DeviceInfo",
            Self::DeviceStatus => "DeviceStatus",
            Self::ReadSettings => "ReadSettings",
            Self::WriteSetting => "WriteSetting",
            Self::ListFiles => "ListFiles",
            Self::ReadMemory => "ReadMemory",
        }
    }
}

/// Issue one command and return the raw reply body.
///
/// Transport and packet failures are retried with the [`RETRY_BACKOFF`]
/// schedule; every retry reissues the whole command under a fresh sequence
/// number. Desyncs and everything above the packet layer surface unchanged.
pub fn dispatch<T: Transport + ?Sized>(
    transport: &mut T,
    codec: &mut PacketCodec,
    pacing: &Pacing,
    id: CommandId,
    body: &[u8],
) -> Result<Vec<u8>> {
    let mut attempt = 0;
    loop {
        match codec::exchange(transport, codec, pacing, id.as_u16(), body) {
            Ok((code, reply)) => {
                if code != id.reply_code() {
                    return Err(Error::Protocol(format!(
                        "unexpected reply code {code:#06x} to {}",
                        id.name()
                    )));
                }
                return Ok(reply);
            }
            Err(e) if e.is_transient() && attempt < RETRY_BACKOFF.len() => {
                warn!(
                    command = id.name(),
                    attempt, error = %e, "retrying command after transient error"
                );
                // The device may still be emitting the failed reply; a
                // retried command must not read its leftovers.
                drain(transport);
                std::thread::sleep(RETRY_BACKOFF[attempt]);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Discard reports until the device goes quiet.
fn drain<T: Transport + ?Sized>(transport: &mut T) {
    while transport.read_report(DRAIN_TIMEOUT).is_ok() {}
}

/// Macro to implement `TryFrom<&[u8]>` and `to_bytes` for wire structs using binrw
macro_rules! impl_wire_conversions {
    ($wire_type:ty) => {
        impl TryFrom<&[u8]> for $wire_type {
            type Error = crate::error::Error;

            fn try_from(data: &[u8]) -> crate::error::Result<Self> {
                use binrw::BinRead;
                let mut cursor = std::io::Cursor::new(data);
                Self::read_le(&mut cursor).map_err(|e| {
                    crate::error::Error::Protocol(format!(
                        "failed to decode {}: {e}",
                        stringify!($wire_type)
                    ))
                })
            }
        }

        impl $wire_type {
            pub fn to_bytes(&self) -> crate::error::Result<Vec<u8>> {
                use binrw::BinWrite;
                let mut cursor = std::io::Cursor::new(Vec::new());
                self.write_le(&mut cursor).map_err(|e| {
                    crate::error::Error::Protocol(format!(
                        "failed to encode {}: {e}",
                        stringify!($wire_type)
                    ))
                })?;
                Ok(cursor.into_inner())
            }
        }
    };
}

pub(crate) use impl_wire_conversions;

#[cfg(test)]
#[path = "tests/layout.rs"]
mod layout_tests;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_codes_round_trip() {
        for id in [
            CommandId::DeviceInfo,
            CommandId::DeviceStatus,
            CommandId::ReadSettings,
            CommandId::WriteSetting,
            CommandId::ListFiles,
            CommandId::ReadMemory,
        ] {
            assert_eq!(CommandId::from_u16(id.as_u16()), Some(id));
        }
        assert_eq!(CommandId::from_u16(0x7777), None);
    }

    #[test]
    fn reply_code_sets_direction_bit() {
        assert_eq!(CommandId::DeviceInfo.reply_code(), 0x8200);
        assert_eq!(CommandId::ReadMemory.reply_code(), 0x8B17);
    }
}

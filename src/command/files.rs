use binrw::{BinRead, BinWrite};

use crate::command::impl_wire_conversions;

/// File listing request (ListFiles 0x0B05) - Write only
///
/// The listing is paginated; the host repeats the command with an
/// incremented page index until the reply clears `more_pages`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct ListFilesRequest {
    pub page: u16,
}

impl_wire_conversions!(ListFilesRequest);

/// One directory entry of the on-device FAT volume.
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct DirectoryEntry {
    /// File name, NUL padded
    pub name: [u8; 16],
    pub size: u32,
    pub attributes: u8,
}

impl DirectoryEntry {
    pub fn name(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }
}

/// File listing reply - Read only
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct ListFilesReply {
    pub status: u8,
    pub more_pages: u8,
    pub count: u8,
    #[br(count = count)]
    pub entries: Vec<DirectoryEntry>,
}

impl_wire_conversions!(ListFilesReply);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::system::pad_str;

    #[test]
    fn list_files_reply_round_trip() {
        let reply = ListFilesReply {
            status: 0,
            more_pages: 0,
            count: 2,
            entries: vec![
                DirectoryEntry {
                    name: pad_str("DATA.BIN"),
                    size: 0x3C0000,
                    attributes: 0x01,
                },
                DirectoryEntry {
                    name: pad_str("SETTINGS.BIN"),
                    size: 2048,
                    attributes: 0x00,
                },
            ],
        };

        let bytes = reply.to_bytes().unwrap();
        let back = ListFilesReply::try_from(bytes.as_slice()).unwrap();
        assert_eq!(back, reply);
        assert_eq!(back.entries[0].name(), "DATA.BIN");
    }
}

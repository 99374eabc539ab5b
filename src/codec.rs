//! Transfer-packet framing for the GpsPod request/reply protocol.
//!
//! A command message is split across one or more fixed-size transfer packets.
//! Each packet carries a type tag, the session sequence counter, its index
//! within the message, the total packet count and a payload, and ends with a
//! CRC-16 over everything before it:
//!
//! ```text
//! [type][seq][index][total][len][payload ...][crc16 lo][crc16 hi]
//! ```
//!
//! The message itself is `command (u16) || body length (u16) || body ||
//! crc16(body)`, all little-endian. Zero-length bodies are valid and are
//! used as acknowledgements.

use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_16_IBM_3740};
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::{Pacing, Transport};

/// CRC-16/CCITT-FALSE, used for both the packet and the message checksum.
pub const TRANSFER_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Packet type tag for command data packets.
pub const PACKET_DATA: u8 = 0x5D;

/// Type, sequence, index, total, payload length.
pub const PACKET_HEADER_LEN: usize = 5;
/// Trailing CRC-16.
pub const PACKET_TRAILER_LEN: usize = 2;
pub const PACKET_OVERHEAD: usize = PACKET_HEADER_LEN + PACKET_TRAILER_LEN;

/// Command code, body length, body CRC.
pub const MESSAGE_OVERHEAD: usize = 6;

/// A parsed inbound transfer packet.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundPacket {
    pub index: u8,
    pub total: u8,
    pub payload: Vec<u8>,
}

/// Owns the per-session sequence counter and the packet-size bookkeeping.
///
/// One codec per session; the sequence counter ties reply packets to the
/// request that elicited them and wraps mod 256.
#[derive(Debug)]
pub struct PacketCodec {
    seq: u8,
    report_len: usize,
}

impl PacketCodec {
    pub fn new(report_len: usize) -> Self {
        assert!(
            report_len > PACKET_OVERHEAD,
            "report length {report_len} cannot carry a packet header"
        );
        Self { seq: 0, report_len }
    }

    pub fn report_len(&self) -> usize {
        self.report_len
    }

    /// Payload bytes that fit in one transfer packet.
    pub fn payload_capacity(&self) -> usize {
        self.report_len - PACKET_OVERHEAD
    }

    /// Largest message body a single command may carry.
    ///
    /// The packet index and total-count fields are one byte each, so a
    /// message is at most 256 packets long.
    pub fn max_body_len(&self) -> usize {
        256 * self.payload_capacity() - MESSAGE_OVERHEAD
    }

    /// Take the sequence number for the next command pair.
    pub fn next_seq(&mut self) -> u8 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    /// Frame `command` and `body` into wire-ready reports.
    pub fn encode_message(&self, seq: u8, command: u16, body: &[u8]) -> Result<Vec<Vec<u8>>> {
        if body.len() > self.max_body_len() {
            return Err(Error::Usage(format!(
                "message body of {} bytes exceeds the {}-byte command limit",
                body.len(),
                self.max_body_len()
            )));
        }

        let message = build_message(command, body);
        let chunks: Vec<&[u8]> = message.chunks(self.payload_capacity()).collect();
        let total = (chunks.len() - 1) as u8;

        let mut packets = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.iter().enumerate() {
            let mut packet = BytesMut::with_capacity(self.report_len);
            packet.put_u8(PACKET_DATA);
            packet.put_u8(seq);
            packet.put_u8(index as u8);
            packet.put_u8(total);
            packet.put_u8(chunk.len() as u8);
            packet.put_slice(chunk);
            let crc = TRANSFER_CRC.checksum(&packet);
            packet.put_u16_le(crc);
            packet.resize(self.report_len, 0);
            packets.push(packet.to_vec());
        }
        Ok(packets)
    }

    /// Validate one inbound report against the expected sequence and index.
    pub fn parse_packet(&self, raw: &[u8], seq: u8, expect_index: u8) -> Result<InboundPacket> {
        if raw.len() < PACKET_OVERHEAD {
            return Err(Error::Packet(format!(
                "short report of {} bytes",
                raw.len()
            )));
        }
        if raw[0] != PACKET_DATA {
            debug!("unexpected packet type {:#04x}", raw[0]);
            return Err(Error::Packet(format!(
                "unexpected packet type {:#04x}",
                raw[0]
            )));
        }

        let got_seq = raw[1];
        let index = raw[2];
        let total = raw[3];
        let len = raw[4] as usize;

        let end = PACKET_HEADER_LEN + len;
        if end + PACKET_TRAILER_LEN > raw.len() {
            return Err(Error::Packet(format!(
                "declared payload of {len} bytes overruns the report"
            )));
        }

        let received_crc = u16::from_le_bytes([raw[end], raw[end + 1]]);
        let calculated_crc = TRANSFER_CRC.checksum(&raw[..end]);
        if received_crc != calculated_crc {
            debug!(
                "packet CRC mismatch: expected {calculated_crc:#06x}, got {received_crc:#06x}"
            );
            return Err(Error::Packet(format!(
                "packet CRC mismatch (expected {calculated_crc:#06x}, got {received_crc:#06x})"
            )));
        }

        if got_seq != seq {
            return Err(Error::Desync {
                sent: seq,
                got: got_seq,
            });
        }
        if index != expect_index {
            return Err(Error::Packet(format!(
                "packet index gap: expected {expect_index}, got {index}"
            )));
        }
        if index > total {
            return Err(Error::Packet(format!(
                "packet index {index} beyond declared total {total}"
            )));
        }

        Ok(InboundPacket {
            index,
            total,
            payload: raw[PACKET_HEADER_LEN..end].to_vec(),
        })
    }
}

/// Serialise a command message: code, body length, body, body CRC.
pub fn build_message(command: u16, body: &[u8]) -> Vec<u8> {
    let mut message = BytesMut::with_capacity(MESSAGE_OVERHEAD + body.len());
    message.put_u16_le(command);
    message.put_u16_le(body.len() as u16);
    message.put_slice(body);
    message.put_u16_le(TRANSFER_CRC.checksum(body));
    message.to_vec()
}

/// Parse a reassembled command message back into `(command, body)`.
pub fn parse_message(message: &[u8]) -> Result<(u16, Vec<u8>)> {
    if message.len() < MESSAGE_OVERHEAD {
        return Err(Error::Protocol(format!(
            "message of {} bytes is shorter than the {MESSAGE_OVERHEAD}-byte minimum",
            message.len()
        )));
    }

    let command = u16::from_le_bytes([message[0], message[1]]);
    let body_len = u16::from_le_bytes([message[2], message[3]]) as usize;
    if message.len() != MESSAGE_OVERHEAD + body_len {
        return Err(Error::Protocol(format!(
            "message length mismatch: header declares {body_len} body bytes, got {}",
            message.len() - MESSAGE_OVERHEAD
        )));
    }

    let body = &message[4..4 + body_len];
    let received_crc = u16::from_le_bytes([message[4 + body_len], message[5 + body_len]]);
    let calculated_crc = TRANSFER_CRC.checksum(body);
    if received_crc != calculated_crc {
        return Err(Error::Protocol(format!(
            "message CRC mismatch (expected {calculated_crc:#06x}, got {received_crc:#06x})"
        )));
    }

    Ok((command, body.to_vec()))
}

/// Run one strictly-paired request/reply exchange over the transport.
///
/// All request packets are written before the first read; replies arriving
/// out of sequence surface as packet errors. The caller decides whether the
/// command is retried.
pub fn exchange<T: Transport + ?Sized>(
    transport: &mut T,
    codec: &mut PacketCodec,
    pacing: &Pacing,
    command: u16,
    body: &[u8],
) -> Result<(u16, Vec<u8>)> {
    let seq = codec.next_seq();
    let packets = codec.encode_message(seq, command, body)?;
    debug!(
        command = format_args!("{command:#06x}"),
        seq,
        packets = packets.len(),
        "sending command"
    );
    for packet in &packets {
        transport.write_report(packet)?;
    }

    let mut message = Vec::new();
    let mut expect_index = 0u8;
    loop {
        let raw = transport.read_report(pacing.read_timeout)?;
        let packet = codec.parse_packet(&raw, seq, expect_index)?;
        message.extend_from_slice(&packet.payload);
        if packet.index == packet.total {
            break;
        }
        expect_index = expect_index.wrapping_add(1);
    }

    parse_message(&message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(codec: &PacketCodec, seq: u8, packets: &[Vec<u8>]) -> Result<(u16, Vec<u8>)> {
        let mut message = Vec::new();
        for (k, raw) in packets.iter().enumerate() {
            let packet = codec.parse_packet(raw, seq, k as u8)?;
            message.extend_from_slice(&packet.payload);
            if packet.index == packet.total {
                break;
            }
        }
        parse_message(&message)
    }

    #[test]
    fn round_trip_single_packet() {
        let mut codec = PacketCodec::new(64);
        let seq = codec.next_seq();
        let packets = codec.encode_message(seq, 0x0200, b"hello").unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), 64);

        let (command, body) = decode(&codec, seq, &packets).unwrap();
        assert_eq!(command, 0x0200);
        assert_eq!(body, b"hello");
    }

    #[test]
    fn round_trip_empty_body() {
        let mut codec = PacketCodec::new(64);
        let seq = codec.next_seq();
        let packets = codec.encode_message(seq, 0x8B01, &[]).unwrap();
        assert_eq!(packets.len(), 1);

        let (command, body) = decode(&codec, seq, &packets).unwrap();
        assert_eq!(command, 0x8B01);
        assert!(body.is_empty());
    }

    #[test]
    fn round_trip_multi_packet() {
        let mut codec = PacketCodec::new(64);
        let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let seq = codec.next_seq();
        let packets = codec.encode_message(seq, 0x0B17, &body).unwrap();
        assert!(packets.len() > 1);

        let (command, decoded) = decode(&codec, seq, &packets).unwrap();
        assert_eq!(command, 0x0B17);
        assert_eq!(decoded, body);
    }

    #[test]
    fn round_trip_at_capacity() {
        let mut codec = PacketCodec::new(64);
        let body: Vec<u8> = (0..codec.max_body_len()).map(|i| (i % 241) as u8).collect();
        let seq = codec.next_seq();
        let packets = codec.encode_message(seq, 0x0001, &body).unwrap();
        assert_eq!(packets.len(), 256);

        let (_, decoded) = decode(&codec, seq, &packets).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn body_over_capacity_rejected() {
        let mut codec = PacketCodec::new(64);
        let body = vec![0u8; codec.max_body_len() + 1];
        let seq = codec.next_seq();
        assert!(matches!(
            codec.encode_message(seq, 0x0001, &body),
            Err(Error::Usage(_))
        ));
    }

    #[test]
    fn every_packet_carries_a_valid_crc() {
        let mut codec = PacketCodec::new(64);
        let body: Vec<u8> = (0..500u32).map(|i| (i * 7 % 256) as u8).collect();
        let seq = codec.next_seq();
        for raw in codec.encode_message(seq, 0x0306, &body).unwrap() {
            let len = raw[4] as usize;
            let end = PACKET_HEADER_LEN + len;
            let trailer = u16::from_le_bytes([raw[end], raw[end + 1]]);
            assert_eq!(trailer, TRANSFER_CRC.checksum(&raw[..end]));
        }
    }

    #[test]
    fn corrupted_packet_crc_is_a_packet_error() {
        let mut codec = PacketCodec::new(64);
        let seq = codec.next_seq();
        let mut packets = codec.encode_message(seq, 0x0200, b"payload").unwrap();
        packets[0][6] ^= 0xFF;
        assert!(matches!(
            codec.parse_packet(&packets[0], seq, 0),
            Err(Error::Packet(_))
        ));
    }

    #[test]
    fn sequence_mismatch_is_a_desync() {
        let mut codec = PacketCodec::new(64);
        let seq = codec.next_seq();
        let packets = codec.encode_message(seq, 0x0200, b"x").unwrap();
        assert!(matches!(
            codec.parse_packet(&packets[0], seq.wrapping_add(1), 0),
            Err(Error::Desync { .. })
        ));
    }

    #[test]
    fn index_gap_is_a_packet_error() {
        let mut codec = PacketCodec::new(64);
        let body = vec![0xAB; 200];
        let seq = codec.next_seq();
        let packets = codec.encode_message(seq, 0x0200, &body).unwrap();
        assert!(packets.len() >= 3);
        // Skip packet 1: parsing packet 2 while expecting index 1 must fail.
        assert!(matches!(
            codec.parse_packet(&packets[2], seq, 1),
            Err(Error::Packet(_))
        ));
    }

    #[test]
    fn corrupted_message_crc_is_a_protocol_error() {
        let mut message = build_message(0x0200, b"body");
        let last = message.len() - 1;
        message[last] ^= 0x01;
        assert!(matches!(parse_message(&message), Err(Error::Protocol(_))));
    }

    #[test]
    fn sequence_counter_wraps() {
        let mut codec = PacketCodec::new(64);
        for _ in 0..=u8::MAX {
            codec.next_seq();
        }
        assert_eq!(codec.next_seq(), 0);
    }
}

//! IPv4, UDP and IPFIX message/set headers shared by template and data
//! frames.

use super::PacketBuilder;
use byteorder::{BigEndian, ByteOrder};
use delayprobe_config::ExporterConfig;
use std::net::Ipv4Addr;

pub const IPV4_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
pub const MESSAGE_HEADER_LEN: usize = 16;
pub const SET_HEADER_LEN: usize = 4;
pub const TEMPLATE_HEADER_LEN: usize = 4;
pub const FIELD_SPECIFIER_LEN: usize = 4;

/// Offset of the IPFIX message header within a frame.
pub const MESSAGE_OFFSET: usize = IPV4_HEADER_LEN + UDP_HEADER_LEN;
/// Offset of the first set within a frame.
pub const SET_OFFSET: usize = MESSAGE_OFFSET + MESSAGE_HEADER_LEN;

pub const IPFIX_VERSION: u16 = 10;
pub const TEMPLATE_SET_ID: u16 = 2;
const IP_TTL: u8 = 254;
const IP_PROTOCOL_UDP: u8 = 17;

const IP_TOTAL_LENGTH: usize = 2;
const IP_CHECKSUM: usize = 10;
const UDP_LENGTH: usize = IPV4_HEADER_LEN + 4;
const MESSAGE_LENGTH: usize = MESSAGE_OFFSET + 2;
const MESSAGE_EXPORT_TIME: usize = MESSAGE_OFFSET + 4;
const MESSAGE_SEQUENCE: usize = MESSAGE_OFFSET + 8;
const SET_LENGTH: usize = SET_OFFSET + 2;

/// Addressing for every frame of one exporter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transport {
    pub src_address: Ipv4Addr,
    pub dst_address: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub domain_id: u32,
}

impl From<&ExporterConfig> for Transport {
    fn from(config: &ExporterConfig) -> Self {
        Self {
            src_address: config.source_address,
            dst_address: config.collector_address,
            src_port: config.source_port,
            dst_port: config.collector_port,
            domain_id: config.domain_id,
        }
    }
}

/// Writes IPv4, UDP, message and set headers with placeholder lengths.
/// The set header is the first set in the frame.
pub fn write_headers(builder: &mut PacketBuilder, transport: &Transport, set_id: u16) {
    // IPv4
    builder.put_u8(0x45);
    builder.put_u8(0);
    builder.put_u16(0); // total length
    builder.put_u16(0); // identification
    builder.put_u16(0); // flags, fragment offset
    builder.put_u8(IP_TTL);
    builder.put_u8(IP_PROTOCOL_UDP);
    builder.put_u16(0); // checksum
    builder.put_bytes(&transport.src_address.octets());
    builder.put_bytes(&transport.dst_address.octets());

    // UDP, no checksum
    builder.put_u16(transport.src_port);
    builder.put_u16(transport.dst_port);
    builder.put_u16(0);
    builder.put_u16(0);

    // IPFIX message header
    builder.put_u16(IPFIX_VERSION);
    builder.put_u16(0); // length
    builder.put_u32(0); // export time
    builder.put_u32(0); // sequence
    builder.put_u32(transport.domain_id);

    // Set header
    builder.put_u16(set_id);
    builder.put_u16(0);
}

/// Backpatches every length field and the IPv4 checksum for a frame
/// holding a single set that runs to the end of the buffer.
pub fn patch_lengths(builder: &mut PacketBuilder) {
    let total = builder.len();
    builder.patch_u16(SET_LENGTH, (total - SET_OFFSET) as u16);
    builder.patch_u16(MESSAGE_LENGTH, (total - MESSAGE_OFFSET) as u16);
    builder.patch_u16(UDP_LENGTH, (total - IPV4_HEADER_LEN) as u16);
    builder.patch_u16(IP_TOTAL_LENGTH, total as u16);
    builder.patch_u16(IP_CHECKSUM, 0);
    let checksum = ipv4_checksum(&builder.as_slice()[..IPV4_HEADER_LEN]);
    builder.patch_u16(IP_CHECKSUM, checksum);
}

/// Writes the export time and sequence number into a finished frame.
/// Neither is covered by the IPv4 checksum, and the UDP checksum is unused.
pub fn stamp(frame: &mut [u8], export_time: u32, sequence: u32) {
    BigEndian::write_u32(&mut frame[MESSAGE_EXPORT_TIME..MESSAGE_EXPORT_TIME + 4], export_time);
    BigEndian::write_u32(&mut frame[MESSAGE_SEQUENCE..MESSAGE_SEQUENCE + 4], sequence);
}

/// RFC 1071 ones' complement sum over the header.
pub fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod test {
    use super::*;

    fn transport() -> Transport {
        Transport {
            src_address: Ipv4Addr::new(192, 0, 2, 1),
            dst_address: Ipv4Addr::new(192, 0, 2, 10),
            src_port: 4739,
            dst_port: 4739,
            domain_id: 7,
        }
    }

    #[test]
    fn header_checksum_verifies() {
        let mut builder = PacketBuilder::default();
        write_headers(&mut builder, &transport(), 300);
        builder.put_zeros(10);
        patch_lengths(&mut builder);
        let frame = builder.as_slice();
        // Summing a header that includes its checksum yields zero.
        assert_eq!(ipv4_checksum(&frame[..IPV4_HEADER_LEN]), 0);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]) as usize, frame.len());
        assert_eq!(frame[8], 254);
        assert_eq!(frame[9], 17);
    }

    #[test]
    fn known_checksum() {
        // Classic worked example.
        let header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        assert_eq!(ipv4_checksum(&header), 0xb861);
    }

    #[test]
    fn stamping_sets_time_and_sequence() {
        let mut builder = PacketBuilder::default();
        write_headers(&mut builder, &transport(), 2);
        patch_lengths(&mut builder);
        let mut frame = builder.into_vec();
        stamp(&mut frame, 1_700_000_000, 42);
        assert_eq!(BigEndian::read_u32(&frame[MESSAGE_EXPORT_TIME..]), 1_700_000_000);
        assert_eq!(BigEndian::read_u32(&frame[MESSAGE_SEQUENCE..]), 42);
        assert_eq!(BigEndian::read_u32(&frame[MESSAGE_OFFSET + 12..]), 7);
    }
}

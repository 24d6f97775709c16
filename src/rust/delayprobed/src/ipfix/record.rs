use super::field_types::{fields_for, record_length, SRH_FIELDS};
use super::parse::IpfixParseError;
use super::PacketBuilder;
use crate::flow_table::FlowEntry;
use crate::packet::SRH_MAX_SID_LIST;
use byteorder::{BigEndian, ByteOrder};
use delayprobe_config::FlowVariant;
use std::net::Ipv6Addr;

/// Appends one data record for `entry`, in its variant's template order.
/// Returns the number of bytes written.
pub fn encode_record(entry: &FlowEntry, out: &mut PacketBuilder) -> usize {
    let start = out.len();
    match entry.variant {
        FlowVariant::Srh => encode_srh(entry, out),
    }
    let written = out.len() - start;
    debug_assert_eq!(written, record_length(fields_for(entry.variant)));
    written
}

/// One data record for `entry` on its own.
pub fn encode(entry: &FlowEntry) -> Vec<u8> {
    let mut out = PacketBuilder::with_capacity(record_length(fields_for(entry.variant)));
    encode_record(entry, &mut out);
    out.into_vec()
}

fn encode_srh(entry: &FlowEntry, out: &mut PacketBuilder) {
    let srh = &entry.key.srh;
    out.put_bytes(&srh.sr_source.0);
    out.put_bytes(&srh.active_segment.0);
    out.put_u16(srh.endpoint_behavior);
    out.put_u8(srh.segments_left);
    out.put_u8(srh.flags);
    out.put_u16(srh.tag);
    for segment in srh.segment_list() {
        out.put_bytes(&segment.0);
    }
    out.put_zeros(16 * (SRH_MAX_SID_LIST - srh.segment_list().len()));
    out.put_bytes(&entry.key.src_address.ipv6_octets());
    out.put_bytes(&entry.key.dst_address.ipv6_octets());
    out.put_u64(entry.packets);
    out.put_u64(entry.octets);
}

/// An SRH data record read back from the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SrhRecord {
    pub sr_source: Ipv6Addr,
    pub active_segment: Ipv6Addr,
    pub endpoint_behavior: u16,
    pub segments_left: u8,
    pub flags: u8,
    pub tag: u16,
    /// Non-zero entries of the segment list
    pub segments: Vec<Ipv6Addr>,
    pub src_address: Ipv6Addr,
    pub dst_address: Ipv6Addr,
    pub packets: u64,
    pub octets: u64,
}

/// Decodes one record laid out as `SRH_FIELDS`.
pub fn decode_srh_record(bytes: &[u8]) -> Result<SrhRecord, IpfixParseError> {
    if bytes.len() < record_length(&SRH_FIELDS) {
        return Err(IpfixParseError::Truncated);
    }
    let address = |offset: usize| {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&bytes[offset..offset + 16]);
        Ipv6Addr::from(octets)
    };
    let list_start = 38;
    let list_end = list_start + 16 * SRH_MAX_SID_LIST;
    let segments = (list_start..list_end)
        .step_by(16)
        .map(&address)
        .filter(|segment| !segment.is_unspecified())
        .collect();
    Ok(SrhRecord {
        sr_source: address(0),
        active_segment: address(16),
        endpoint_behavior: BigEndian::read_u16(&bytes[32..34]),
        segments_left: bytes[34],
        flags: bytes[35],
        tag: BigEndian::read_u16(&bytes[36..38]),
        segments,
        src_address: address(list_end),
        dst_address: address(list_end + 16),
        packets: BigEndian::read_u64(&bytes[list_end + 32..list_end + 40]),
        octets: BigEndian::read_u64(&bytes[list_end + 40..list_end + 48]),
    })
}

//! What the classifier hands to a worker for each observed packet.

use delayprobe_config::FlowDirection;
use delayprobe_utils::{Ip46Address, MacAddress};
use std::net::Ipv6Addr;

/// Largest segment list carried in a record. Longer lists are truncated.
pub const SRH_MAX_SID_LIST: usize = 16;

/// Segment routing header fields of an SRv6 packet, plus the outer IPv6
/// addresses that carried it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SrhInfo {
    /// Outer IPv6 source
    pub sr_source: Ip46Address,
    /// Outer IPv6 destination, i.e. the active segment
    pub active_segment: Ip46Address,
    /// Endpoint behavior bound to the active segment
    pub endpoint_behavior: u16,
    pub segments_left: u8,
    pub flags: u8,
    pub tag: u16,
    /// Number of valid entries in `segments`
    pub segment_count: u8,
    pub segments: [Ip46Address; SRH_MAX_SID_LIST],
}

impl SrhInfo {
    /// Builds the SRH fields, keeping at most `SRH_MAX_SID_LIST` segments.
    pub fn new(
        sr_source: Ipv6Addr,
        active_segment: Ipv6Addr,
        segments: &[Ipv6Addr],
        segments_left: u8,
    ) -> Self {
        let mut info = Self {
            sr_source: sr_source.into(),
            active_segment: active_segment.into(),
            segments_left,
            ..Default::default()
        };
        for (slot, segment) in info.segments.iter_mut().zip(segments.iter()) {
            *slot = (*segment).into();
            info.segment_count += 1;
        }
        info
    }

    /// The valid part of the segment list. A count past the array end
    /// is clamped.
    pub fn segment_list(&self) -> &[Ip46Address] {
        let count = (self.segment_count as usize).min(SRH_MAX_SID_LIST);
        &self.segments[..count]
    }
}

/// One packet, as seen by the classifier.
#[derive(Clone, Debug, PartialEq)]
pub struct PacketMeta {
    /// `Rx` or `Tx`; the side of the interface the packet was seen on
    pub direction: FlowDirection,
    pub rx_sw_if_index: u32,
    pub tx_sw_if_index: u32,
    pub src_mac: MacAddress,
    pub dst_mac: MacAddress,
    pub src_address: Ip46Address,
    pub dst_address: Ip46Address,
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
    /// Present when the packet carried a segment routing header
    pub srh: Option<SrhInfo>,
    /// Octets counted for this packet
    pub length: u32,
}

impl PacketMeta {
    /// The interface whose feature setting decides whether this packet
    /// is tracked.
    pub fn observed_sw_if_index(&self) -> u32 {
        match self.direction {
            FlowDirection::Tx => self.tx_sw_if_index,
            _ => self.rx_sw_if_index,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_packets {
    use super::*;

    /// An SRv6 packet from `src` to `dst` leaving on interface 1.
    pub(crate) fn srv6_packet(src: &str, dst: &str, length: u32) -> PacketMeta {
        let segments: Vec<Ipv6Addr> = vec!["fc00::1".parse().unwrap(), "fc00::2".parse().unwrap()];
        PacketMeta {
            direction: FlowDirection::Tx,
            rx_sw_if_index: 0,
            tx_sw_if_index: 1,
            src_mac: MacAddress::new([2, 0, 0, 0, 0, 1]),
            dst_mac: MacAddress::new([2, 0, 0, 0, 0, 2]),
            src_address: Ip46Address::from_ip(src.parse().unwrap()),
            dst_address: Ip46Address::from_ip(dst.parse().unwrap()),
            protocol: 17,
            src_port: 5000,
            dst_port: 6000,
            srh: Some(SrhInfo::new(
                "2001:db8::a".parse().unwrap(),
                "fc00::2".parse().unwrap(),
                &segments,
                1,
            )),
            length,
        }
    }

    #[test]
    fn truncates_long_segment_lists() {
        let segments: Vec<Ipv6Addr> = (0..20u16)
            .map(|n| Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, n))
            .collect();
        let srh = SrhInfo::new(Ipv6Addr::LOCALHOST, Ipv6Addr::LOCALHOST, &segments, 3);
        assert_eq!(srh.segment_list().len(), SRH_MAX_SID_LIST);
        assert_eq!(srh.segment_list()[15], Ip46Address::from(segments[15]));
    }

    #[test]
    fn oversized_segment_count_is_clamped() {
        let srh = SrhInfo {
            segment_count: 20,
            ..Default::default()
        };
        assert_eq!(srh.segment_list().len(), SRH_MAX_SID_LIST);
        let mut packet = srv6_packet("2001:db8::1", "2001:db8::2", 100);
        packet.srh = Some(srh);
        let entry = crate::flow_table::FlowEntry::new(
            crate::flow_table::FlowKey::from_packet(&packet),
            delayprobe_config::FlowVariant::Srh,
            0,
        );
        assert_eq!(crate::ipfix::encode(&entry).len(), 342);
    }

    #[test]
    fn observed_interface_follows_direction() {
        let mut packet = srv6_packet("2001:db8::1", "2001:db8::2", 100);
        assert_eq!(packet.observed_sw_if_index(), 1);
        packet.direction = FlowDirection::Rx;
        assert_eq!(packet.observed_sw_if_index(), 0);
    }
}

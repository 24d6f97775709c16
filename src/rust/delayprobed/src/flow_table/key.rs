use crate::packet::{PacketMeta, SrhInfo};
use delayprobe_config::FlowDirection;
use delayprobe_utils::{Ip46Address, MacAddress};

/// Identifies a flow. Immutable once an entry is created; two live
/// entries in one table never share a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FlowKey {
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
    /// All zero when the packets carry no SRH
    pub srh: SrhInfo,
}

impl FlowKey {
    pub fn from_packet(packet: &PacketMeta) -> Self {
        Self {
            direction: packet.direction,
            rx_sw_if_index: packet.rx_sw_if_index,
            tx_sw_if_index: packet.tx_sw_if_index,
            src_mac: packet.src_mac,
            dst_mac: packet.dst_mac,
            src_address: packet.src_address,
            dst_address: packet.dst_address,
            protocol: packet.protocol,
            src_port: packet.src_port,
            dst_port: packet.dst_port,
            srh: packet.srh.unwrap_or_default(),
        }
    }

    /// Bucket hash. Only the low bits are used.
    pub fn bucket_hash(&self) -> u64 {
        fxhash::hash64(self)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::test_packets::srv6_packet;

    #[test]
    fn same_packet_fields_same_key() {
        let a = FlowKey::from_packet(&srv6_packet("2001:db8::1", "2001:db8::2", 100));
        let b = FlowKey::from_packet(&srv6_packet("2001:db8::1", "2001:db8::2", 1500));
        assert_eq!(a, b);
        assert_eq!(a.bucket_hash(), b.bucket_hash());
    }

    #[test]
    fn segments_left_is_part_of_the_key() {
        let packet = srv6_packet("2001:db8::1", "2001:db8::2", 100);
        let mut other = packet.clone();
        if let Some(srh) = other.srh.as_mut() {
            srh.segments_left = 0;
        }
        assert_ne!(FlowKey::from_packet(&packet), FlowKey::from_packet(&other));
    }

    #[test]
    fn missing_srh_is_zeroed() {
        let mut packet = srv6_packet("10.0.0.1", "10.0.0.2", 100);
        packet.srh = None;
        let key = FlowKey::from_packet(&packet);
        assert!(key.srh.sr_source.is_zero());
        assert_eq!(key.srh.segment_count, 0);
    }
}

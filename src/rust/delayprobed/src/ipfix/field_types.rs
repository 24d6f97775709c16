//! IANA information elements used by the templates.

use crate::packet::SRH_MAX_SID_LIST;
use delayprobe_config::FlowVariant;

pub const OCTET_DELTA_COUNT: u16 = 1;
pub const PACKET_DELTA_COUNT: u16 = 2;
pub const SOURCE_IPV6_ADDRESS: u16 = 27;
pub const DESTINATION_IPV6_ADDRESS: u16 = 28;
pub const SRH_FLAGS_IPV6: u16 = 492;
pub const SRH_TAG_IPV6: u16 = 493;
pub const SRH_ACTIVE_SEGMENT_IPV6: u16 = 495;
pub const SRH_SEGMENT_IPV6_BASIC_LIST: u16 = 496;
pub const SRH_SEGMENTS_IPV6_LEFT: u16 = 498;
pub const SRH_SEGMENT_ENDPOINT_BEHAVIOR: u16 = 502;

/// One (element id, length) pair in a template.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldSpecifier {
    pub element_id: u16,
    pub length: u16,
}

const fn field(element_id: u16, length: u16) -> FieldSpecifier {
    FieldSpecifier { element_id, length }
}

/// The SRv6 template. Records are written in exactly this order.
pub const SRH_FIELDS: [FieldSpecifier; 11] = [
    field(SOURCE_IPV6_ADDRESS, 16),
    field(SRH_ACTIVE_SEGMENT_IPV6, 16),
    field(SRH_SEGMENT_ENDPOINT_BEHAVIOR, 2),
    field(SRH_SEGMENTS_IPV6_LEFT, 1),
    field(SRH_FLAGS_IPV6, 1),
    field(SRH_TAG_IPV6, 2),
    field(SRH_SEGMENT_IPV6_BASIC_LIST, 16 * SRH_MAX_SID_LIST as u16),
    field(SOURCE_IPV6_ADDRESS, 16),
    field(DESTINATION_IPV6_ADDRESS, 16),
    field(PACKET_DELTA_COUNT, 8),
    field(OCTET_DELTA_COUNT, 8),
];

/// Field layout for a variant.
pub fn fields_for(variant: FlowVariant) -> &'static [FieldSpecifier] {
    match variant {
        FlowVariant::Srh => &SRH_FIELDS,
    }
}

/// Bytes in one data record for a layout.
pub fn record_length(fields: &[FieldSpecifier]) -> usize {
    fields.iter().map(|f| f.length as usize).sum()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn srh_record_is_342_bytes() {
        assert_eq!(record_length(fields_for(FlowVariant::Srh)), 342);
    }
}

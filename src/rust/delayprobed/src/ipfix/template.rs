use super::field_types::{fields_for, record_length, FieldSpecifier};
use super::headers::{
    patch_lengths, write_headers, Transport, FIELD_SPECIFIER_LEN, SET_HEADER_LEN, SET_OFFSET,
    TEMPLATE_HEADER_LEN, TEMPLATE_SET_ID,
};
use super::parse::{parse_message, IpfixParseError};
use super::PacketBuilder;
use byteorder::{BigEndian, ByteOrder};
use delayprobe_config::FlowVariant;

/// A built template: the ready-to-send datagram plus the sizes cached
/// with its registration.
#[derive(Clone, Debug)]
pub struct Template {
    pub variant: FlowVariant,
    pub template_id: u16,
    pub fields: &'static [FieldSpecifier],
    /// IPv4 + UDP + IPFIX template message. Export time and sequence
    /// are stamped on each send.
    pub frame: Vec<u8>,
    /// Bytes from the set header to the end of the last field specifier
    pub set_size: usize,
    /// Bytes in one data record
    pub record_len: usize,
}

/// Builds the template datagram for `variant`.
pub fn build_template(variant: FlowVariant, transport: &Transport, template_id: u16) -> Template {
    let fields = fields_for(variant);
    assert!(!fields.is_empty(), "template for {variant} has no fields");

    let mut builder = PacketBuilder::with_capacity(
        SET_OFFSET + SET_HEADER_LEN + TEMPLATE_HEADER_LEN + fields.len() * FIELD_SPECIFIER_LEN,
    );
    write_headers(&mut builder, transport, TEMPLATE_SET_ID);
    builder.put_u16(template_id);
    builder.put_u16(fields.len() as u16);
    for field in fields {
        builder.put_u16(field.element_id);
        builder.put_u16(field.length);
    }
    patch_lengths(&mut builder);

    let set_size = builder.len() - SET_OFFSET;
    Template {
        variant,
        template_id,
        fields,
        frame: builder.into_vec(),
        set_size,
        record_len: record_length(fields),
    }
}

/// A template read back from the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedTemplate {
    pub template_id: u16,
    pub fields: Vec<FieldSpecifier>,
    /// The set length declared in the set header
    pub set_length: usize,
}

/// Reads a template datagram (IPv4 + UDP + IPFIX) back into its
/// template id and field list.
pub fn parse_template(frame: &[u8]) -> Result<ParsedTemplate, IpfixParseError> {
    let message = parse_message(frame)?;
    let set = message
        .sets
        .iter()
        .find(|set| set.set_id == TEMPLATE_SET_ID)
        .ok_or(IpfixParseError::NoTemplateSet)?;
    let body = set.body;
    if body.len() < TEMPLATE_HEADER_LEN {
        return Err(IpfixParseError::Truncated);
    }
    let template_id = BigEndian::read_u16(&body[0..2]);
    let field_count = BigEndian::read_u16(&body[2..4]) as usize;
    let specifiers = &body[TEMPLATE_HEADER_LEN..];
    if specifiers.len() < field_count * FIELD_SPECIFIER_LEN {
        return Err(IpfixParseError::Truncated);
    }
    let fields = specifiers
        .chunks_exact(FIELD_SPECIFIER_LEN)
        .take(field_count)
        .map(|spec| FieldSpecifier {
            element_id: BigEndian::read_u16(&spec[0..2]),
            length: BigEndian::read_u16(&spec[2..4]),
        })
        .collect();
    Ok(ParsedTemplate {
        template_id,
        fields,
        set_length: set.length,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ipfix::field_types::SRH_FIELDS;
    use crate::ipfix::headers::{ipv4_checksum, IPV4_HEADER_LEN, MESSAGE_OFFSET};
    use std::net::Ipv4Addr;

    fn transport() -> Transport {
        Transport {
            src_address: Ipv4Addr::new(192, 0, 2, 1),
            dst_address: Ipv4Addr::new(192, 0, 2, 10),
            src_port: 4739,
            dst_port: 4739,
            domain_id: 1,
        }
    }

    #[test]
    fn template_round_trip() {
        let template = build_template(FlowVariant::Srh, &transport(), 256);
        let parsed = parse_template(&template.frame).unwrap();
        assert_eq!(parsed.template_id, 256);
        assert_eq!(parsed.fields, SRH_FIELDS.to_vec());
        assert_eq!(parsed.set_length, template.set_size);
        assert_eq!(template.set_size, template.frame.len() - SET_OFFSET);
    }

    #[test]
    fn sizes_are_cached() {
        let template = build_template(FlowVariant::Srh, &transport(), 300);
        assert_eq!(
            template.set_size,
            SET_HEADER_LEN + TEMPLATE_HEADER_LEN + SRH_FIELDS.len() * FIELD_SPECIFIER_LEN
        );
        assert_eq!(template.record_len, 342);
    }

    #[test]
    fn lengths_are_backpatched() {
        let template = build_template(FlowVariant::Srh, &transport(), 256);
        let frame = &template.frame;
        assert_eq!(BigEndian::read_u16(&frame[2..4]) as usize, frame.len());
        assert_eq!(ipv4_checksum(&frame[..IPV4_HEADER_LEN]), 0);
        assert_eq!(
            BigEndian::read_u16(&frame[MESSAGE_OFFSET + 2..]) as usize,
            frame.len() - MESSAGE_OFFSET
        );
        assert_eq!(BigEndian::read_u16(&frame[MESSAGE_OFFSET..]), 10);
    }
}

//! Reads frames built by this crate back into their parts.

use super::headers::{IPFIX_VERSION, MESSAGE_HEADER_LEN, MESSAGE_OFFSET, SET_HEADER_LEN};
use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedMessage<'a> {
    pub export_time: u32,
    pub sequence: u32,
    pub domain_id: u32,
    pub sets: Vec<ParsedSet<'a>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedSet<'a> {
    pub set_id: u16,
    /// Declared length, header included
    pub length: usize,
    /// Everything after the set header
    pub body: &'a [u8],
}

/// Splits an IPv4 + UDP + IPFIX frame into its message header and sets.
pub fn parse_message(frame: &[u8]) -> Result<ParsedMessage<'_>, IpfixParseError> {
    if frame.len() < MESSAGE_OFFSET + MESSAGE_HEADER_LEN {
        return Err(IpfixParseError::Truncated);
    }
    let message = &frame[MESSAGE_OFFSET..];
    let version = BigEndian::read_u16(&message[0..2]);
    if version != IPFIX_VERSION {
        return Err(IpfixParseError::BadVersion(version));
    }
    let length = BigEndian::read_u16(&message[2..4]) as usize;
    if length < MESSAGE_HEADER_LEN || length > message.len() {
        return Err(IpfixParseError::Truncated);
    }

    let mut sets = Vec::new();
    let mut rest = &message[MESSAGE_HEADER_LEN..length];
    while !rest.is_empty() {
        if rest.len() < SET_HEADER_LEN {
            return Err(IpfixParseError::Truncated);
        }
        let set_id = BigEndian::read_u16(&rest[0..2]);
        let set_length = BigEndian::read_u16(&rest[2..4]) as usize;
        if set_length < SET_HEADER_LEN || set_length > rest.len() {
            return Err(IpfixParseError::BadSetLength(set_length));
        }
        sets.push(ParsedSet {
            set_id,
            length: set_length,
            body: &rest[SET_HEADER_LEN..set_length],
        });
        rest = &rest[set_length..];
    }

    Ok(ParsedMessage {
        export_time: BigEndian::read_u32(&message[4..8]),
        sequence: BigEndian::read_u32(&message[8..12]),
        domain_id: BigEndian::read_u32(&message[12..16]),
        sets,
    })
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IpfixParseError {
    #[error("Frame is shorter than its headers declare")]
    Truncated,
    #[error("Unexpected IPFIX version {0}")]
    BadVersion(u16),
    #[error("Set length {0} is out of bounds")]
    BadSetLength(usize),
    #[error("Frame holds no template set")]
    NoTemplateSet,
}

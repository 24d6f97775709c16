//! IPFIX (RFC 7011) template and data record encoding, carried over
//! IPv4/UDP.

pub mod field_types;
pub mod headers;
mod packet_builder;
mod parse;
mod record;
mod template;

pub use headers::Transport;
pub use packet_builder::PacketBuilder;
pub use parse::{parse_message, IpfixParseError, ParsedMessage, ParsedSet};
pub use record::{decode_srh_record, encode, encode_record, SrhRecord};
pub use template::{build_template, parse_template, ParsedTemplate, Template};

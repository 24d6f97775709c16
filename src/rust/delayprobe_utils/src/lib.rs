//! Collection of utility functions for delayprobe

#![warn(missing_docs)]

/// Provides a Linux file-descriptor based timing service.
pub mod fdtimer;

/// Utilities dealing with Unix Timestamps
pub mod unix_time;

mod ip46_address;
mod mac_address;

/// IPv4-or-IPv6 address stored in a fixed 16 byte block
pub use ip46_address::Ip46Address;

/// 48-bit Ethernet address
pub use mac_address::{MacAddress, MacParseError};

use delayprobe_config::{FlowDirection, FlowVariant, RecordFlags};
use delayprobe_utils::{Ip46Address, MacAddress};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A `BusResponse` object represents a single
/// reply generated from a `BusRequest`, and batched
/// inside a `BusReply`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum BusResponse {
    /// Yes, we're alive
    Ack,

    /// The request was understood but refused.
    Error(ApiError),

    /// Something went wrong outside the control API (e.g. decoding).
    Fail(String),

    /// Current global parameters
    Params(ProbeParams),

    /// Interfaces with the feature enabled
    InterfaceDetails(Vec<InterfaceDetail>),

    /// Live flow entries
    FlowTable(Vec<FlowEntrySummary>),

    /// Table sizing and counters
    Statistics(TableStatistics),
}

/// Discrete error codes returned by the control API. No state changes
/// when one of these is returned.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub enum ApiError {
    /// Parameters have not been set, so the feature cannot be toggled.
    CannotEnableDisableFeature,
    /// The interface already has this (or another) variant enabled.
    EntryAlreadyExists,
    /// The interface has nothing enabled.
    NoSuchEntry,
    /// A parameter was out of range.
    InvalidValue,
    /// The interface index is outside the configured limit.
    InvalidSwIfIndex,
    /// The operation isn't supported in the current state.
    Unsupported,
}

impl ApiError {
    /// Numeric code, negative like the forwarding engine's return values.
    pub fn code(&self) -> i32 {
        match self {
            ApiError::InvalidValue => -1,
            ApiError::InvalidSwIfIndex => -2,
            ApiError::NoSuchEntry => -3,
            ApiError::EntryAlreadyExists => -4,
            ApiError::Unsupported => -5,
            ApiError::CannotEnableDisableFeature => -6,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ApiError::CannotEnableDisableFeature => "flow parameters are not set",
            ApiError::EntryAlreadyExists => "feature already enabled on this interface",
            ApiError::NoSuchEntry => "feature not enabled on this interface",
            ApiError::InvalidValue => "invalid value",
            ApiError::InvalidSwIfIndex => "invalid interface index",
            ApiError::Unsupported => "unsupported while the feature is enabled",
        };
        write!(f, "{text} ({})", self.code())
    }
}

/// The global flow parameters, with defaults resolved.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ProbeParams {
    /// Record layers
    pub record_flags: RecordFlags,
    /// Active timer, seconds. 0 means stateless.
    pub active_timer: u32,
    /// Passive timer, seconds.
    pub passive_timer: u32,
}

/// An interface with the feature enabled.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct InterfaceDetail {
    /// Interface index
    pub sw_if_index: u32,
    /// Enabled variant
    pub which: FlowVariant,
    /// Observed direction
    pub direction: FlowDirection,
}

/// A summary of one live flow entry.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FlowEntrySummary {
    /// Owning worker
    pub worker: usize,
    /// Pool slot within the worker
    pub index: u32,
    /// Variant the entry is exported with
    pub which: FlowVariant,
    /// Packet direction
    pub direction: FlowDirection,
    /// Ingress interface
    pub rx_sw_if_index: u32,
    /// Egress interface
    pub tx_sw_if_index: u32,
    /// Ethernet source
    pub src_mac: MacAddress,
    /// Ethernet destination
    pub dst_mac: MacAddress,
    /// Flow source
    pub src_address: Ip46Address,
    /// Flow destination
    pub dst_address: Ip46Address,
    /// IP protocol
    pub protocol: u8,
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// Outer IPv6 source of the SRH-carrying packet
    pub sr_source: Ip46Address,
    /// Active segment (outer IPv6 destination)
    pub active_segment: Ip46Address,
    /// SRH segments left
    pub segments_left: u8,
    /// Packets since the last export
    pub packets: u64,
    /// Bytes since the last export
    pub octets: u64,
    /// Seconds since the entry was created
    pub age_seconds: u64,
    /// Seconds since the entry last saw a packet
    pub idle_seconds: u64,
}

/// Counters for one worker.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WorkerStatistics {
    /// Worker number
    pub worker: usize,
    /// Live entries in the pool
    pub entries: usize,
    /// `entries` as a percentage of the pool capacity
    pub utilisation_percent: f64,
    /// New flows dropped because the pool was full
    pub table_full_drops: u64,
    /// Packet batches dropped because the ingress channel was full
    pub ingress_drops: u64,
    /// Data records written into frames
    pub records_exported: u64,
    /// Data frames handed to the sink
    pub frames_sent: u64,
}

/// Reply to `ShowStatistics`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TableStatistics {
    /// Is per-worker state allocated?
    pub initialized: bool,
    /// Is the table tracking flows (active timer > 0)?
    pub stateful: bool,
    /// Size in memory of one flow entry
    pub entry_size_bytes: usize,
    /// Pool capacity of each worker
    pub pool_capacity: usize,
    /// Per-worker counters
    pub workers: Vec<WorkerStatistics>,
}

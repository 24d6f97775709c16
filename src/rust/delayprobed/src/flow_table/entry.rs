use super::FlowKey;
use crate::timer_wheel::TimerHandle;
use delayprobe_config::FlowVariant;

/// Index of an entry in a worker's pool.
pub type EntryIndex = u32;

/// Per-flow state. Owned by the worker whose table created it.
#[derive(Clone, Debug)]
pub struct FlowEntry {
    pub key: FlowKey,
    /// Template the entry is exported with
    pub variant: FlowVariant,
    /// Packets since the last export
    pub packets: u64,
    /// Octets since the last export
    pub octets: u64,
    /// Timestamps are nanoseconds since boot
    pub created_ns: u64,
    pub last_seen_ns: u64,
    pub last_exported_ns: u64,
    pub active_timer: Option<TimerHandle>,
    pub passive_timer: Option<TimerHandle>,
    /// Next entry in the same hash bucket
    pub(super) next: Option<EntryIndex>,
}

impl FlowEntry {
    pub fn new(key: FlowKey, variant: FlowVariant, now_ns: u64) -> Self {
        Self {
            key,
            variant,
            packets: 0,
            octets: 0,
            created_ns: now_ns,
            last_seen_ns: now_ns,
            last_exported_ns: now_ns,
            active_timer: None,
            passive_timer: None,
            next: None,
        }
    }

    /// Count one packet.
    pub fn update(&mut self, octets: u32, now_ns: u64) {
        self.packets += 1;
        self.octets += u64::from(octets);
        self.last_seen_ns = now_ns;
    }

    /// Start a new reporting interval after an export.
    pub fn reset_counters(&mut self, now_ns: u64) {
        self.packets = 0;
        self.octets = 0;
        self.last_exported_ns = now_ns;
    }
}

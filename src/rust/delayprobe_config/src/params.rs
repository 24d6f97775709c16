//! Flow-probe parameters: record flags, timers, variants and directions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Active timer used when none is given, in seconds.
pub const DEFAULT_ACTIVE_TIMER: u32 = 15;

/// Passive timer used when none is given, in seconds.
pub const DEFAULT_PASSIVE_TIMER: u32 = 120;

/// Which record layers are exported. Only L3 is implemented.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordFlags(pub u8);

impl RecordFlags {
    /// Layer 2 fields (not implemented)
    pub const L2: RecordFlags = RecordFlags(1 << 0);
    /// Layer 3 fields
    pub const L3: RecordFlags = RecordFlags(1 << 1);
    /// Layer 4 fields (not implemented)
    pub const L4: RecordFlags = RecordFlags(1 << 2);

    /// No fields selected; the probe is unconfigured.
    pub const fn empty() -> Self {
        RecordFlags(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, other: RecordFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Parse a list of layer names ("l2", "l3", "l4").
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Option<Self> {
        let mut flags = 0;
        for name in names {
            flags |= match name.as_ref().to_lowercase().as_str() {
                "l2" => Self::L2.0,
                "l3" => Self::L3.0,
                "l4" => Self::L4.0,
                _ => return None,
            };
        }
        Some(RecordFlags(flags))
    }
}

impl fmt::Display for RecordFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::L2) {
            names.push("l2");
        }
        if self.contains(Self::L3) {
            names.push("l3");
        }
        if self.contains(Self::L4) {
            names.push("l4");
        }
        write!(f, "{}", names.join(" "))
    }
}

/// A flow variant selects which packets are observed and which
/// template their records use.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowVariant {
    /// IPv6 packets carrying a segment routing header
    Srh,
}

impl FlowVariant {
    /// Every variant, in index order.
    pub const ALL: [FlowVariant; 1] = [FlowVariant::Srh];

    /// Number of variants; sizes the per-variant arrays.
    pub const COUNT: usize = Self::ALL.len();

    /// Dense index for per-variant arrays.
    pub const fn index(self) -> usize {
        match self {
            FlowVariant::Srh => 0,
        }
    }
}

impl fmt::Display for FlowVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowVariant::Srh => write!(f, "srh"),
        }
    }
}

impl FromStr for FlowVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "srh" => Ok(FlowVariant::Srh),
            _ => Err(format!("Unknown flow variant: {s}")),
        }
    }
}

/// Which side of an interface is observed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowDirection {
    Rx,
    Tx,
    Both,
}

impl FlowDirection {
    /// Does a feature configured with `self` observe packets seen in `packet_direction`?
    pub fn covers(self, packet_direction: FlowDirection) -> bool {
        self == FlowDirection::Both || self == packet_direction
    }
}

impl fmt::Display for FlowDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowDirection::Rx => write!(f, "rx"),
            FlowDirection::Tx => write!(f, "tx"),
            FlowDirection::Both => write!(f, "rx tx"),
        }
    }
}

impl FromStr for FlowDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rx" => Ok(FlowDirection::Rx),
            "tx" => Ok(FlowDirection::Tx),
            "both" => Ok(FlowDirection::Both),
            _ => Err(format!("Invalid value of direction: {s}")),
        }
    }
}

/// `[params]` section: applied at startup as if issued on the bus.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ParamsConfig {
    /// Record layers, e.g. `["l3"]`
    pub record: Vec<String>,

    /// Active timer in seconds. Omitted selects the default, 0 disables
    /// stateful tracking.
    pub active_timer: Option<u32>,

    /// Passive timer in seconds. Omitted selects the default.
    pub passive_timer: Option<u32>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn record_flags_from_names() {
        let flags = RecordFlags::from_names(&["l3"]).unwrap();
        assert_eq!(flags, RecordFlags::L3);
        assert!(flags.contains(RecordFlags::L3));
        assert!(!flags.contains(RecordFlags::L2));
        assert!(RecordFlags::from_names(&["l7"]).is_none());
        assert_eq!(flags.to_string(), "l3");
    }

    #[test]
    fn direction_coverage() {
        assert!(FlowDirection::Both.covers(FlowDirection::Rx));
        assert!(FlowDirection::Both.covers(FlowDirection::Tx));
        assert!(FlowDirection::Rx.covers(FlowDirection::Rx));
        assert!(!FlowDirection::Rx.covers(FlowDirection::Tx));
    }

    #[test]
    fn parse_direction() {
        assert_eq!("TX".parse::<FlowDirection>().unwrap(), FlowDirection::Tx);
        assert!("sideways".parse::<FlowDirection>().is_err());
    }
}

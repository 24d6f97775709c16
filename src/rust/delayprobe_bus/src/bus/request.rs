use delayprobe_config::{FlowDirection, FlowVariant, RecordFlags};
use serde::{Deserialize, Serialize};

/// One or more `BusRequest` objects must be included in a `BusSession`
/// request. Each `BusRequest` represents a single request for action
/// or data.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum BusRequest {
    /// A generic "is it alive?" test. Returns an `Ack`.
    Ping,

    /// Enable or disable flow tracking on an interface.
    InterfaceAddDel {
        /// Interface index in the forwarding engine
        sw_if_index: u32,
        /// Which flow variant (and therefore template) to use
        which: FlowVariant,
        /// Which side of the interface to observe
        direction: FlowDirection,
        /// `true` to enable, `false` to disable
        is_add: bool,
    },

    /// Set the global flow parameters. Only allowed while no interface
    /// has the feature enabled.
    SetParams {
        /// Record layers to export
        record_flags: RecordFlags,
        /// Active timer in seconds. `None` selects the default, `Some(0)`
        /// disables stateful tracking.
        active_timer: Option<u32>,
        /// Passive timer in seconds. `None` selects the default.
        passive_timer: Option<u32>,
    },

    /// Retrieve the global flow parameters.
    GetParams,

    /// List interfaces with the feature enabled. `None` lists them all.
    InterfaceDump {
        /// Restrict the listing to one interface
        sw_if_index: Option<u32>,
    },

    /// One summary per live flow entry, across all workers.
    ShowTable,

    /// Table sizing, utilisation and drop counters.
    ShowStatistics,
}

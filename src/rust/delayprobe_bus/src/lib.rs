//! The `delayprobe_bus` crate is the control channel between the
//! `delayprobe` command-line tool (or any other local client) and the
//! `delayprobed` daemon.
//!
//! A session opens a unix socket, exchanges a 4-byte magic handshake,
//! then sends a `BusSession` (serialized with CBOR) holding one or more
//! `BusRequest` objects. Payloads are framed with a header and chunked
//! into length-prefixed blocks for transport. Replies come back in one
//! `BusReply`, containing a `BusResponse` per request, in request order.

#![deny(clippy::unwrap_used)]
#![warn(missing_docs)]
mod bus;

pub use bus::{
    bus_request, bus_request_at, ApiError, BusClientError, BusReply, BusRequest, BusResponse,
    BusSession, FlowEntrySummary, InterfaceDetail, ProbeParams, RequestHandler, TableStatistics,
    UnixSocketServer, UnixSocketServerError, WorkerStatistics, BUS_SOCKET_DIRECTORY,
    BUS_SOCKET_PATH,
};

/// Re-export the parameter types carried inside requests.
pub use delayprobe_config::{FlowDirection, FlowVariant, RecordFlags};

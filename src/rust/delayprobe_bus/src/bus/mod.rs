mod client;
mod protocol;
mod reply;
mod request;
mod response;
mod session;
mod unix_socket_server;
pub use client::{bus_request, bus_request_at, BusClientError};
pub use reply::BusReply;
pub use request::BusRequest;
pub use response::{
    ApiError, BusResponse, FlowEntrySummary, InterfaceDetail, ProbeParams, TableStatistics,
    WorkerStatistics,
};
pub use session::BusSession;
pub use unix_socket_server::{RequestHandler, UnixSocketServer, UnixSocketServerError};

/// Directory holding the daemon's control socket.
pub const BUS_SOCKET_DIRECTORY: &str = "/run/delayprobe";

/// The path to which `delayprobed` binds itself when listening for
/// local bus requests.
pub const BUS_SOCKET_PATH: &str = "/run/delayprobe/bus";

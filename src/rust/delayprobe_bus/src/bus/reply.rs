use crate::BusResponse;
use serde::{Deserialize, Serialize};

/// A single reply, always generated in response to a `BusSession` request.
/// Contains one `BusResponse` per request, in the order the requests
/// were made.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BusReply {
    /// A list of `BusResponse` objects generated in response to the
    /// requests that started the session.
    pub responses: Vec<BusResponse>,
}

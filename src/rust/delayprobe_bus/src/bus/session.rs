use crate::BusRequest;
use serde::{Deserialize, Serialize};

/// `BusSession` represents a complete session with `delayprobed`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BusSession {
    /// A list of requests to include in this session.
    pub requests: Vec<BusRequest>,
}

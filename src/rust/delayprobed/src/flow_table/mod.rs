//! Per-worker flow table: fixed-capacity hash buckets over an entry pool.

mod entry;
mod key;
mod table;
pub use entry::{EntryIndex, FlowEntry};
pub use key::FlowKey;
pub use table::{FlowTable, FlowTableError};

//! Contract between the query core and whatever moves bytes to AFLUX.

use serde_json::{Map, Value};

use crate::compiler::PageRequest;
use crate::error::TransportError;

/// One entry as returned by the remote service, keyed by AFLUX keyword.
pub type RawRecord = Map<String, Value>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPage {
    pub records: Vec<RawRecord>,
    /// Token for the following page; `None` on the last page.
    pub next_cursor: Option<String>,
    /// Number of records matching the query, when the service reports it.
    pub total_matches: Option<u64>,
}

/// Source of connections. One connection is held per running query and is
/// dropped as soon as the query is exhausted, fails or is cancelled.
pub trait Transport {
    type Connection: Connection;

    fn connect(&self) -> Result<Self::Connection, TransportError>;
}

pub trait Connection {
    fn send(&mut self, request: &PageRequest<'_>) -> Result<RawPage, TransportError>;
}

use std::time::Duration;

use bytes::Bytes;
use cassandra_cql::ColumnType;

pub mod batch;
pub mod prepared;

pub use cassandra_cql::{Consistency, SerialConsistency};

/// Per-call options of `execute`, `execute_prepared` and batches.
///
/// Every unset option falls back to the client defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub consistency: Option<Consistency>,
    pub serial_consistency: Option<SerialConsistency>,
    pub trace: Option<bool>,
    pub timeout: Option<Duration>,
    /// Matched to values by position. Ignored for prepared statements, which
    /// use the types the server reported.
    pub type_hints: Vec<Option<ColumnType>>,
    pub page_size: Option<i32>,
    pub paging_state: Option<Bytes>,
    pub timestamp: Option<i64>,
    /// Whether the request can be applied again without changing its effect.
    /// Passed on to the retry policy.
    pub is_idempotent: bool,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = Some(consistency);
        self
    }

    pub fn serial_consistency(mut self, serial_consistency: SerialConsistency) -> Self {
        self.serial_consistency = Some(serial_consistency);
        self
    }

    pub fn trace(mut self, trace: bool) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn type_hints(mut self, type_hints: Vec<Option<ColumnType>>) -> Self {
        self.type_hints = type_hints;
        self
    }

    pub fn page_size(mut self, page_size: i32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn paging_state(mut self, paging_state: Bytes) -> Self {
        self.paging_state = Some(paging_state);
        self
    }

    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn idempotent(mut self, is_idempotent: bool) -> Self {
        self.is_idempotent = is_idempotent;
        self
    }

    /// Options of `self`, with the unset ones taken from `defaults`.
    #[must_use]
    pub fn merged_over(&self, defaults: &ExecuteOptions) -> ExecuteOptions {
        ExecuteOptions {
            consistency: self.consistency.or(defaults.consistency),
            serial_consistency: self.serial_consistency.or(defaults.serial_consistency),
            trace: self.trace.or(defaults.trace),
            timeout: self.timeout.or(defaults.timeout),
            type_hints: if self.type_hints.is_empty() {
                defaults.type_hints.clone()
            } else {
                self.type_hints.clone()
            },
            page_size: self.page_size.or(defaults.page_size),
            paging_state: self
                .paging_state
                .clone()
                .or_else(|| defaults.paging_state.clone()),
            timestamp: self.timestamp.or(defaults.timestamp),
            is_idempotent: self.is_idempotent || defaults.is_idempotent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_time_options_win() {
        let defaults = ExecuteOptions::new()
            .consistency(Consistency::One)
            .trace(true)
            .timeout(Duration::from_secs(3));
        let call = ExecuteOptions::new()
            .consistency(Consistency::All)
            .timestamp(42);

        let merged = call.merged_over(&defaults);
        assert_eq!(merged.consistency, Some(Consistency::All));
        assert_eq!(merged.trace, Some(true));
        assert_eq!(merged.timeout, Some(Duration::from_secs(3)));
        assert_eq!(merged.timestamp, Some(42));
        assert_eq!(merged.serial_consistency, None);
    }
}

//! Broadcast filter chains for selective broadcasts.
//!
//! Filters run in registration order; the first `false` drops the
//! publication.

use std::collections::HashMap;
use std::sync::Arc;

/// One filter for a selective broadcast.
///
/// Receives the fired payload and the filter parameters captured at
/// subscription time.
pub trait BroadcastFilter: Send + Sync {
    fn filter(
        &self,
        payload: &serde_json::Value,
        filter_parameters: &HashMap<String, String>,
    ) -> bool;
}

/// Registration-ordered, short-circuiting chain of filters.
#[derive(Clone, Default)]
pub struct BroadcastFilterChain {
    filters: Vec<Arc<dyn BroadcastFilter>>,
}

impl std::fmt::Debug for BroadcastFilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastFilterChain")
            .field("len", &self.filters.len())
            .finish()
    }
}

impl BroadcastFilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filter: Arc<dyn BroadcastFilter>) {
        self.filters.push(filter);
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// `true` iff every filter accepts; evaluation stops at the first reject.
    pub fn passes(
        &self,
        payload: &serde_json::Value,
        filter_parameters: &HashMap<String, String>,
    ) -> bool {
        self.filters
            .iter()
            .all(|filter| filter.filter(payload, filter_parameters))
    }
}

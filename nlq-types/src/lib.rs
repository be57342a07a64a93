use std::time::{Duration, Instant};

use uuid::Uuid;

pub mod knowledge;
pub use knowledge::*;

pub mod query;
pub use query::*;

/// Request-scoped handle threaded through retrieval, generation and execution.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub request_id: Uuid,
    /// Absolute point after which every pending stage is abandoned.
    pub deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            deadline: None,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

//! Shared application state for the query API.

use std::sync::Arc;
use std::time::Duration;

use ember_core::Pipeline;

/// State shared by every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The running collector pipeline.
    pub pipeline: Arc<Pipeline>,
    /// Upper bound on one emission query, store reads included.
    pub query_deadline: Duration,
}

impl AppState {
    /// Wrap a pipeline. The query deadline is twice the pipeline's request
    /// timeout, so bounded store reads degrade before the deadline fires.
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        let query_deadline = pipeline.request_timeout().saturating_mul(2);
        Self {
            pipeline,
            query_deadline,
        }
    }
}

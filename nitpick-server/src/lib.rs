pub mod analysis;
pub mod config;
pub mod github;
pub mod ingress;
pub mod queue;
pub mod registry;
pub mod session;
pub mod store;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_util;

use std::sync::Arc;

use crate::queue::JobQueue;

/// Shared state for the HTTP layer.
///
/// The ingress endpoint is stateless apart from the webhook secret and the
/// queue client; everything the worker needs lives in
/// [`worker::WorkerContext`] instead.
pub struct AppState {
    /// Absent when `GITHUB_WEBHOOK_SECRET` is not configured. Deliveries are
    /// then rejected per-request with `MISSING_WEBHOOK_SECRET` and the health
    /// endpoint reports unhealthy; the process itself keeps running.
    pub webhook_secret: Option<String>,
    pub queue: Arc<dyn JobQueue>,
}

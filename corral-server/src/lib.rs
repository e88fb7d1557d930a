//! The corral coordinator.
//!
//! The coordinator sits between the code host and a pool of worker machines.
//! On the code-host side it receives pull-request webhooks and posts commit
//! statuses; on the worker side it answers pings, hands out assignments over
//! long polls, and accepts run-status reports. The data model lives in the
//! assignment store ([`store::Store`]); everything held in memory (the
//! worker-state cache, the live-output rendezvous) is a latency cache
//! rebuilt from the store on every wake-up.

pub mod config;
pub mod github;
pub mod hub;
pub mod intake;
pub mod live;
pub mod report;
pub mod state;
pub mod store;
pub mod ui;
pub mod webhook;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use corral_core::{Job, Status};
use tracing::error;

use crate::config::Config;
use crate::github::GitHubClient;
use crate::live::LiveHub;
use crate::state::StateCache;
use crate::store::Store;

/// Ceiling for every long poll; kept under the 30 s timeout a fronting
/// proxy typically applies.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(25);

/// A worker that has not pinged for this long is considered dead.
pub const WORKER_TTL: Duration = Duration::from_secs(5);

/// How often the garbage collector scans for dead workers.
pub const GC_INTERVAL: Duration = Duration::from_secs(2);

/// How long a live view waits for the worker to deliver its output stream.
pub const RENDEZVOUS_TIMEOUT: Duration = Duration::from_millis(500);

pub struct AppState {
    pub config: Config,
    pub store: Store,
    pub cache: StateCache,
    pub live: LiveHub,
    pub github: GitHubClient,
    /// Plain client for fetching archived output on the result page.
    pub http: reqwest::Client,
}

impl AppState {
    /// Absolute URL under this coordinator's public base URL.
    pub fn self_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Post a pending commit status for a job, pointing at its live view.
    pub async fn post_pending_status(&self, job: &Job, desc: &str) -> anyhow::Result<()> {
        let url = self.self_url(&format!("live/{job}"));
        self.github.post_status(job, Status::Pending, desc, &url).await
    }
}

/// Handler errors are logged and surfaced as HTTP 500; the caller retries.
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("responding http status 500: {:#}", self.0);
        (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        AppError(err.into())
    }
}

/// Spawn-and-forget a pending status post, logging any failure. Used where
/// the original operation must not wait on the code host.
pub fn post_pending_status_bg(state: Arc<AppState>, job: Job, desc: &'static str) {
    tokio::spawn(async move {
        if let Err(e) = state.post_pending_status(&job, desc).await {
            error!("posting pending status for {job}: {e:#}");
        }
    });
}

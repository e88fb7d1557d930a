//! Worker-facing control endpoints: ping, long poll, run status, and the
//! live-output poll and upload. All of them are idempotent and safe for the
//! worker to retry.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;

use corral_core::wire::{LivePollReq, PingReq, RunStatusReq, WorkerState};
use corral_core::{Job, Status};

use crate::{AppError, AppState, WAIT_TIMEOUT};

pub async fn box_ping(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PingReq>,
) -> Result<StatusCode, AppError> {
    state.store.ping_worker(req.id, req.host).await?;
    Ok(StatusCode::OK)
}

/// Answer with the worker's current assignment as soon as it differs from
/// the one presented; after the ceiling, answer 202 with the unchanged
/// state so the worker simply re-polls.
pub async fn box_longpoll(
    State(state): State<Arc<AppState>>,
    Json(old): Json<WorkerState>,
) -> Response {
    let (new, changed) = state.cache.wait_for_change(&old, WAIT_TIMEOUT).await;
    let code = if changed {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    (code, Json(new)).into_response()
}

pub async fn box_runstatus(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RunStatusReq>,
) -> Result<StatusCode, AppError> {
    match req.status {
        Status::Pending => state.post_pending_status(&req.job, &req.desc).await?,
        terminal => {
            // Idempotent: a duplicate or late report deletes zero job rows
            // and inserts nothing.
            state
                .store
                .mark_done(
                    req.job,
                    terminal,
                    req.desc,
                    req.url,
                    req.trace_url,
                    req.elapsed_ms as i64,
                )
                .await?;
        }
    }
    Ok(StatusCode::OK)
}

/// Worker long-poll for reader interest in its live output.
pub async fn box_livepoll(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LivePollReq>,
) -> Json<Option<Job>> {
    Json(state.live.poll(&req.id, WAIT_TIMEOUT).await)
}

/// Worker upload of live output. The body is pumped to the waiting reader;
/// if none is waiting the upload is read off and discarded, and the reader
/// will ask again.
pub async fn box_livesend(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Body,
) -> StatusCode {
    let id = header_str(&headers, "box-id");
    let job = Job {
        sha: header_str(&headers, "job-sha"),
        dir: header_str(&headers, "job-dir"),
        name: header_str(&headers, "job-name"),
    };

    let Some(tx) = state.live.send(&id, &job) else {
        return StatusCode::OK;
    };
    let mut frames = body.into_data_stream();
    while let Some(frame) = frames.next().await {
        match frame {
            // a failed send means the reader closed the stream
            Ok(bytes) => {
                if tx.send(bytes).await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    StatusCode::OK
}

fn header_str(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

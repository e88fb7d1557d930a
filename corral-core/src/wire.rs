//! Request and response bodies for the worker control endpoints.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::Job;

/// Commit-status states understood by the code host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Error,
    Failure,
    Pending,
    Success,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Error => "error",
            Status::Failure => "failure",
            Status::Pending => "pending",
            Status::Success => "success",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown status state: {0}")]
pub struct UnknownStatus(String);

impl FromStr for Status {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(Status::Error),
            "failure" => Ok(Status::Failure),
            "pending" => Ok(Status::Pending),
            "success" => Ok(Status::Success),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// `POST /box-ping`: a worker announcing it is (still) alive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingReq {
    pub id: String,
    pub host: String,
}

/// A worker's view of its current assignment, echoed through
/// `POST /box-longpoll`. No job means the worker is idle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerState {
    pub id: String,
    #[serde(default)]
    pub job: Option<Job>,
}

impl WorkerState {
    pub fn empty(id: impl Into<String>) -> Self {
        WorkerState {
            id: id.into(),
            job: None,
        }
    }
}

/// `POST /box-runstatus`: progress or completion of an assigned job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatusReq {
    pub job: Job,
    pub status: Status,
    pub desc: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub trace_url: String,
    #[serde(default)]
    pub elapsed_ms: u64,
}

/// `POST /box-livepoll`: a worker asking whether a browser wants live output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivePollReq {
    pub id: String,
}

/// `POST /retry`: re-queue the job recorded by a result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryReq {
    pub result_id: i64,
}

/// `POST /cancel`: operator cancellation of a queued or running job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelReq {
    pub job: Job,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for s in [Status::Error, Status::Failure, Status::Pending, Status::Success] {
            assert_eq!(s.as_str().parse::<Status>().unwrap(), s);
        }
        assert!("bogus".parse::<Status>().is_err());
    }

    #[test]
    fn worker_state_defaults_to_no_job() {
        let s: WorkerState = serde_json::from_str(r#"{"id":"w1"}"#).unwrap();
        assert_eq!(s, WorkerState::empty("w1"));
    }
}

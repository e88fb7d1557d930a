//! Types shared between the corral coordinator and its workers: the job
//! identifier, the Testfile parser, and the wire messages exchanged over the
//! worker control endpoints.

pub mod job;
pub mod testfile;
pub mod wire;

pub use job::{parse_job, Job, JobParseError};
pub use testfile::{parse_testfile, SyntaxError, SETUP_TASK, TESTFILE_NAME};
pub use wire::{CancelReq, LivePollReq, PingReq, RetryReq, RunStatusReq, Status, WorkerState};

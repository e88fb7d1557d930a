//! The worker's job lifecycle: register, long-poll for assignments, and run
//! one job at a time.
//!
//! A job runs under `/bin/bash -eo pipefail` in its own process group, with
//! stdout and stderr captured to an output file that the live-output
//! follower can tail. Whatever happens to the test process, the whole group
//! is SIGKILLed afterwards to reap background children. A new assignment
//! arriving mid-run cancels the running job before the new one starts.

use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use corral_core::wire::{PingReq, RunStatusReq, WorkerState};
use corral_core::{parse_testfile, Job, Status, SETUP_TASK, TESTFILE_NAME};

use crate::client::CoordinatorClient;
use crate::config::Config;
use crate::output::{output_file_name, scan_error};
use crate::storage::OutputStore;

/// Some tests legitimately take the better part of a minute; this is about
/// as tight as the limit can be.
const JOB_TIMEOUT: Duration = Duration::from_secs(3 * 60);

const PING_INTERVAL: Duration = Duration::from_secs(1);

/// A second fetch after a short pause usually clears a transient failure.
const FETCH_RETRY_PAUSE: Duration = Duration::from_secs(2);

pub struct Worker {
    pub cfg: Config,
    pub client: CoordinatorClient,
    pub store: OutputStore,
    pub id: String,
    pub host: String,
    /// The output file and job this worker is currently producing output
    /// for; the live-output follower stops tailing once this moves on.
    cur: Mutex<Option<CurrentJob>>,
}

#[derive(Clone)]
pub struct CurrentJob {
    pub path: PathBuf,
    pub job: Job,
}

/// Where a running command's output goes: the job's output file, or stdout
/// for `onejob`.
pub enum OutputTarget {
    File(std::fs::File),
    Stdout,
}

impl OutputTarget {
    fn log_line(&mut self, line: &str) {
        match self {
            OutputTarget::File(f) => {
                let _ = writeln!(f, "{line}");
            }
            OutputTarget::Stdout => println!("{line}"),
        }
    }

    fn stdio(&self) -> std::io::Result<Stdio> {
        match self {
            OutputTarget::File(f) => Ok(Stdio::from(f.try_clone()?)),
            OutputTarget::Stdout => Ok(Stdio::inherit()),
        }
    }
}

/// How a job ended, before it is mapped to a commit status.
pub enum Outcome {
    Success,
    /// The deadline fired or a new assignment arrived.
    Canceled {
        cause: &'static str,
        detail: String,
    },
    /// The test process exited non-zero.
    Failed(String),
    /// Setup, checkout or manifest trouble.
    Error(String),
}

enum RunError {
    Canceled { cause: &'static str, detail: String },
    Exit(std::process::ExitStatus),
    Io(anyhow::Error),
}

impl RunError {
    fn describe(&self) -> String {
        match self {
            RunError::Canceled { cause, detail } => format!("{cause}: {detail}"),
            RunError::Exit(status) => status.to_string(),
            RunError::Io(e) => format!("{e:#}"),
        }
    }
}

struct JobHandle {
    token: CancellationToken,
    done: tokio::task::JoinHandle<()>,
}

impl JobHandle {
    async fn cancel_and_wait(self) {
        self.token.cancel();
        let _ = self.done.await;
    }
}

/// Daemon mode: register with the coordinator and run jobs as assigned.
pub async fn run(cfg: Config) -> Result<()> {
    let worker = std::sync::Arc::new(Worker::new(cfg));
    info!(id = %worker.id, host = %worker.host, "starting worker");

    worker.init_filesystem().await.context("preparing workspace")?;
    worker.ping().await.context("first ping")?;

    {
        let worker = worker.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(PING_INTERVAL).await;
                if let Err(e) = worker.ping().await {
                    // The coordinator will garbage-collect us shortly; exit
                    // so the machine comes back as a fresh worker.
                    error!("ping failed: {e:#}");
                    std::process::exit(1);
                }
            }
        });
    }
    tokio::spawn(crate::output::poll_for_output(worker.clone()));

    let mut state = WorkerState::empty(worker.id.clone());
    let mut current: Option<JobHandle> = None;
    loop {
        state = worker.wait_state(&state).await;
        if let Some(handle) = current.take() {
            handle.cancel_and_wait().await;
        }
        current = worker.start_job(state.job.clone());
    }
}

/// Single-shot mode: run one job with output to stdout, without registering.
pub async fn one_job(cfg: Config, job: Job) -> Result<()> {
    let worker = std::sync::Arc::new(Worker::new(cfg));
    worker.init_filesystem().await.context("preparing workspace")?;

    let mut out = OutputTarget::Stdout;
    // no job timeout here: the operator can hit ^C themselves
    let cancel = CancellationToken::new();
    match worker.execute(&job, &mut out, &cancel, None).await {
        Outcome::Success => Ok(()),
        outcome => {
            eprintln!("{job}: {}", outcome_desc(&outcome, 0));
            std::process::exit(2);
        }
    }
}

fn outcome_desc(outcome: &Outcome, elapsed_ms: u64) -> String {
    match outcome {
        Outcome::Success => format!("{elapsed_ms}ms"),
        Outcome::Canceled { cause, detail } => {
            format!("canceled automatically: {cause}: {detail}")
        }
        Outcome::Failed(desc) | Outcome::Error(desc) => desc.clone(),
    }
}

impl Worker {
    pub fn new(cfg: Config) -> Self {
        let client = CoordinatorClient::new(cfg.coordinator_url.clone());
        let store = OutputStore::new(cfg.bucket.clone());
        let host = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        Worker {
            cfg,
            client,
            store,
            id: uuid::Uuid::new_v4().simple().to_string(),
            host,
            cur: Mutex::new(None),
        }
    }

    pub fn current(&self) -> Option<CurrentJob> {
        self.cur.lock().expect("current-job mutex poisoned").clone()
    }

    fn set_current(&self, cur: Option<CurrentJob>) {
        *self.cur.lock().expect("current-job mutex poisoned") = cur;
    }

    pub fn is_current_output(&self, path: &Path) -> bool {
        self.current().map(|c| c.path == path).unwrap_or(false)
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .ping(&PingReq {
                id: self.id.clone(),
                host: self.host.clone(),
            })
            .await
    }

    /// Wipe the workspace and clone the repository fresh.
    async fn init_filesystem(&self) -> Result<()> {
        let _ = tokio::fs::remove_dir_all(&self.cfg.root_dir).await;
        tokio::fs::create_dir_all(self.cfg.ws_dir()).await?;
        tokio::fs::create_dir_all(self.cfg.out_dir()).await?;

        let repo_dir = self.cfg.repo_dir();
        let status = tokio::process::Command::new("git")
            .args(["clone", &self.cfg.repo_url()])
            .arg(&repo_dir)
            .status()
            .await
            .context("running git clone")?;
        ensure!(status.success(), "git clone: {status}");

        // Park on a scratch branch so `git fetch` can fast-forward the
        // branches the jobs will reset to.
        let status = tokio::process::Command::new("git")
            .args(["checkout", "-b", "corral-scratch"])
            .current_dir(&repo_dir)
            .status()
            .await
            .context("running git checkout")?;
        ensure!(status.success(), "git checkout: {status}");
        Ok(())
    }

    /// Long-poll until the coordinator reports a state different from the
    /// one we know. Transport errors back off briefly; an unchanged answer
    /// re-polls immediately.
    async fn wait_state(&self, old: &WorkerState) -> WorkerState {
        loop {
            match self.client.call::<_, WorkerState>("/box-longpoll", old).await {
                Ok(new) if new != *old => return new,
                Ok(_) => continue,
                Err(e) => {
                    error!("long poll: {e:#}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn start_job(
        self: &std::sync::Arc<Self>,
        job: Option<Job>,
    ) -> Option<JobHandle> {
        let job = job?;
        let token = CancellationToken::new();
        let worker = self.clone();
        let cancel = token.clone();
        let done = tokio::spawn(async move {
            worker.run_job(job, cancel).await;
        });
        Some(JobHandle { token, done })
    }

    async fn run_job(&self, job: Job, cancel: CancellationToken) {
        let start = Instant::now();
        self.post_run_status(&job, Status::Pending, "running", "", 0).await;

        let out_path = self.cfg.out_dir().join(output_file_name(&job));
        let file = match std::fs::File::create(&out_path) {
            Ok(f) => f,
            Err(e) => {
                error!("{job}: creating output file: {e}");
                self.post_run_status(&job, Status::Error, &e.to_string(), "", 0).await;
                return;
            }
        };
        self.set_current(Some(CurrentJob {
            path: out_path.clone(),
            job: job.clone(),
        }));

        let mut out = OutputTarget::File(file);
        let outcome = self.execute(&job, &mut out, &cancel, Some(JOB_TIMEOUT)).await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let status = match &outcome {
            Outcome::Success => Status::Success,
            Outcome::Failed(_) => Status::Failure,
            Outcome::Canceled { .. } | Outcome::Error(_) => Status::Error,
        };
        let mut desc = outcome_desc(&outcome, elapsed_ms);
        match status {
            Status::Success => info!("{job}: success"),
            _ => error!("{job}: {desc}"),
        }

        // Close the descriptors into the output file before reading it back.
        drop(out);

        if let Ok(mut f) = std::fs::OpenOptions::new().append(true).open(&out_path) {
            let _ = writeln!(f, "{desc}");
        }
        if status != Status::Success {
            if let Ok(f) = std::fs::File::open(&out_path) {
                if let Some(line) = scan_error(std::io::BufReader::new(f)) {
                    desc = format!("{desc}: {}", self.strip_workspace_paths(&job, &line));
                }
            }
        }

        match self.store.upload(&out_path, &self.id).await {
            Ok(url) => {
                self.post_run_status(&job, status, &desc, &url, elapsed_ms).await;
            }
            Err(e) => {
                error!("{job}: cannot upload output file: {e:#}");
                self.post_run_status(&job, Status::Error, &format!("output upload: {e}"), "", elapsed_ms)
                    .await;
            }
        }
        self.set_current(None);
    }

    /// Make local paths in an error line readable: the job directory
    /// becomes relative and the repository root symbolic.
    fn strip_workspace_paths(&self, job: &Job, line: &str) -> String {
        let repo = self.cfg.repo_dir();
        let cmddir = self.job_dir(&job.dir);
        line.replace(&format!("{}/", cmddir.display()), "")
            .replace(&format!("{}/", repo.display()), "$CORRAL_ROOT/")
    }

    async fn post_run_status(&self, job: &Job, status: Status, desc: &str, url: &str, elapsed_ms: u64) {
        let req = RunStatusReq {
            job: job.clone(),
            status,
            desc: desc.to_string(),
            url: url.to_string(),
            trace_url: String::new(),
            elapsed_ms,
        };
        if let Err(e) = self.client.post("/box-runstatus", &req).await {
            error!("{job}: posting run status: {e:#}");
        }
    }

    fn job_dir(&self, dir: &str) -> PathBuf {
        self.cfg
            .repo_dir()
            .join(dir.trim_start_matches('/'))
    }

    fn manifest_path(&self, dir: &str) -> PathBuf {
        self.job_dir(dir).join(TESTFILE_NAME)
    }

    /// Check out the job's commit, run every ancestor setup task, then the
    /// test itself. The timeout, when given, spans all of it.
    pub async fn execute(
        &self,
        job: &Job,
        out: &mut OutputTarget,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Outcome {
        let deadline = timeout.map(|t| Instant::now() + t);

        out.log_line(&format!("starting job {job}"));
        out.log_line(&format!("worker host {}", self.host));

        let setup_start = Instant::now();
        if let Err(e) = self.sync_repo(&job.sha, out, cancel, deadline).await {
            return match e {
                RunError::Canceled { cause, detail } => Outcome::Canceled { cause, detail },
                e => Outcome::Error(format!("clone: {}", e.describe())),
            };
        }
        out.log_line(&format!("setup ok {:?}", setup_start.elapsed()));

        // Run setup entries from every Testfile on the path from the root
        // to the job's directory, so a test can rely on artifacts its
        // ancestors build. No particular order among them is promised.
        for dir in ancestors(&job.dir) {
            let manifest = self.manifest_path(&dir);
            let contents = match std::fs::read_to_string(&manifest) {
                Ok(c) => c,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Outcome::Error(format!("reading {}: {e}", manifest.display())),
            };
            let entries = match parse_testfile(&contents) {
                Ok(entries) => entries,
                Err(e) => {
                    let msg = format!("parse {}: {e}", manifest.display());
                    out.log_line(&msg);
                    return Outcome::Error(msg);
                }
            };
            let Some(cmd) = entries.get(SETUP_TASK) else {
                continue;
            };
            let dir_path = self.job_dir(&dir);
            if let Err(e) = self.run_bash(&dir_path, cmd, out, cancel, deadline).await {
                return match e {
                    RunError::Canceled { cause, detail } => Outcome::Canceled { cause, detail },
                    e => Outcome::Error(format!("setup {dir}: {}", e.describe())),
                };
            }
        }

        let manifest = self.manifest_path(&job.dir);
        let contents = match std::fs::read_to_string(&manifest) {
            Ok(c) => c,
            Err(e) => return Outcome::Error(format!("reading {}: {e}", manifest.display())),
        };
        let entries = match parse_testfile(&contents) {
            Ok(entries) => entries,
            Err(e) => {
                let msg = format!("parse {}: {e}", manifest.display());
                out.log_line(&msg);
                return Outcome::Error(msg);
            }
        };
        let Some(cmd) = entries.get(&job.name) else {
            out.log_line(&format!("cannot find Testfile entry {}", job.name));
            return Outcome::Error(format!("cannot find Testfile entry {}", job.name));
        };

        match self.run_bash(&self.job_dir(&job.dir), cmd, out, cancel, deadline).await {
            Ok(()) => Outcome::Success,
            Err(RunError::Canceled { cause, detail }) => Outcome::Canceled { cause, detail },
            Err(RunError::Exit(status)) => Outcome::Failed(status.to_string()),
            Err(RunError::Io(e)) => Outcome::Error(format!("{e:#}")),
        }
    }

    /// Make sure the commit exists locally, then reset the tree to it.
    async fn sync_repo(
        &self,
        sha: &str,
        out: &mut OutputTarget,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<(), RunError> {
        if !self.object_exists(sha, out, cancel, deadline).await {
            if self.run_git(&["fetch"], out, cancel, deadline).await.is_err() {
                tokio::time::sleep(FETCH_RETRY_PAUSE).await;
                self.run_git(&["fetch"], out, cancel, deadline).await?;
            }
        }
        self.run_git(&["clean", "-xdf"], out, cancel, deadline).await?;
        self.run_git(&["reset", "--hard", sha], out, cancel, deadline).await
    }

    /// Whether the object definitely exists locally. Any error counts as
    /// "no" and triggers a fetch.
    async fn object_exists(
        &self,
        sha: &str,
        out: &mut OutputTarget,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> bool {
        self.run_git(&["cat-file", "-e", sha], out, cancel, deadline)
            .await
            .is_ok()
    }

    async fn run_git(
        &self,
        args: &[&str],
        out: &mut OutputTarget,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<(), RunError> {
        let repo_dir = self.cfg.repo_dir();
        out.log_line(&format!("cd {}", repo_dir.display()));
        out.log_line(&format!("git {}", args.join(" ")));

        let mut cmd = std::process::Command::new("git");
        cmd.args(args).current_dir(&repo_dir);
        cmd.stdout(out.stdio().map_err(|e| RunError::Io(e.into()))?);
        cmd.stderr(out.stdio().map_err(|e| RunError::Io(e.into()))?);
        cmd.process_group(0);
        spawn_and_wait(cmd, cancel, deadline).await
    }

    async fn run_bash(
        &self,
        dir: &Path,
        shell_cmd: &str,
        out: &mut OutputTarget,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<(), RunError> {
        out.log_line(&format!("cd {}", dir.display()));
        out.log_line(shell_cmd);

        let repo = self.cfg.repo_dir();
        let mut cmd = std::process::Command::new("/bin/bash");
        cmd.args(["-eo", "pipefail", "-c", shell_cmd]);
        cmd.current_dir(dir);
        cmd.env("CORRAL_ROOT", &repo);
        cmd.env("CORRAL_BIN", &self.cfg.bin_dir);
        cmd.env(
            "PATH",
            format!(
                "{}:{}/bin:{}",
                self.cfg.bin_dir.display(),
                repo.display(),
                std::env::var("PATH").unwrap_or_default()
            ),
        );
        cmd.stdout(out.stdio().map_err(|e| RunError::Io(e.into()))?);
        cmd.stderr(out.stdio().map_err(|e| RunError::Io(e.into()))?);
        cmd.process_group(0);
        spawn_and_wait(cmd, cancel, deadline).await
    }
}

/// Run a prepared command to completion, the deadline, or cancellation.
/// Whatever the outcome, the whole process group gets a SIGKILL afterwards
/// so background children cannot outlive the job.
async fn spawn_and_wait(
    cmd: std::process::Command,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
) -> Result<(), RunError> {
    let mut child = tokio::process::Command::from(cmd)
        .spawn()
        .map_err(|e| RunError::Io(e.into()))?;
    let pid = child.id();

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => None,
        _ = sleep_until_opt(deadline) => None,
    };

    match waited {
        Some(Ok(status)) => {
            kill_group(pid);
            if status.success() {
                Ok(())
            } else {
                Err(RunError::Exit(status))
            }
        }
        Some(Err(e)) => {
            kill_group(pid);
            Err(RunError::Io(e.into()))
        }
        None => {
            let cause = if cancel.is_cancelled() {
                "canceled"
            } else {
                "deadline exceeded"
            };
            kill_group(pid);
            let detail = match child.wait().await {
                Ok(status) => status.to_string(),
                Err(e) => e.to_string(),
            };
            Err(RunError::Canceled { cause, detail })
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

/// `/a/b` and every directory above it: `["/", "/a", "/a/b"]`.
pub fn ancestors(dir: &str) -> Vec<String> {
    let mut out = vec!["/".to_string()];
    let mut cur = String::new();
    for part in dir.split('/').filter(|p| !p.is_empty()) {
        cur.push('/');
        cur.push_str(part);
        out.push(cur.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestors_of_root_is_just_root() {
        assert_eq!(ancestors("/"), vec!["/"]);
    }

    #[test]
    fn ancestors_walk_down_from_root() {
        assert_eq!(ancestors("/a/b"), vec!["/", "/a", "/a/b"]);
        assert_eq!(ancestors("/cmd/ledgerd"), vec!["/", "/cmd", "/cmd/ledgerd"]);
    }

    #[test]
    fn outcome_descriptions() {
        assert_eq!(outcome_desc(&Outcome::Success, 412), "412ms");
        assert_eq!(
            outcome_desc(
                &Outcome::Canceled {
                    cause: "deadline exceeded",
                    detail: "signal: 9 (SIGKILL)".to_string(),
                },
                0,
            ),
            "canceled automatically: deadline exceeded: signal: 9 (SIGKILL)"
        );
        assert_eq!(
            outcome_desc(&Outcome::Failed("exit status: 1".to_string()), 0),
            "exit status: 1"
        );
    }
}

//! The assignment store.
//!
//! SQLite holds the authoritative data model: `pr`, `worker`, `job`, `run`
//! and `result`. The `run` table is the current assignment of jobs to
//! workers, constrained to at most one run per worker and one run per job.
//!
//! The original deployment of this data model kept the assignment logic in
//! database triggers with LISTEN/NOTIFY fan-out. Here the same semantics
//! live in this module: every transaction that can change the `run` table
//! re-runs [`fill_runs`] before committing, and wake-ups are broadcast on
//! in-process watch channels: `state_wakeup` for run-table mutations,
//! `report` for new results. Listeners must tolerate spurious wake-ups and
//! always re-read from the store.
//!
//! `rusqlite::Connection` is not `Sync`, so the connection lives behind a
//! mutex and every operation hops to `spawn_blocking`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tokio::sync::watch;
use tracing::warn;

use corral_core::wire::WorkerState;
use corral_core::{Job, Status};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pr (
    num  INTEGER PRIMARY KEY,
    head TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS worker (
    id           TEXT PRIMARY KEY,
    host         TEXT NOT NULL DEFAULT '',
    last_seen_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS job (
    sha  TEXT NOT NULL,
    dir  TEXT NOT NULL,
    name TEXT NOT NULL,
    PRIMARY KEY (sha, dir, name)
);

CREATE TABLE IF NOT EXISTS run (
    worker_id TEXT NOT NULL UNIQUE REFERENCES worker(id) ON DELETE CASCADE,
    sha       TEXT NOT NULL,
    dir       TEXT NOT NULL,
    name      TEXT NOT NULL,
    UNIQUE (sha, dir, name),
    FOREIGN KEY (sha, dir, name) REFERENCES job(sha, dir, name) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS result (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    sha        TEXT NOT NULL,
    dir        TEXT NOT NULL,
    name       TEXT NOT NULL,
    pr         TEXT NOT NULL DEFAULT '[]',
    state      TEXT NOT NULL,
    descr      TEXT NOT NULL DEFAULT '',
    url        TEXT NOT NULL DEFAULT '',
    elapsed_ms INTEGER NOT NULL DEFAULT 0,
    trace_url  TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL DEFAULT (strftime('%s','now')),
    reported   INTEGER NOT NULL DEFAULT 0
);
"#;

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    state_wakeup: Arc<watch::Sender<u64>>,
    report: Arc<watch::Sender<u64>>,
}

#[derive(Debug, Clone)]
pub struct WorkerRow {
    pub id: String,
    pub host: String,
    pub last_seen_at: i64,
}

#[derive(Debug, Clone)]
pub struct ResultRow {
    pub id: i64,
    pub job: Job,
    pub pr: Vec<i64>,
    pub state: String,
    pub descr: String,
    pub url: String,
    pub elapsed_ms: i64,
    pub trace_url: String,
    pub created_at: i64,
    pub reported: bool,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening assignment store at {}", path.display()))?;
        Self::from_conn(conn)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_conn(Connection::open_in_memory()?)
    }

    fn from_conn(conn: Connection) -> Result<Self> {
        // In-memory databases report "memory" here; anything else that is
        // not WAL still works, just with worse concurrency.
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .context("setting journal mode")?;
        if !journal_mode.eq_ignore_ascii_case("wal") && !journal_mode.eq_ignore_ascii_case("memory")
        {
            warn!("journal_mode is {journal_mode}, not wal");
        }
        conn.execute_batch("PRAGMA synchronous = NORMAL; PRAGMA busy_timeout = 5000;")
            .context("configuring pragmas")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("enabling foreign keys")?;
        conn.execute_batch(SCHEMA).context("creating schema")?;

        let (state_wakeup, _) = watch::channel(0);
        let (report, _) = watch::channel(0);
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
            state_wakeup: Arc::new(state_wakeup),
            report: Arc::new(report),
        })
    }

    /// Bumped whenever the run table may have changed.
    pub fn subscribe_state(&self) -> watch::Receiver<u64> {
        self.state_wakeup.subscribe()
    }

    /// Bumped whenever a new result is recorded.
    pub fn subscribe_report(&self) -> watch::Receiver<u64> {
        self.report.subscribe()
    }

    async fn blocking<T, F>(&self, what: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &Wakeups) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        let wakeups = Wakeups {
            state: self.state_wakeup.clone(),
            report: self.report.clone(),
        };
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().expect("store mutex poisoned");
            f(&mut *conn, &wakeups)
        })
        .await
        .with_context(|| format!("{what}: store task"))?
    }

    /// Record (or refresh) a worker. New workers pick up any unassigned job.
    pub async fn ping_worker(&self, id: String, host: String) -> Result<()> {
        self.blocking("ping_worker", move |conn, wake| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO worker (id, host, last_seen_at)
                 VALUES (?1, ?2, strftime('%s','now'))
                 ON CONFLICT (id) DO UPDATE SET host = ?2, last_seen_at = strftime('%s','now')",
                params![id, host],
            )
            .context("insert worker")?;
            let filled = fill_runs(&tx)?;
            tx.commit()?;
            if filled > 0 {
                wake.state();
            }
            Ok(())
        })
        .await
    }

    /// Insert or update the head commit for a PR.
    ///
    /// Returns whether anything changed (false means the event was a
    /// duplicate) together with the jobs that became obsolete: jobs on the
    /// old head that no other PR still wants. Those jobs are deleted here;
    /// the caller is expected to post their cancellation statuses.
    pub async fn upsert_pr(&self, num: i64, head: String) -> Result<(bool, Vec<Job>)> {
        self.blocking("upsert_pr", move |conn, wake| {
            let tx = conn.transaction()?;
            let old_head: Option<String> = tx
                .query_row("SELECT head FROM pr WHERE num = ?1", params![num], |row| {
                    row.get(0)
                })
                .optional()?;
            if old_head.as_deref() == Some(head.as_str()) {
                return Ok((false, Vec::new()));
            }

            let mut obsolete = Vec::new();
            if let Some(old) = &old_head {
                let mut stmt = tx.prepare(
                    "SELECT sha, dir, name FROM job
                     WHERE sha = ?1
                       AND NOT EXISTS (SELECT 1 FROM pr WHERE head = ?1 AND num != ?2)",
                )?;
                let jobs = stmt.query_map(params![old, num], |row| {
                    Ok(Job {
                        sha: row.get(0)?,
                        dir: row.get(1)?,
                        name: row.get(2)?,
                    })
                })?;
                for job in jobs {
                    obsolete.push(job?);
                }
                drop(stmt);
                tx.execute(
                    "DELETE FROM job
                     WHERE sha = ?1
                       AND NOT EXISTS (SELECT 1 FROM pr WHERE head = ?1 AND num != ?2)",
                    params![old, num],
                )?;
            }

            tx.execute(
                "INSERT INTO pr (num, head) VALUES (?1, ?2)
                 ON CONFLICT (num) DO UPDATE SET head = excluded.head",
                params![num, head],
            )?;
            fill_runs(&tx)?;
            tx.commit()?;
            wake.state();
            Ok((true, obsolete))
        })
        .await
    }

    /// Forget a closed PR. Jobs on its head are cancelled unless another
    /// open PR still shares that head.
    pub async fn delete_pr(&self, num: i64) -> Result<()> {
        self.blocking("delete_pr", move |conn, wake| {
            let tx = conn.transaction()?;
            let head: Option<String> = tx
                .query_row("SELECT head FROM pr WHERE num = ?1", params![num], |row| {
                    row.get(0)
                })
                .optional()?;
            let Some(head) = head else {
                return Ok(());
            };
            tx.execute("DELETE FROM pr WHERE num = ?1", params![num])?;
            tx.execute(
                "DELETE FROM job
                 WHERE sha = ?1 AND NOT EXISTS (SELECT 1 FROM pr WHERE head = ?1)",
                params![head],
            )?;
            fill_runs(&tx)?;
            tx.commit()?;
            wake.state();
            Ok(())
        })
        .await
    }

    /// Queue jobs for the named Testfile entries, idempotently.
    pub async fn insert_jobs(&self, sha: String, dir: String, names: Vec<String>) -> Result<()> {
        self.blocking("insert_jobs", move |conn, wake| {
            let tx = conn.transaction()?;
            for name in &names {
                tx.execute(
                    "INSERT OR IGNORE INTO job (sha, dir, name) VALUES (?1, ?2, ?3)",
                    params![sha, dir, name],
                )?;
            }
            fill_runs(&tx)?;
            tx.commit()?;
            wake.state();
            Ok(())
        })
        .await
    }

    /// Atomically move a job to the result table.
    ///
    /// One transaction deletes the job row (freeing its run, and with it the
    /// worker) and inserts a result tagged with every PR whose head is the
    /// job's commit. Returns false when the job row was already gone, as
    /// happens on a duplicate or late report; that is a no-op.
    pub async fn mark_done(
        &self,
        job: Job,
        state: Status,
        descr: String,
        url: String,
        trace_url: String,
        elapsed_ms: i64,
    ) -> Result<bool> {
        self.blocking("mark_done", move |conn, wake| {
            let tx = conn.transaction()?;
            let deleted = tx.execute(
                "DELETE FROM job WHERE sha = ?1 AND dir = ?2 AND name = ?3",
                params![job.sha, job.dir, job.name],
            )?;
            if deleted == 0 {
                return Ok(false);
            }
            let mut stmt = tx.prepare("SELECT num FROM pr WHERE head = ?1 ORDER BY num")?;
            let prs: Vec<i64> = stmt
                .query_map(params![job.sha], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            drop(stmt);
            tx.execute(
                "INSERT INTO result (sha, dir, name, pr, state, descr, url, elapsed_ms, trace_url)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    job.sha,
                    job.dir,
                    job.name,
                    serde_json::to_string(&prs)?,
                    state.as_str(),
                    descr,
                    url,
                    elapsed_ms,
                    trace_url
                ],
            )?;
            fill_runs(&tx)?;
            tx.commit()?;
            wake.state();
            wake.report();
            Ok(true)
        })
        .await
    }

    /// Delete workers not seen within the liveness window. Their runs
    /// cascade away and the freed jobs are re-assigned by the fill.
    pub async fn gc_workers(&self, window_secs: i64) -> Result<usize> {
        self.blocking("gc_workers", move |conn, wake| {
            let tx = conn.transaction()?;
            let dropped = tx.execute(
                "DELETE FROM worker WHERE last_seen_at < strftime('%s','now') - ?1",
                params![window_secs],
            )?;
            if dropped > 0 {
                fill_runs(&tx)?;
            }
            tx.commit()?;
            if dropped > 0 {
                wake.state();
            }
            Ok(dropped)
        })
        .await
    }

    /// Re-queue the job recorded by a result, idempotently. Returns the job,
    /// or None when no such result exists.
    pub async fn retry_result(&self, id: i64) -> Result<Option<Job>> {
        self.blocking("retry_result", move |conn, wake| {
            let tx = conn.transaction()?;
            let job: Option<Job> = tx
                .query_row(
                    "SELECT sha, dir, name FROM result WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok(Job {
                            sha: row.get(0)?,
                            dir: row.get(1)?,
                            name: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            let Some(job) = job else {
                return Ok(None);
            };
            tx.execute(
                "INSERT OR IGNORE INTO job (sha, dir, name) VALUES (?1, ?2, ?3)",
                params![job.sha, job.dir, job.name],
            )?;
            fill_runs(&tx)?;
            tx.commit()?;
            wake.state();
            Ok(Some(job))
        })
        .await
    }

    /// Current assignment of jobs to workers, keyed by worker id.
    pub async fn load_states(&self) -> Result<HashMap<String, WorkerState>> {
        self.blocking("load_states", |conn, _| {
            let mut stmt = conn.prepare("SELECT worker_id, sha, dir, name FROM run")?;
            let rows = stmt.query_map([], |row| {
                let id: String = row.get(0)?;
                Ok(WorkerState {
                    id: id.clone(),
                    job: Some(Job {
                        sha: row.get(1)?,
                        dir: row.get(2)?,
                        name: row.get(3)?,
                    }),
                })
            })?;
            let mut states = HashMap::new();
            for row in rows {
                let state = row?;
                states.insert(state.id.clone(), state);
            }
            Ok(states)
        })
        .await
    }

    pub async fn unreported_results(&self) -> Result<Vec<ResultRow>> {
        self.blocking("unreported_results", |conn, _| {
            query_results(conn, "WHERE NOT reported ORDER BY id", &[])
        })
        .await
    }

    pub async fn mark_reported(&self, ids: Vec<i64>) -> Result<()> {
        self.blocking("mark_reported", move |conn, _| {
            let tx = conn.transaction()?;
            for id in &ids {
                tx.execute("UPDATE result SET reported = 1 WHERE id = ?1", params![id])?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerRow>> {
        self.blocking("list_workers", |conn, _| {
            let mut stmt =
                conn.prepare("SELECT id, host, last_seen_at FROM worker ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                Ok(WorkerRow {
                    id: row.get(0)?,
                    host: row.get(1)?,
                    last_seen_at: row.get(2)?,
                })
            })?;
            rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
        })
        .await
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        self.blocking("list_jobs", |conn, _| {
            let mut stmt = conn.prepare("SELECT sha, dir, name FROM job ORDER BY sha, dir, name")?;
            let rows = stmt.query_map([], |row| {
                Ok(Job {
                    sha: row.get(0)?,
                    dir: row.get(1)?,
                    name: row.get(2)?,
                })
            })?;
            rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
        })
        .await
    }

    pub async fn list_results(&self, limit: i64) -> Result<Vec<ResultRow>> {
        self.blocking("list_results", move |conn, _| {
            query_results(conn, "ORDER BY id DESC LIMIT ?1", &[&limit as &dyn rusqlite::ToSql])
        })
        .await
    }

    pub async fn job_results(&self, job: Job) -> Result<Vec<ResultRow>> {
        self.blocking("job_results", move |conn, _| {
            query_results(
                conn,
                "WHERE sha = ?1 AND dir = ?2 AND name = ?3 ORDER BY id DESC",
                &[&job.sha as &dyn rusqlite::ToSql, &job.dir, &job.name],
            )
        })
        .await
    }

    pub async fn get_result(&self, id: i64) -> Result<Option<ResultRow>> {
        self.blocking("get_result", move |conn, _| {
            let mut rows = query_results(conn, "WHERE id = ?1", &[&id as &dyn rusqlite::ToSql])?;
            Ok(rows.pop())
        })
        .await
    }

    /// Whether the job is still queued or running (present in the job table).
    pub async fn job_is_live(&self, job: Job) -> Result<bool> {
        self.blocking("job_is_live", move |conn, _| {
            let n: i64 = conn.query_row(
                "SELECT count(*) FROM job WHERE sha = ?1 AND dir = ?2 AND name = ?3",
                params![job.sha, job.dir, job.name],
                |row| row.get(0),
            )?;
            Ok(n > 0)
        })
        .await
    }

    /// Numbers of the open PRs whose head is the given commit.
    pub async fn prs_for_head(&self, sha: String) -> Result<Vec<i64>> {
        self.blocking("prs_for_head", move |conn, _| {
            let mut stmt = conn.prepare("SELECT num FROM pr WHERE head = ?1 ORDER BY num")?;
            let rows = stmt.query_map(params![sha], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
        })
        .await
    }

    /// Raw SQL escape hatch for tests that need to rewrite timestamps.
    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &'static str) -> Result<usize> {
        self.blocking("execute_raw", move |conn, _| {
            conn.execute(sql, []).map_err(Into::into)
        })
        .await
    }
}

struct Wakeups {
    state: Arc<watch::Sender<u64>>,
    report: Arc<watch::Sender<u64>>,
}

impl Wakeups {
    fn state(&self) {
        self.state.send_modify(|n| *n += 1);
    }

    fn report(&self) {
        self.report.send_modify(|n| *n += 1);
    }
}

/// Reproduce the assignment triggers: pair each idle worker with an
/// unassigned job, one row at a time, until no pair remains. Runs inside
/// every transaction that frees a worker or adds a job or worker.
fn fill_runs(tx: &Transaction) -> Result<usize> {
    let mut filled = 0;
    loop {
        let n = tx.execute(
            "INSERT INTO run (worker_id, sha, dir, name)
             SELECT w.id, j.sha, j.dir, j.name
             FROM worker w, job j
             WHERE w.id NOT IN (SELECT worker_id FROM run)
               AND (j.sha, j.dir, j.name) NOT IN (SELECT sha, dir, name FROM run)
             LIMIT 1",
            [],
        )?;
        if n == 0 {
            return Ok(filled);
        }
        filled += n;
    }
}

fn query_results(
    conn: &Connection,
    tail: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<ResultRow>> {
    let sql = format!(
        "SELECT id, sha, dir, name, pr, state, descr, url, elapsed_ms, trace_url,
                created_at, reported
         FROM result {tail}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, |row| {
        let pr_json: String = row.get(4)?;
        Ok(ResultRow {
            id: row.get(0)?,
            job: Job {
                sha: row.get(1)?,
                dir: row.get(2)?,
                name: row.get(3)?,
            },
            // display-only; an unreadable array renders as empty
            pr: serde_json::from_str(&pr_json).unwrap_or_default(),
            state: row.get(5)?,
            descr: row.get(6)?,
            url: row.get(7)?,
            elapsed_ms: row.get(8)?,
            trace_url: row.get(9)?,
            created_at: row.get(10)?,
            reported: row.get::<_, i64>(11)? != 0,
        })
    })?;
    rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(sha: &str, dir: &str, name: &str) -> Job {
        Job {
            sha: sha.into(),
            dir: dir.into(),
            name: name.into(),
        }
    }

    async fn assigned_jobs(store: &Store) -> Vec<(String, Job)> {
        let mut states: Vec<_> = store
            .load_states()
            .await
            .unwrap()
            .into_values()
            .map(|s| (s.id, s.job.unwrap()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    #[tokio::test]
    async fn assigns_job_to_pinged_worker_and_moves_it_to_result() {
        let store = Store::open_in_memory().unwrap();
        store.ping_worker("box1".into(), "host1".into()).await.unwrap();
        store.upsert_pr(1, "commit1".into()).await.unwrap();
        store
            .insert_jobs("commit1".into(), "/".into(), vec!["cmd1".into()])
            .await
            .unwrap();

        assert_eq!(
            assigned_jobs(&store).await,
            vec![("box1".to_string(), job("commit1", "/", "cmd1"))]
        );

        let moved = store
            .mark_done(
                job("commit1", "/", "cmd1"),
                Status::Error,
                "canceled by operator".into(),
                String::new(),
                String::new(),
                0,
            )
            .await
            .unwrap();
        assert!(moved);
        assert!(assigned_jobs(&store).await.is_empty());
        assert!(store.list_jobs().await.unwrap().is_empty());

        let results = store.list_results(10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].job, job("commit1", "/", "cmd1"));
        assert_eq!(results[0].state, "error");
        assert_eq!(results[0].pr, vec![1]);
        assert!(!results[0].reported);
    }

    #[tokio::test]
    async fn ping_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.ping_worker("w1".into(), "h1".into()).await.unwrap();
        store.ping_worker("w1".into(), "h2".into()).await.unwrap();
        let workers = store.list_workers().await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].host, "h2");
    }

    #[tokio::test]
    async fn mark_done_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_jobs("c1".into(), "/".into(), vec!["t".into()])
            .await
            .unwrap();
        let first = store
            .mark_done(job("c1", "/", "t"), Status::Success, "1ms".into(), String::new(), String::new(), 1)
            .await
            .unwrap();
        let second = store
            .mark_done(job("c1", "/", "t"), Status::Success, "1ms".into(), String::new(), String::new(), 1)
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
        assert_eq!(store.list_results(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn one_run_per_worker_and_per_job() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_jobs("c1".into(), "/".into(), vec!["a".into(), "b".into()])
            .await
            .unwrap();
        store.ping_worker("w1".into(), "h".into()).await.unwrap();
        assert_eq!(assigned_jobs(&store).await.len(), 1);

        store.ping_worker("w2".into(), "h".into()).await.unwrap();
        let assigned = assigned_jobs(&store).await;
        assert_eq!(assigned.len(), 2);
        assert_ne!(assigned[0].1, assigned[1].1);
    }

    #[tokio::test]
    async fn head_change_cancels_obsolete_jobs() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_pr(7, "h1".into()).await.unwrap();
        store
            .insert_jobs("h1".into(), "/a/b".into(), vec!["gotest".into()])
            .await
            .unwrap();

        let (modified, obsolete) = store.upsert_pr(7, "h2".into()).await.unwrap();
        assert!(modified);
        assert_eq!(obsolete, vec![job("h1", "/a/b", "gotest")]);
        assert!(store.list_jobs().await.unwrap().is_empty());
        // canceled, not completed: nothing reaches the result table
        assert!(store.list_results(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn shared_head_survives_other_prs_head_change() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_pr(1, "h1".into()).await.unwrap();
        store.upsert_pr(2, "h1".into()).await.unwrap();
        store
            .insert_jobs("h1".into(), "/".into(), vec!["t".into()])
            .await
            .unwrap();

        let (_, obsolete) = store.upsert_pr(1, "h2".into()).await.unwrap();
        assert!(obsolete.is_empty());
        assert_eq!(store.list_jobs().await.unwrap(), vec![job("h1", "/", "t")]);
    }

    #[tokio::test]
    async fn duplicate_pr_event_changes_nothing() {
        let store = Store::open_in_memory().unwrap();
        let (modified, _) = store.upsert_pr(3, "abc".into()).await.unwrap();
        assert!(modified);
        let (modified, obsolete) = store.upsert_pr(3, "abc".into()).await.unwrap();
        assert!(!modified);
        assert!(obsolete.is_empty());
    }

    #[tokio::test]
    async fn gc_requeues_jobs_from_dead_workers() {
        let store = Store::open_in_memory().unwrap();
        store.ping_worker("w1".into(), "h".into()).await.unwrap();
        store
            .insert_jobs("c1".into(), "/".into(), vec!["t".into()])
            .await
            .unwrap();
        assert_eq!(assigned_jobs(&store).await.len(), 1);

        store
            .execute_raw("UPDATE worker SET last_seen_at = 0")
            .await
            .unwrap();
        let dropped = store.gc_workers(5).await.unwrap();
        assert_eq!(dropped, 1);
        assert!(assigned_jobs(&store).await.is_empty());
        // the job survived its worker and is waiting for the next one
        assert_eq!(store.list_jobs().await.unwrap(), vec![job("c1", "/", "t")]);

        store.ping_worker("w2".into(), "h".into()).await.unwrap();
        assert_eq!(
            assigned_jobs(&store).await,
            vec![("w2".to_string(), job("c1", "/", "t"))]
        );
    }

    #[tokio::test]
    async fn retry_requeues_result_job_idempotently() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_jobs("c1".into(), "/x".into(), vec!["y".into()])
            .await
            .unwrap();
        store
            .mark_done(job("c1", "/x", "y"), Status::Failure, "exit status: 1".into(), String::new(), String::new(), 5)
            .await
            .unwrap();
        let id = store.list_results(1).await.unwrap()[0].id;

        let retried = store.retry_result(id).await.unwrap();
        assert_eq!(retried, Some(job("c1", "/x", "y")));
        assert_eq!(store.list_jobs().await.unwrap(), vec![job("c1", "/x", "y")]);

        // a second retry leaves the existing job row unchanged
        let retried = store.retry_result(id).await.unwrap();
        assert_eq!(retried, Some(job("c1", "/x", "y")));
        assert_eq!(store.list_jobs().await.unwrap().len(), 1);

        assert_eq!(store.retry_result(id + 1000).await.unwrap(), None);
    }

    #[tokio::test]
    async fn closed_pr_drops_its_jobs() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_pr(9, "h9".into()).await.unwrap();
        store
            .insert_jobs("h9".into(), "/".into(), vec!["t".into()])
            .await
            .unwrap();
        store.delete_pr(9).await.unwrap();
        assert!(store.list_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn survives_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corral.db");
        {
            let store = Store::open(&path).unwrap();
            store.upsert_pr(4, "h4".into()).await.unwrap();
            store
                .insert_jobs("h4".into(), "/".into(), vec!["t".into()])
                .await
                .unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.list_jobs().await.unwrap(), vec![job("h4", "/", "t")]);
    }

    #[tokio::test]
    async fn wakeups_fire_on_run_changes_and_reports() {
        let store = Store::open_in_memory().unwrap();
        let mut state_rx = store.subscribe_state();
        let mut report_rx = store.subscribe_report();

        store.ping_worker("w1".into(), "h".into()).await.unwrap();
        store
            .insert_jobs("c1".into(), "/".into(), vec!["t".into()])
            .await
            .unwrap();
        assert!(state_rx.has_changed().unwrap());
        state_rx.borrow_and_update();
        assert!(!report_rx.has_changed().unwrap());

        store
            .mark_done(job("c1", "/", "t"), Status::Success, "2ms".into(), String::new(), String::new(), 2)
            .await
            .unwrap();
        assert!(state_rx.has_changed().unwrap());
        assert!(report_rx.has_changed().unwrap());
    }
}

//! Pull-request intake: turn a PR event into queued jobs.
//!
//! The head upsert and the diff listing happen synchronously (the webhook
//! response acknowledges them); manifest fetching and job expansion run in a
//! background task, with transient failures retried on a fixed pace until
//! they drain.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info};

use corral_core::{parse_testfile, Job, Status, SETUP_TASK, TESTFILE_NAME};

use crate::{post_pending_status_bg, AppState};

/// Pause before re-fetching manifests that failed transiently.
const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Pause between attempts while the diff API still 404s a fresh PR.
const NOT_FOUND_PAUSE: Duration = Duration::from_millis(250);

/// Process a PR head: upsert it, cancel newly obsolete jobs, and expand the
/// affected directories' Testfiles into jobs.
pub async fn populate_jobs(state: &Arc<AppState>, num: i64, head: String) -> Result<()> {
    let (modified, obsolete) = state
        .store
        .upsert_pr(num, head.clone())
        .await
        .context("upserting pr")?;
    for job in obsolete {
        post_pending_status_bg(state.clone(), job, "canceled: obsolete commit");
    }
    if !modified {
        return Ok(()); // nothing new to do
    }

    // If the PR is pushed again between the event and this call we list the
    // wrong files, but that is fine: the next event cancels this head's jobs
    // and populates the new one.
    let files = loop {
        match state.github.pr_files(num).await.context("getting pr files")? {
            Some(files) => break files,
            None => {
                // The API may 404 for a PR it just delivered a webhook for.
                // A PR cannot be deleted, only closed, so keep trying.
                tokio::time::sleep(NOT_FOUND_PAUSE).await;
            }
        }
    };

    let dirs: Vec<String> = files.iter().map(|f| parent_dir(&format!("/{f}"))).collect();
    let testfiles: Vec<String> = fill_parents(&dirs)
        .into_iter()
        .map(|dir| join_dir(&dir, TESTFILE_NAME))
        .collect();

    let state = state.clone();
    tokio::spawn(async move {
        let mut files = testfiles;
        loop {
            files = expand_manifests(&state, &head, files).await;
            if files.is_empty() {
                return;
            }
            tokio::time::sleep(RETRY_PAUSE).await;
        }
    });
    Ok(())
}

/// Fetch and expand each candidate manifest; returns the paths that failed
/// transiently and should be retried.
async fn expand_manifests(state: &Arc<AppState>, sha: &str, files: Vec<String>) -> Vec<String> {
    let mut failed = Vec::new();
    for file in files {
        let dir = parent_dir(&file);
        info!(path = %file, commit = %sha, "fetching manifest");
        let body = match state.github.file_contents(&file, sha).await {
            Ok(Some(body)) => body,
            Ok(None) => continue, // this directory declares no tests
            Err(e) => {
                error!("fetching {file}: {e:#}");
                failed.push(file);
                continue;
            }
        };

        let entries = match parse_testfile(&body) {
            Ok(entries) => entries,
            Err(e) => {
                // A broken manifest is reported once, on the manifest
                // itself; no jobs exist yet to fail.
                let job = Job {
                    sha: sha.to_string(),
                    dir: dir.clone(),
                    name: TESTFILE_NAME.to_string(),
                };
                let url = state.github.blob_url(sha, &file);
                if let Err(e) = state
                    .github
                    .post_status(&job, Status::Error, &e.to_string(), &url)
                    .await
                {
                    error!("posting manifest error status for {file}: {e:#}");
                }
                continue;
            }
        };

        let names: Vec<String> = entries
            .keys()
            .filter(|name| name.as_str() != SETUP_TASK)
            .cloned()
            .collect();
        if let Err(e) = state
            .store
            .insert_jobs(sha.to_string(), dir.clone(), names.clone())
            .await
        {
            error!("queueing jobs for {file}: {e:#}");
            failed.push(file);
            continue;
        }
        for name in names {
            let job = Job {
                sha: sha.to_string(),
                dir: dir.clone(),
                name,
            };
            if let Err(e) = state.post_pending_status(&job, "in queue").await {
                error!("posting queue status for {job}: {e:#}");
            }
        }
    }
    failed
}

/// At boot, run intake over every open PR so events missed while down are
/// recovered. The listener is already bound when this runs, so no event can
/// slip between the sync and the first delivery.
pub async fn initial_sync(state: Arc<AppState>) {
    let prs = match state.github.open_prs().await {
        Ok(prs) => prs,
        Err(e) => {
            error!("initial sync: listing open prs: {e:#}");
            std::process::exit(1);
        }
    };
    for pr in prs {
        if let Err(e) = populate_jobs(&state, pr.number, pr.head.sha).await {
            error!("initial sync: pr {}: {e:#}", pr.number);
            std::process::exit(1);
        }
    }
}

/// Directory part of a slash path, like Go's `path.Dir`: everything before
/// the final slash, `/` for top-level absolute paths, `.` when there is no
/// slash at all.
fn parent_dir(p: &str) -> String {
    match p.rfind('/') {
        None => ".".to_string(),
        Some(0) => "/".to_string(),
        Some(i) => p[..i].to_string(),
    }
}

fn join_dir(dir: &str, file: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{file}")
    } else {
        format!("{dir}/{file}")
    }
}

/// Expand each directory to include all of its ancestors, deduplicated and
/// sorted. A change under `/a/b` must also run the tests declared at `/a`
/// and `/`.
pub fn fill_parents(dirs: &[String]) -> Vec<String> {
    let mut all = Vec::new();
    for dir in dirs {
        let mut d = dir.clone();
        while d != "/" && d != "." {
            all.push(d.clone());
            d = parent_dir(&d);
        }
        all.push(d);
    }
    all.sort();
    all.dedup();
    all
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn fill_parents_absolute() {
        let got = fill_parents(&strings(&["/a/b/c", "/d"]));
        assert_eq!(got, strings(&["/", "/a", "/a/b", "/a/b/c", "/d"]));
    }

    #[test]
    fn fill_parents_relative() {
        let got = fill_parents(&strings(&["a/b/c", "d"]));
        assert_eq!(got, strings(&[".", "a", "a/b", "a/b/c", "d"]));
    }

    #[test]
    fn fill_parents_dedupes_shared_ancestors() {
        let got = fill_parents(&strings(&["/a/b", "/a/c"]));
        assert_eq!(got, strings(&["/", "/a", "/a/b", "/a/c"]));
    }

    #[test]
    fn parent_dir_table() {
        assert_eq!(parent_dir("/a/b/c.txt"), "/a/b");
        assert_eq!(parent_dir("/a"), "/");
        assert_eq!(parent_dir("a/b"), "a");
        assert_eq!(parent_dir("x"), ".");
    }

    #[test]
    fn join_dir_handles_root() {
        assert_eq!(join_dir("/", TESTFILE_NAME), "/Testfile");
        assert_eq!(join_dir("/a/b", TESTFILE_NAME), "/a/b/Testfile");
    }
}

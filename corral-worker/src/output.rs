//! Live-output plumbing and output-file helpers.
//!
//! A long poll on `/box-livepoll` tells the worker that a browser wants a
//! job's output. The worker then tails the job's output file like
//! `tail -f` and streams it up as the body of a `/box-livesend` request,
//! stopping once the current-job record has moved off that file and the
//! tail is drained.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info};

use corral_core::wire::LivePollReq;
use corral_core::Job;

use crate::runner::Worker;

/// How long the follower naps when it has caught up with the file.
const FOLLOW_PAUSE: Duration = Duration::from_millis(100);

/// Long-poll the coordinator for reader interest and answer each request
/// with a live-send upload.
pub async fn poll_for_output(worker: Arc<Worker>) {
    loop {
        let job: Option<Job> = match worker
            .client
            .call("/box-livepoll", &LivePollReq { id: worker.id.clone() })
            .await
        {
            Ok(job) => job,
            Err(e) => {
                // Normally this is a long poll and reconnecting immediately
                // is right; an error can come back fast, so don't hammer.
                error!("live poll: {e:#}");
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        };
        let Some(job) = job else {
            continue;
        };
        tokio::spawn(send_output(worker.clone(), job));

        // Give the send a moment to consume the request before polling
        // again; polling back instantly tends to pick up the same request,
        // and all but one of the resulting bodies would be dropped.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn send_output(worker: Arc<Worker>, job: Job) {
    let Some(cur) = worker.current().filter(|c| c.job == job) else {
        info!("{job}: live output requested but the job is not running here");
        return;
    };
    let file = match tokio::fs::File::open(&cur.path).await {
        Ok(f) => f,
        Err(e) => {
            error!("{job}: opening output file: {e}");
            return;
        }
    };

    let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(8);
    tokio::spawn(follow(worker.clone(), cur.path, file, tx));
    let body = reqwest::Body::wrap_stream(ReceiverStream::new(rx));
    if let Err(e) = worker.client.live_send(&worker.id, &job, body).await {
        error!("{job}: sending live output: {e:#}");
    }
}

/// Tail the output file: read to EOF, and as long as the worker is still
/// writing this file, wait for more. Ends when the file is drained and no
/// longer current, or when the receiving side hangs up.
async fn follow(
    worker: Arc<Worker>,
    path: PathBuf,
    mut file: tokio::fs::File,
    tx: mpsc::Sender<std::io::Result<Bytes>>,
) {
    let mut buf = vec![0u8; 4096];
    loop {
        let running = worker.is_current_output(&path);
        match file.read(&mut buf).await {
            Ok(0) => {
                if !running {
                    return; // drained, and the job has moved on
                }
                tokio::time::sleep(FOLLOW_PAUSE).await;
            }
            Ok(n) => {
                if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                    return; // reader hung up
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }
}

/// Unique output-file name for a job. The directory is folded into a single
/// path component with the JSON-Pointer escaping trick.
pub fn output_file_name(job: &Job) -> String {
    format!(
        "{}-{}-{}.{}.output",
        job.sha,
        encode_dir(&job.dir),
        job.name,
        uuid::Uuid::new_v4().simple()
    )
}

fn encode_dir(dir: &str) -> String {
    dir.replace('~', "~0").replace('/', "~1")
}

/// First line of the reader that looks like a compiler error, trimmed.
/// Used to enrich failure descriptions.
pub fn scan_error<R: BufRead>(r: R) -> Option<String> {
    r.lines()
        .map_while(|line| line.ok())
        .map(|line| line.trim().to_string())
        .find(|line| looks_like_error(line))
}

/// Whether a line has the shape of a compiler error: either the
/// TypeScript-toolchain `ERROR: ` prefix, or the traditional
/// `file:line: message` with no spaces in the file part and no
/// `warning:` in the message.
pub fn looks_like_error(line: &str) -> bool {
    if line.starts_with("ERROR: ") {
        return true;
    }
    let Some((file, rest)) = line.split_once(':') else {
        return false;
    };
    let Some((num, tail)) = rest.split_once(':') else {
        return false;
    };
    if file.contains(' ') {
        return false;
    }
    num.parse::<i64>().is_ok() && !tail.contains("warning:")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looks_like_error_table() {
        let cases = [
            ("path/to/file.ext:123: any text here", true),
            ("path/to/file.ext:123x: bad line number", false),
            ("path/to/file.ext: 123: space before number", false),
            ("path/to/file.ext:123 no second colon", false),
            ("text with spaces:123: rest of line", false),
            ("path/to/file.ext:123: warning: any text here", false),
            ("ERROR: path/to/file.ts[4, 3]: message here", true),
        ];
        for (line, want) in cases {
            assert_eq!(looks_like_error(line), want, "looks_like_error({line:?})");
        }
    }

    #[test]
    fn scan_error_finds_first_match() {
        let output = "\
building things
  path/with/indent.go:7: undefined: foo
path/other.go:9: another problem
";
        assert_eq!(
            scan_error(output.as_bytes()),
            Some("path/with/indent.go:7: undefined: foo".to_string())
        );
    }

    #[test]
    fn scan_error_skips_clean_output() {
        assert_eq!(scan_error("all fine\nok\n".as_bytes()), None);
    }

    #[test]
    fn encode_dir_folds_slashes() {
        assert_eq!(encode_dir("/"), "~1");
        assert_eq!(encode_dir("/a/b"), "~1a~1b");
        assert_eq!(encode_dir("/x~y"), "~1x~0y");
    }

    #[test]
    fn output_file_names_are_unique_per_call() {
        let job = Job {
            sha: "abc".into(),
            dir: "/a".into(),
            name: "t".into(),
        };
        let a = output_file_name(&job);
        let b = output_file_name(&job);
        assert!(a.starts_with("abc-~1a-t."));
        assert!(a.ends_with(".output"));
        assert_ne!(a, b);
    }
}

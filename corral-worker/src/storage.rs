//! Archived-output upload.
//!
//! Finished jobs publish their output file to an S3-style bucket with a
//! public-read ACL, and the returned URL travels with the run status so the
//! result page can serve it back.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use reqwest::header;

pub struct OutputStore {
    http: reqwest::Client,
    bucket: String,
}

impl OutputStore {
    pub fn new(bucket: String) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("corral-worker")
            .timeout(Duration::from_secs(60))
            .build()
            .expect("building http client");
        OutputStore { http, bucket }
    }

    /// PUT the output file for public reading. The worker id in the key
    /// keeps re-runs of the same job from clobbering each other.
    pub async fn upload(&self, path: &Path, worker_id: &str) -> Result<String> {
        ensure!(!self.bucket.is_empty(), "no output bucket configured (S3_BUCKET)");

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .context("output path has no file name")?;
        let key = format!("testbot/{file_name}.{worker_id}");
        let url = format!("https://{}.s3.amazonaws.com/{key}", self.bucket);

        let body = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let resp = self
            .http
            .put(&url)
            .header("x-amz-acl", "public-read")
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .context("uploading output")?;
        if !resp.status().is_success() {
            bail!("uploading output: {}", resp.status());
        }
        Ok(url)
    }
}

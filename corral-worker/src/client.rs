//! HTTP plumbing to the coordinator.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::{header, Client};
use serde::de::DeserializeOwned;
use serde::Serialize;

use corral_core::wire::PingReq;
use corral_core::Job;

pub struct CoordinatorClient {
    base: String,
    /// Shared client for control calls. The timeout sits above the
    /// coordinator's 25 s long-poll ceiling.
    http: Client,
    /// Untimed client for live-output uploads, which last as long as the
    /// job they are tailing.
    stream: Client,
}

impl CoordinatorClient {
    pub fn new(base: String) -> Self {
        let http = Client::builder()
            .user_agent("corral-worker")
            .timeout(Duration::from_secs(30))
            .build()
            .expect("building http client");
        let stream = Client::builder()
            .user_agent("corral-worker")
            .build()
            .expect("building streaming http client");
        CoordinatorClient {
            base: base.trim_end_matches('/').to_string(),
            http,
            stream,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    /// POST a JSON body and decode a JSON response.
    pub async fn call<In, Out>(&self, path: &str, body: &In) -> Result<Out>
    where
        In: Serialize + ?Sized,
        Out: DeserializeOwned,
    {
        let url = self.url(path);
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {path}"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("POST {path}: {status}: {text}");
        }
        resp.json()
            .await
            .with_context(|| format!("decoding {path} response"))
    }

    /// POST a JSON body and ignore the response body.
    pub async fn post<In>(&self, path: &str, body: &In) -> Result<()>
    where
        In: Serialize + ?Sized,
    {
        let url = self.url(path);
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {path}"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("POST {path}: {status}: {text}");
        }
        Ok(())
    }

    /// Ping must answer quickly or not at all; a worker that cannot reach
    /// the coordinator is better off dead.
    pub async fn ping(&self, req: &PingReq) -> Result<()> {
        let url = self.url("/box-ping");
        let resp = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(10))
            .json(req)
            .send()
            .await
            .context("POST /box-ping")?;
        if !resp.status().is_success() {
            bail!("POST /box-ping: {}", resp.status());
        }
        Ok(())
    }

    /// Stream a job's output file to the coordinator for a waiting browser.
    pub async fn live_send(&self, id: &str, job: &Job, body: reqwest::Body) -> Result<()> {
        let resp = self
            .stream
            .post(self.url("/box-livesend"))
            .header("Box-ID", id)
            .header("Job-SHA", &job.sha)
            .header("Job-Dir", &job.dir)
            .header("Job-Name", &job.name)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .context("POST /box-livesend")?;
        if !resp.status().is_success() {
            bail!("POST /box-livesend: {}", resp.status());
        }
        Ok(())
    }
}

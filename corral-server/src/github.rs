//! Minimal GitHub API client: commit statuses, PR file listings, raw file
//! contents, and the webhook subscription. Authenticates with a plain
//! personal-access or installation token.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::{header, Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use corral_core::{Job, Status};

/// Separates directory and test name in the status context, so the code
/// host renders one check per job.
pub const EN_SPACE: char = '\u{2002}';

/// GitHub truncates status descriptions beyond this many bytes.
const MAX_DESCRIPTION: usize = 140;

const API_BASE: &str = "https://api.github.com";

/// Accept header that makes the contents endpoint return the raw file.
const ACCEPT_RAW: &str = "application/vnd.github.raw+json";

#[derive(Debug, Clone, Deserialize)]
pub struct PrSummary {
    pub number: i64,
    pub head: PrHead,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrHead {
    pub sha: String,
}

#[derive(Debug, Deserialize)]
struct PrFile {
    filename: String,
}

pub struct GitHubClient {
    client: Client,
    token: String,
    org: String,
    repo: String,
}

impl GitHubClient {
    pub fn new(token: String, org: String, repo: String) -> Self {
        let client = Client::builder()
            .user_agent("corral")
            .timeout(Duration::from_secs(30))
            .build()
            .expect("building http client");
        GitHubClient {
            client,
            token,
            org,
            repo,
        }
    }

    fn repo_url(&self, path: &str) -> String {
        format!("{API_BASE}/repos/{}/{}/{path}", self.org, self.repo)
    }

    /// Browser URL of a file blob at a commit. `path` is absolute within
    /// the repository.
    pub fn blob_url(&self, sha: &str, path: &str) -> String {
        format!("https://github.com/{}/{}/blob/{sha}{path}", self.org, self.repo)
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>> {
        let resp = self
            .client
            .get(url)
            .header(header::AUTHORIZATION, format!("token {}", self.token))
            .header(header::ACCEPT, ACCEPT_RAW)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(
                resp.json().await.with_context(|| format!("decoding {url}"))?,
            )),
            s => {
                let body = resp.text().await.unwrap_or_default();
                bail!("GET {url}: {s}: {body}")
            }
        }
    }

    /// Fetch every page of a list endpoint. `path` must not already carry
    /// query parameters. Returns None when the resource 404s.
    async fn get_all<T: DeserializeOwned>(&self, path: &str) -> Result<Option<Vec<T>>> {
        let mut out = Vec::new();
        for page in 1.. {
            let url = format!("{}?per_page=100&page={page}", self.repo_url(path));
            let Some(items) = self.get::<Vec<T>>(&url).await? else {
                return Ok(None);
            };
            let last = items.len() < 100;
            out.extend(items);
            if last {
                break;
            }
        }
        Ok(Some(out))
    }

    /// Changed file paths of a PR, repo-relative. None means the API does
    /// not know the PR yet (it can 404 right after delivering the event).
    pub async fn pr_files(&self, num: i64) -> Result<Option<Vec<String>>> {
        let files: Option<Vec<PrFile>> = self.get_all(&format!("pulls/{num}/files")).await?;
        Ok(files.map(|fs| fs.into_iter().map(|f| f.filename).collect()))
    }

    /// All open PRs.
    pub async fn open_prs(&self) -> Result<Vec<PrSummary>> {
        self.get_all("pulls")
            .await?
            .context("listing open pull requests: not found")
    }

    /// Raw contents of a file at a commit, or None when the file does not
    /// exist there. `path` is absolute within the repository.
    pub async fn file_contents(&self, path: &str, sha: &str) -> Result<Option<String>> {
        let url = format!(
            "{}?ref={sha}",
            self.repo_url(&format!("contents/{}", path.trim_start_matches('/')))
        );
        let resp = self
            .client
            .get(&url)
            .header(header::AUTHORIZATION, format!("token {}", self.token))
            .header(header::ACCEPT, ACCEPT_RAW)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(resp.text().await?)),
            s => {
                let body = resp.text().await.unwrap_or_default();
                bail!("GET {url}: {s}: {body}")
            }
        }
    }

    /// Subscribe to pull-request events via PubSubHubbub, which unlike the
    /// hooks API is idempotent.
    pub async fn create_hook(&self, callback: &str, secret: &str) -> Result<()> {
        let topic = format!(
            "https://github.com/{}/{}/events/pull_request.json",
            self.org, self.repo
        );
        let form = [
            ("hub.mode", "subscribe"),
            ("hub.topic", topic.as_str()),
            ("hub.callback", callback),
            ("hub.secret", secret),
        ];
        let url = format!("{API_BASE}/hub");
        let resp = self
            .client
            .post(&url)
            .header(header::AUTHORIZATION, format!("token {}", self.token))
            .form(&form)
            .send()
            .await
            .context("subscribing to pull-request events")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "unable to create hook; check GITHUB_ORG [{}] and GITHUB_REPO [{}]: {status}: {body}",
                self.org,
                self.repo
            );
        }
        Ok(())
    }

    /// Post a commit status for a job. The description is middle-abbreviated
    /// to GitHub's limit and the context identifies the job as
    /// `<dir><en-space><name>`. A failed post is retried once after a short
    /// pause before the error surfaces.
    pub async fn post_status(
        &self,
        job: &Job,
        state: Status,
        desc: &str,
        target_url: &str,
    ) -> Result<()> {
        let mut body = HashMap::new();
        body.insert("state", state.as_str().to_string());
        body.insert("target_url", target_url.to_string());
        body.insert("description", abbrev_middle(desc, MAX_DESCRIPTION));
        body.insert("context", format!("{}{EN_SPACE}{}", job.dir, job.name));

        let url = self.repo_url(&format!("statuses/{}", job.sha));
        match self.post_status_once(&url, &body).await {
            Ok(()) => Ok(()),
            Err(_) => {
                tokio::time::sleep(Duration::from_millis(250)).await;
                self.post_status_once(&url, &body).await
            }
        }
    }

    async fn post_status_once(&self, url: &str, body: &HashMap<&str, String>) -> Result<()> {
        let resp = self
            .client
            .post(url)
            .header(header::AUTHORIZATION, format!("token {}", self.token))
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("POST {url}: {status}: {text}");
        }
        Ok(())
    }
}

/// Shorten `s` to at most `n` bytes by replacing a chunk in the middle with
/// `"..."` (itself truncated when `n < 3`). Splits land on character
/// boundaries, shrinking the kept halves when necessary, so the bound holds
/// for any input.
pub fn abbrev_middle(s: &str, n: usize) -> String {
    if s.len() <= n {
        return s.to_string();
    }
    let dots = &"..."[..3.min(n)];
    let keep = n - dots.len();
    let mut head = (keep + 1) / 2;
    while !s.is_char_boundary(head) {
        head -= 1;
    }
    let mut tail = s.len() - keep / 2;
    while !s.is_char_boundary(tail) {
        tail += 1;
    }
    format!("{}{}{}", &s[..head], dots, &s[tail..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn abbrev_middle_table() {
        let cases = [
            ("", 0, ""),
            ("x", 0, ""),
            ("x", 1, "x"),
            ("xx", 1, "."),
            ("xx", 2, "xx"),
            ("xxx", 2, ".."),
            ("xxx", 3, "xxx"),
            ("xxxx", 3, "..."),
            ("xxxx", 4, "xxxx"),
            ("xxxxx", 4, "x..."),
            ("xxxxx", 5, "xxxxx"),
            ("xxxxxx", 5, "x...x"),
        ];
        for (s, n, want) in cases {
            assert_eq!(abbrev_middle(s, n), want, "abbrev_middle({s:?}, {n})");
        }
    }

    proptest! {
        #[test]
        fn abbrev_middle_respects_the_bound(s in ".{0,200}", n in 0usize..200) {
            prop_assert!(abbrev_middle(&s, n).len() <= n);
        }
    }
}

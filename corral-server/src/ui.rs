//! Browser-facing pages: the index, archived results, live views, and the
//! cancel/retry form posts.
//!
//! Pages are plain preformatted HTML assembled by hand. The result and live
//! pages stream: the shell renders first so the retry/cancel buttons appear
//! even with poor connectivity to the output source, and the job output is
//! appended HTML-escaped as it arrives.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tokio_stream::wrappers::ReceiverStream;

use corral_core::wire::{CancelReq, RetryReq};
use corral_core::{parse_job, Job, Status};

use crate::store::ResultRow;
use crate::{AppError, AppState, RENDEZVOUS_TIMEOUT};

pub async fn index(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let workers = state.store.list_workers().await?;
    let jobs = state.store.list_jobs().await?;
    let results = state.store.list_results(200).await?;
    let states = state.cache.snapshot();
    let now = now_unix();

    let mut page = page_header("corral");
    page.push_str("<b>corral</b> <a href=guide.txt>guide.txt</a>\n");

    page.push_str("\n<b>workers</b>\n");
    if workers.is_empty() {
        page.push_str("(none)\n");
    }
    for w in &workers {
        page.push_str(&format!(
            "{} {} {}\n",
            escape_html(&w.id),
            escape_html(&w.host),
            reltime(w.last_seen_at, now)
        ));
    }

    page.push_str("\n<b>assignments</b>\n");
    let mut assigned: Vec<_> = states
        .values()
        .filter_map(|s| s.job.as_ref().map(|j| (s.id.clone(), j.clone())))
        .collect();
    assigned.sort_by(|a, b| a.0.cmp(&b.0));
    if assigned.is_empty() {
        page.push_str("(none)\n");
    }
    for (id, job) in &assigned {
        page.push_str(&format!("{} {}\n", escape_html(id), escape_html(&job.to_string())));
    }

    page.push_str("\n<b>jobs</b>\n");
    if jobs.is_empty() {
        page.push_str("(none)\n");
    }
    for job in &jobs {
        page.push_str(&format!("{}\n", escape_html(&job.to_string())));
    }

    page.push_str(&format!(
        "\n<b>results</b> (just the last {} of them)\n",
        results.len()
    ));
    for r in &results {
        push_result_line(&mut page, r, now);
    }

    Ok(html(page))
}

pub async fn result_page(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    let Some(row) = state.store.get_result(id).await? else {
        return Ok((StatusCode::NOT_FOUND, "no such result").into_response());
    };

    let mut shell = page_header(&job_title(&row.job));
    shell.push_str(&format!("<b>{}</b>\n", escape_html(&job_title(&row.job))));
    push_pr_links(&mut shell, &state, &row.pr);
    shell.push_str("<form method=post action=/retry><input type=submit value=retry></form>\n");
    if !row.trace_url.is_empty() {
        shell.push_str(&format!(
            "<a href=\"{}\">trace</a>\n",
            escape_html(&row.trace_url)
        ));
    }
    shell.push_str("<b>output</b>\n");

    if row.url.is_empty() {
        shell.push_str("sorry, no output is available for this test");
        return Ok(html(shell));
    }

    // Proxy the archived output so it lands on the same page, escaped.
    let resp = match state.http.get(&row.url).send().await {
        Ok(resp) => resp,
        Err(e) => {
            shell.push_str(&escape_html(&format!("fetching output: {e}")));
            return Ok(html(shell));
        }
    };
    let head = stream::once(async move { Ok::<_, Infallible>(Bytes::from(shell)) });
    let tail = resp.bytes_stream().map(|frame| match frame {
        Ok(bytes) => Ok(escape_html_bytes(&bytes)),
        Err(e) => Ok(Bytes::from(format!("\nfetching output: {e}\n"))),
    });
    Ok(html_stream(head.chain(tail)))
}

pub async fn live_page(
    State(state): State<Arc<AppState>>,
    Path(rest): Path<String>,
) -> Result<Response, AppError> {
    let job = match parse_job(&rest) {
        Ok(job) => job,
        Err(e) => return Ok(bad_request(e.to_string())),
    };

    let is_live = state.store.job_is_live(job.clone()).await?;
    let prs = state.store.prs_for_head(job.sha.clone()).await?;
    let results = state.store.job_results(job.clone()).await?;
    let now = now_unix();

    let mut shell = page_header(&job_title(&job));
    shell.push_str(&format!("<b>{}</b>\n", escape_html(&job_title(&job))));
    push_pr_links(&mut shell, &state, &prs);
    if is_live {
        shell.push_str("<form method=post action=/cancel><input type=submit value=cancel></form>\n");
    }
    shell.push_str("\n<b>past results</b>\n");
    if results.is_empty() {
        shell.push_str("(none)\n");
    }
    for r in &results {
        push_result_line(&mut shell, r, now);
    }
    shell.push_str("\n<b>output</b>\n");

    if !is_live {
        shell.push_str("(there is no such job currently live.)\n");
        return Ok(html(shell));
    }
    let Some(worker_id) = state.cache.find_worker(&job) else {
        shell.push_str("in queue\n");
        return Ok(html(shell));
    };

    match state.live.get(&worker_id, &job, RENDEZVOUS_TIMEOUT).await {
        None => {
            shell.push_str("fetching output: the worker did not answer in time\n");
            Ok(html(shell))
        }
        Some(rx) => {
            let head = stream::once(async move { Ok::<_, Infallible>(Bytes::from(shell)) });
            let tail = ReceiverStream::new(rx).map(|bytes| Ok(escape_html_bytes(&bytes)));
            let eof = stream::once(async { Ok(Bytes::from_static(b"\n<b>eof</b>\n")) });
            Ok(html_stream(head.chain(tail).chain(eof)))
        }
    }
}

/// Operator cancellation. The target job comes from the live page's Referer
/// header when the form is used, or from a JSON body otherwise.
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let prefix = state.self_url("live/");
    let job = if let Some(tail) = referer_tail(&headers, &prefix) {
        match parse_job(&tail) {
            Ok(job) => job,
            Err(e) => return Ok(bad_request(format!("bad referer: {e}"))),
        }
    } else {
        match serde_json::from_slice::<CancelReq>(&body) {
            Ok(req) => req.job,
            Err(e) => return Ok(bad_request(format!("bad request body: {e}"))),
        }
    };

    state
        .store
        .mark_done(
            job,
            Status::Error,
            "canceled by operator".to_string(),
            String::new(),
            String::new(),
            0,
        )
        .await?;
    Ok(StatusCode::OK.into_response())
}

/// Re-queue a completed result's job and land the operator on its live view.
pub async fn retry(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let prefix = state.self_url("result/");
    let result_id = if let Some(tail) = referer_tail(&headers, &prefix) {
        match tail.parse::<i64>() {
            Ok(id) => id,
            Err(e) => return Ok(bad_request(format!("bad referer: {e}"))),
        }
    } else {
        match serde_json::from_slice::<RetryReq>(&body) {
            Ok(req) => req.result_id,
            Err(e) => return Ok(bad_request(format!("bad request body: {e}"))),
        }
    };

    let Some(job) = state.store.retry_result(result_id).await? else {
        return Ok((StatusCode::NOT_FOUND, "no such result").into_response());
    };
    let url = state.self_url(&format!("live/{job}"));
    Ok(Redirect::to(&url).into_response())
}

pub async fn guide() -> Response {
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], GUIDE).into_response()
}

pub async fn stylesheet() -> Response {
    ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], CSS).into_response()
}

pub async fn script() -> Response {
    ([(header::CONTENT_TYPE, "text/javascript; charset=utf-8")], JS).into_response()
}

fn referer_tail(headers: &HeaderMap, prefix: &str) -> Option<String> {
    headers
        .get(header::REFERER)
        .and_then(|v| v.to_str().ok())
        .and_then(|r| r.strip_prefix(prefix))
        .map(|s| s.to_string())
}

fn job_title(job: &Job) -> String {
    let sha8 = &job.sha[..job.sha.len().min(8)];
    format!("{sha8} {} {}", job.dir, job.name)
}

fn push_pr_links(page: &mut String, state: &AppState, prs: &[i64]) {
    for num in prs {
        let url = format!(
            "https://github.com/{}/{}/pull/{num}",
            state.config.github_org, state.config.github_repo
        );
        page.push_str(&format!("<a href=\"{url}\">{url}</a>\n"));
    }
}

fn push_result_line(page: &mut String, r: &ResultRow, now: i64) {
    let sha8 = &r.job.sha[..r.job.sha.len().min(8)];
    let elapsed = format!("{}ms", r.elapsed_ms);
    page.push_str(&format!(
        "<time datetime={}>{:>8}</time> <a href=/result/{}>result</a>{}{}",
        r.created_at,
        reltime(r.created_at, now),
        r.id,
        pad(&elapsed),
        elapsed,
    ));
    if r.state == "success" {
        page.push_str(" ok ");
    } else {
        page.push_str(" <b>fail</b> ");
    }
    page.push_str(&format!(
        "{sha8} {} {}",
        escape_html(&r.job.dir),
        escape_html(&r.job.name)
    ));
    if r.state != "success" {
        page.push_str(&format!(" <b>{}</b>", escape_html(&r.descr)));
    }
    page.push('\n');
}

fn page_header(title: &str) -> String {
    // The <pre> element stays open: the result and live pages append output
    // after the shell, so nothing can come after it.
    format!(
        "<!doctype html>\n\
         <meta name=viewport content=\"initial-scale=1\">\n\
         <title>{}</title>\n\
         <link rel=stylesheet href=/static/a.css>\n\
         <script src=/static/a.js async></script>\n\
         <pre style=\"white-space: pre-wrap\">\n",
        escape_html(title)
    )
}

fn html(page: String) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/html; charset=utf-8"),
            (header::CONTENT_LANGUAGE, "en"),
        ],
        page,
    )
        .into_response()
}

fn html_stream<S>(stream: S) -> Response
where
    S: futures::Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    Response::builder()
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .header(header::CONTENT_LANGUAGE, "en")
        .body(Body::from_stream(stream))
        .expect("building streaming response")
}

fn bad_request(msg: String) -> Response {
    (StatusCode::BAD_REQUEST, msg).into_response()
}

pub fn escape_html_bytes(b: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(b.len());
    for &c in b {
        match c {
            b'&' => out.extend_from_slice(b"&amp;"),
            b'<' => out.extend_from_slice(b"&lt;"),
            b'>' => out.extend_from_slice(b"&gt;"),
            b'"' => out.extend_from_slice(b"&#34;"),
            b'\'' => out.extend_from_slice(b"&#39;"),
            _ => out.push(c),
        }
    }
    Bytes::from(out)
}

pub fn escape_html(s: &str) -> String {
    String::from_utf8(escape_html_bytes(s.as_bytes()).to_vec())
        .expect("escaping preserves utf-8")
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Approximate age of a unix timestamp. More than 90 days ago collapses to
/// the absolute month and year.
fn reltime(t: i64, now: i64) -> String {
    const MIN: i64 = 60;
    const HOUR: i64 = 60 * MIN;
    const DAY: i64 = 24 * HOUR;

    let d = now - t;
    if d < 5 {
        return "<5s ago".to_string();
    }
    if d < 2 * MIN {
        return format!("{}s ago", round_div(d, 1));
    }
    if d < 2 * HOUR {
        return format!("{}m ago", round_div(d, MIN));
    }
    if d < 2 * DAY {
        return format!("{}h ago", round_div(d, HOUR));
    }
    if d < 90 * DAY {
        return format!("{}d ago", round_div(d, DAY));
    }
    match chrono::DateTime::from_timestamp(t, 0) {
        Some(when) => when.format("%b %Y").to_string(),
        None => "long ago".to_string(),
    }
}

fn round_div(n: i64, unit: i64) -> i64 {
    (n + unit / 2) / unit
}

/// Spaces needed to pad `s` out to six columns.
fn pad(s: &str) -> &'static str {
    const SP: &str = "      ";
    if s.len() >= SP.len() {
        return "";
    }
    &SP[..SP.len() - s.len()]
}

const GUIDE: &str = r#"corral guide

corral runs a set of tests on every commit of every open
pull request, before it lands. For any open pull request
it runs tests on the head commit of the branch and
reports the results as commit statuses, which the code
host shows as a green check or red cross on the commit
and at the bottom of the pull request page. When a new
commit is pushed to the branch, the old head becomes
obsolete: corral cancels its remaining tests and starts
on the new head.

Quick start

To add a test, create a file named Testfile in the
directory where the test should run. The test runs
whenever any file changes in the tree rooted at that
directory. A Testfile looks like this:

    # this is a Testfile
    npmtest: npm test
    gotest: go test ./...

Testfile format

Each line defines one test: an alphanumeric name, a
colon, and a shell command. Blank lines and lines
starting with # are ignored. The command runs under
bash with -e and -o pipefail, in the Testfile's
directory, with a three-minute time limit.

The name "setup" is special: its command is not a test,
but runs before any test whose directory is at or below
the setup entry's directory. Use it to build artifacts
your tests depend on. Setup commands in a directory and
all of its ancestors run before the test, in no
guaranteed order.

Pages

The index lists workers, current assignments, queued
jobs and recent results. Every commit status links to a
live view that tails the test's output while it runs;
finished tests link to their archived output. The live
page has a cancel button; the result page has a retry
button.
"#;

const CSS: &str = "\
pre { font-size: 11pt }\n\
time { color: #777 }\n\
b { font-weight: 600 }\n\
";

const JS: &str = r#"
const s=1000, m=60*s, h=60*m, a=24*h;
const month = [
	"Jan", "Feb", "Mar", "Apr", "May", "Jun",
	"Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

function reltime(t) {
	const d = Date.now() - t.getTime();
	if (d < 5*s) return '<5s ago';
	if (d < 2*m) return Math.round(d/s) + 's ago';
	if (d < 2*h) return Math.round(d/m) + 'm ago';
	if (d < 2*a) return Math.round(d/h) + 'h ago';
	if (d < 90*a) return Math.round(d/a) + 'd ago';
	return month[t.getMonth()] + ' ' + t.getFullYear();
}

function update() {
	for (const e of document.querySelectorAll('time[datetime]')) {
		const s = reltime(new Date(1000 * e.dateTime));
		const p = ' '.repeat(Math.max(0, 8 - s.length));
		e.innerText = p + s;
	}
}

setInterval(update, 5*s);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_html_escapes_markup() {
        assert_eq!(escape_html("a<b>&\"'c"), "a&lt;b&gt;&amp;&#34;&#39;c");
        assert_eq!(escape_html("plain"), "plain");
    }

    #[test]
    fn reltime_table() {
        const MIN: i64 = 60;
        const HOUR: i64 = 60 * MIN;
        const DAY: i64 = 24 * HOUR;
        let now = 1_700_000_000;
        let cases: &[(i64, &str)] = &[
            (2, "<5s ago"),
            (5, "5s ago"),
            (119, "119s ago"),
            (2 * MIN, "2m ago"),
            (150 * 60, "3h ago"),
            (3 * MIN, "3m ago"),
            (5 * MIN, "5m ago"),
            (119 * MIN, "119m ago"),
            (2 * HOUR, "2h ago"),
            (5 * HOUR, "5h ago"),
            (24 * HOUR, "24h ago"),
            (2 * DAY, "2d ago"),
            (5 * DAY, "5d ago"),
            (14 * DAY, "14d ago"),
        ];
        for (ago, want) in cases {
            assert_eq!(reltime(now - ago, now), *want, "reltime(now - {ago})");
        }
    }

    #[test]
    fn reltime_falls_back_to_month_and_year() {
        // 2021-01-01 seen from ~2023: far past the 90 day cutoff
        assert_eq!(reltime(1_609_459_200, 1_700_000_000), "Jan 2021");
    }

    #[test]
    fn pad_table() {
        assert_eq!(pad(""), "      ");
        assert_eq!(pad("5ms"), "   ");
        assert_eq!(pad("123456"), "");
        assert_eq!(pad("1234567"), "");
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single test execution: one named entry of one Testfile at one commit.
///
/// `dir` is always absolute within the repository (`/` for the root). The
/// string form is `<sha><dir>/<name>`, with `dir` rendered as the empty
/// string when it is the root, so `parse_job` and `Display` are inverses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Job {
    pub sha: String,
    pub dir: String,
    pub name: String,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = if self.dir == "/" { "" } else { &self.dir };
        write!(f, "{}{}/{}", self.sha, dir, self.name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobParseError {
    #[error("bad job")]
    NoSlash,
    #[error("bad job: non-hex char in commit hash")]
    BadSha,
    #[error("bad job: no name")]
    NoName,
}

/// Parse the `<sha>/<dir...>/<name>` form used in live-view URLs.
pub fn parse_job(s: &str) -> Result<Job, JobParseError> {
    let i = s.find('/').ok_or(JobParseError::NoSlash)?;
    let sha = &s[..i];
    if !sha.bytes().all(|c| c.is_ascii_hexdigit()) {
        return Err(JobParseError::BadSha);
    }
    // The rest starts with '/', so rfind always hits.
    let rest = &s[i..];
    let j = rest.rfind('/').expect("rest starts with a slash");
    let name = &rest[j + 1..];
    if name.is_empty() {
        return Err(JobParseError::NoName);
    }
    let dir = rest[..j].trim_end_matches('/');
    let dir = if dir.is_empty() { "/" } else { dir };
    Ok(Job {
        sha: sha.to_string(),
        dir: dir.to_string(),
        name: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn job(sha: &str, dir: &str, name: &str) -> Job {
        Job {
            sha: sha.into(),
            dir: dir.into(),
            name: name.into(),
        }
    }

    #[test]
    fn parse_job_ok() {
        let cases = [
            ("91ac/meta", job("91ac", "/", "meta")),
            ("91ac/core/gotest", job("91ac", "/core", "gotest")),
            ("91ac/cmd/ledgerd/gotest", job("91ac", "/cmd/ledgerd", "gotest")),
        ];
        for (s, want) in cases {
            assert_eq!(parse_job(s).unwrap(), want, "parse_job({s:?})");
        }
    }

    #[test]
    fn parse_job_bad() {
        for s in ["91ac", "91ac/", "91ac/meta/", "foo/meta"] {
            assert!(parse_job(s).is_err(), "parse_job({s:?}) should fail");
        }
    }

    #[test]
    fn display_round_trip() {
        for s in ["91ac/meta", "91ac/core/gotest", "91ac/cmd/ledgerd/gotest"] {
            assert_eq!(parse_job(s).unwrap().to_string(), s);
        }
    }

    proptest! {
        #[test]
        fn parse_then_display_is_identity(
            sha in "[0-9a-f]{4,40}",
            dirs in proptest::collection::vec("[a-z][a-z0-9]{0,5}", 0..4),
            name in "[A-Za-z0-9_]{1,8}",
        ) {
            let dir = if dirs.is_empty() {
                String::new()
            } else {
                format!("/{}", dirs.join("/"))
            };
            let s = format!("{sha}{dir}/{name}");
            let j = parse_job(&s).unwrap();
            prop_assert_eq!(j.to_string(), s);
        }
    }
}

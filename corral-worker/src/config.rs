use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

#[derive(Clone)]
pub struct Config {
    pub coordinator_url: String,
    pub github_org: String,
    pub github_repo: String,
    /// Bucket for archived output. Empty means uploads will fail, which
    /// turns every job into an error; set it in any real deployment.
    pub bucket: String,
    /// Wiped and recreated on every boot.
    pub root_dir: PathBuf,
    /// Prepended to PATH for test commands; tools installed by setup tasks
    /// land here.
    pub bin_dir: PathBuf,
}

fn required(key: &str) -> Result<String> {
    env::var(key).with_context(|| format!("{key} environment variable is required"))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let home = env::var("HOME")
            .map(PathBuf::from)
            .context("HOME environment variable is required")?;
        Ok(Config {
            coordinator_url: required("CORRAL_URL")?,
            github_org: required("GITHUB_ORG")?,
            github_repo: required("GITHUB_REPO")?,
            bucket: env::var("S3_BUCKET").unwrap_or_default(),
            root_dir: home.join("worker"),
            bin_dir: home.join("bin"),
        })
    }

    pub fn ws_dir(&self) -> PathBuf {
        self.root_dir.join("ws")
    }

    pub fn out_dir(&self) -> PathBuf {
        self.root_dir.join("out")
    }

    /// The local clone the jobs run in.
    pub fn repo_dir(&self) -> PathBuf {
        self.ws_dir().join(&self.github_repo)
    }

    pub fn repo_url(&self) -> String {
        format!(
            "https://github.com/{}/{}.git",
            self.github_org, self.github_repo
        )
    }
}

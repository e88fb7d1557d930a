use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

#[derive(Clone)]
pub struct Config {
    /// Public base URL of this coordinator. Status target URLs and the
    /// webhook callback are built from it.
    pub base_url: String,
    pub listen_addr: String,
    /// Path of the SQLite assignment store.
    pub database_path: PathBuf,
    /// Shared secret for webhook HMAC verification.
    pub hook_secret: String,
    pub github_org: String,
    pub github_repo: String,
    pub github_token: String,
}

fn required(key: &str) -> Result<String> {
    env::var(key).with_context(|| format!("{key} environment variable is required"))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let base_url = required("CORRAL_URL")?;
        let listen_addr = env::var("LISTEN").unwrap_or_else(|_| "0.0.0.0:1994".to_string());
        let database_path = env::var("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("corral.db"));
        let hook_secret = required("HOOK_SECRET")?;
        let github_org = required("GITHUB_ORG")?;
        let github_repo = required("GITHUB_REPO")?;
        let github_token = required("GITHUB_TOKEN")?;

        Ok(Config {
            base_url,
            listen_addr,
            database_path,
            hook_secret,
            github_org,
            github_repo,
            github_token,
        })
    }
}

//! Terminal-status reporter: drains results that have not yet been posted
//! to the code host.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, warn};

use corral_core::Status;

use crate::AppState;

/// Post a terminal commit status for every unreported result, pointing at
/// its archived result page. A result is marked reported only once the code
/// host accepted the post; anything that fails stays unreported and is
/// retried on the next `report` wake-up.
pub async fn report_results(state: &Arc<AppState>) -> Result<()> {
    let rows = state
        .store
        .unreported_results()
        .await
        .context("querying unreported results")?;

    let mut reported = Vec::new();
    for row in rows {
        let status: Status = match row.state.parse() {
            Ok(status) => status,
            Err(e) => {
                warn!("result {}: {e}", row.id);
                continue;
            }
        };
        let url = state.self_url(&format!("result/{}", row.id));
        if let Err(e) = state.github.post_status(&row.job, status, &row.descr, &url).await {
            error!("posting status for result {}: {e:#}", row.id);
            continue; // keep going; this one stays unreported
        }
        reported.push(row.id);
    }

    state
        .store
        .mark_reported(reported)
        .await
        .context("marking results reported")
}

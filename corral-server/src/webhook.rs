//! The `/pr-hook` endpoint: HMAC-verified pull-request events.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::post,
    Json, Router,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{error, info};

use crate::{intake, AppError, AppState};

#[derive(Debug, Deserialize)]
pub struct PrEvent {
    /// `opened`, `reopened`, `synchronize` and `closed` matter; the event
    /// stream also carries labeling, review and edit actions we ignore.
    pub action: Option<String>,
    #[serde(rename = "pull_request")]
    pub pr: Option<PrObj>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrObj {
    pub number: i64,
    pub head: PrHead,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrHead {
    pub sha: String,
}

type HmacSha256 = Hmac<Sha256>;

fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(signature_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(signature_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    // constant-time comparison
    mac.verify_slice(&signature_bytes).is_ok()
}

async fn verify_hook_signature(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let signature = parts
        .headers
        .get("x-hub-signature-256")
        .and_then(|h| h.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !verify_signature(&state.config.hook_secret, &bytes, signature) {
        error!("invalid webhook signature");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let request = Request::from_parts(parts, axum::body::Body::from(bytes));
    Ok(next.run(request).await)
}

async fn pr_hook(
    State(state): State<Arc<AppState>>,
    Json(ev): Json<PrEvent>,
) -> Result<StatusCode, AppError> {
    match (ev.action.as_deref(), ev.pr) {
        (Some("opened") | Some("reopened") | Some("synchronize"), Some(pr)) => {
            info!(pr = pr.number, head = %pr.head.sha, "pull request updated");
            intake::populate_jobs(&state, pr.number, pr.head.sha).await?;
        }
        (Some("closed"), Some(pr)) => {
            info!(pr = pr.number, "pull request closed");
            state.store.delete_pr(pr.number).await?;
        }
        _ => {} // uninteresting action
    }
    Ok(StatusCode::OK)
}

pub fn webhook_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/pr-hook", post(pr_hook))
        .layer(middleware::from_fn_with_state(state, verify_hook_signature))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_verifies() {
        let secret = "It's a Secret to Everybody";
        let payload = b"Hello, World!";
        // example pair from GitHub's webhook documentation
        let sig = "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17";
        assert!(verify_signature(secret, payload, sig));
    }

    #[test]
    fn signature_rejects_tampering() {
        let secret = "It's a Secret to Everybody";
        let sig = "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17";
        assert!(!verify_signature(secret, b"Hello, World", sig));
        assert!(!verify_signature("wrong", b"Hello, World!", sig));
        assert!(!verify_signature(secret, b"Hello, World!", "sha256=zz"));
        assert!(!verify_signature(secret, b"Hello, World!", "md5=abc"));
    }

    #[test]
    fn event_parses_without_optional_fields() {
        let ev: PrEvent = serde_json::from_str(r#"{"action":"labeled"}"#).unwrap();
        assert_eq!(ev.action.as_deref(), Some("labeled"));
        assert!(ev.pr.is_none());
    }
}

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{info, warn};

use crate::gateway::{AuthenticatedRequester, GatewayRequest, PROJECT_HEADER};
use crate::types::ClaimOutcome;

/// Build the claim body. The lock function expects its input as a JSON
/// string nested under `data`, not as a JSON object.
pub fn claim_body(question_id: &str) -> Result<String> {
    let inner = serde_json::to_string(&json!({ "questionId": question_id }))
        .context("failed to encode claim input")?;
    serde_json::to_string(&json!({ "data": inner })).context("failed to encode claim body")
}

/// Fires claim requests through the session. One attempt per call.
pub struct ClaimExecutor<R> {
    requester: Arc<R>,
    claim_url: String,
    project_id: String,
    dry_run: bool,
}

impl<R: AuthenticatedRequester> ClaimExecutor<R> {
    pub fn new(requester: Arc<R>, claim_url: String, project_id: String, dry_run: bool) -> Self {
        Self {
            requester,
            claim_url,
            project_id,
            dry_run,
        }
    }

    /// Attempt to lock `question_id`. Never fails: every error ends up in
    /// the returned outcome.
    pub async fn claim(&self, question_id: &str) -> ClaimOutcome {
        let mut outcome = ClaimOutcome {
            timestamp: chrono::Utc::now().to_rfc3339(),
            question_id: question_id.to_string(),
            success: false,
            status: None,
            error_msg: None,
            dry_run: self.dry_run,
        };

        let body = match claim_body(question_id) {
            Ok(b) => b,
            Err(e) => {
                warn!("Claim {question_id} not sent: {e:#}");
                outcome.error_msg = Some(format!("{e:#}"));
                return outcome;
            }
        };

        if self.dry_run {
            info!("[dry-run] Would lock {question_id} via {} with {body}", self.claim_url);
            outcome.success = true;
            return outcome;
        }

        let request = GatewayRequest::post_json(self.claim_url.as_str(), body)
            .header(PROJECT_HEADER, self.project_id.as_str());

        match self.requester.execute(request).await {
            Ok(resp) => {
                outcome.status = Some(resp.status);
                if resp.is_success() {
                    info!("LOCKED {question_id} (status: {})", resp.status);
                    outcome.success = true;
                } else {
                    warn!("Lock failed for {question_id} (status: {})", resp.status);
                    outcome.error_msg = Some(format!("status: {}", resp.status));
                }
            }
            Err(e) => {
                warn!("Lock error for {question_id}: {e:#}");
                outcome.error_msg = Some(format!("{e:#}"));
            }
        }

        outcome
    }
}

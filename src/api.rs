use anyhow::{Context, Result};
use tracing::debug;
use url::Url;

use crate::gateway::{AuthenticatedRequester, GatewayRequest, PROJECT_HEADER};
use crate::types::{DocumentList, Identity};

/// Resolve the account id of the current session.
pub async fn fetch_identity<R: AuthenticatedRequester>(
    requester: &R,
    account_url: &str,
    project_id: &str,
) -> Result<String> {
    let resp = requester
        .execute(GatewayRequest::get(account_url).header(PROJECT_HEADER, project_id))
        .await?;
    let identity: Identity = resp.json().context("identity lookup failed")?;
    debug!("Session identity: {}", identity.id);
    Ok(identity.id)
}

/// Build the question list URL filtered to documents locked by `user_id`.
pub fn locked_by_query_url(questions_url: &str, user_id: &str) -> Result<Url> {
    let mut url = Url::parse(questions_url)
        .with_context(|| format!("invalid questions URL {questions_url}"))?;
    url.query_pairs_mut().append_pair(
        "queries[0]",
        &format!(r#"equal("lockedBy",["{user_id}"])"#),
    );
    Ok(url)
}

/// Count the questions currently locked by `user_id`.
pub async fn count_locked_by<R: AuthenticatedRequester>(
    requester: &R,
    questions_url: &str,
    project_id: &str,
    user_id: &str,
) -> Result<u64> {
    let url = locked_by_query_url(questions_url, user_id)?;
    let resp = requester
        .execute(GatewayRequest::get(url.as_str()).header(PROJECT_HEADER, project_id))
        .await?;
    let list: DocumentList = resp.json().context("lock query failed")?;
    debug!("{} question(s) locked by {user_id}", list.total);
    Ok(list.total)
}

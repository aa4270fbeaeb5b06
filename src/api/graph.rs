//! Continuation-token pagination over Graph listings.

use serde::Deserialize;
use tracing::{debug, warn};

use super::client::{DevOpsApi, parse_body};
use super::transport::ApiRequest;
use crate::error::ReconcileResult;

/// API version for the Graph family.
pub const GRAPH_API_VERSION: &str = "7.1-preview.1";

/// Response header carrying the next page token.
pub const CONTINUATION_HEADER: &str = "x-ms-continuationtoken";

/// Upper bound on pages requested by one search.
pub const MAX_PAGES: usize = 100;

/// A Graph subject (user, group, scope), reduced to the fields we consume.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GraphSubject {
    pub descriptor: Option<String>,
    pub display_name: Option<String>,
    pub principal_name: Option<String>,
    pub origin: Option<String>,
    pub origin_id: Option<String>,
    pub subject_kind: Option<String>,
    pub domain: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    value: Vec<GraphSubject>,
}

/// Scans `list_url` page by page and returns the first subject accepted by
/// `predicate`.
///
/// A non-success page ends the scan as "not found". The predicate sees every
/// subject in order, so it may also collect diagnostics.
pub async fn find_first_matching<F>(
    api: &DevOpsApi,
    list_url: &str,
    predicate: F,
) -> ReconcileResult<Option<GraphSubject>>
where
    F: FnMut(&GraphSubject) -> bool,
{
    find_first_matching_within(api, list_url, MAX_PAGES, predicate).await
}

/// [`find_first_matching`] with an explicit page guard.
pub async fn find_first_matching_within<F>(
    api: &DevOpsApi,
    list_url: &str,
    max_pages: usize,
    mut predicate: F,
) -> ReconcileResult<Option<GraphSubject>>
where
    F: FnMut(&GraphSubject) -> bool,
{
    let mut token: Option<String> = None;

    for page_number in 1..=max_pages {
        let url = match &token {
            Some(token) => format!(
                "{list_url}{}continuationToken={}",
                if list_url.contains('?') { '&' } else { '?' },
                urlencoding::encode(token)
            ),
            None => list_url.to_string(),
        };

        let response = api.send(ApiRequest::get(url)).await?;
        if !response.is_success() {
            debug!(status = response.status, page = page_number, "Graph listing ended");
            return Ok(None);
        }

        let page: Page = parse_body(&response, list_url)?;
        if let Some(found) = page.value.into_iter().find(|subject| predicate(subject)) {
            return Ok(Some(found));
        }

        token = response
            .header(CONTINUATION_HEADER)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        if token.is_none() {
            return Ok(None);
        }
    }

    warn!(url = list_url, max_pages, "Stopped Graph search at the page limit");
    Ok(None)
}

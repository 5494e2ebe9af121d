//! The seam between the generic sync engine and provider-specific paging.

use async_trait::async_trait;

use crate::client::{ApiClient, ClientError};

/// One remote object in provider-neutral shape. `last_modified` is
/// milliseconds since epoch and drives the replace-on-newer cache rule.
#[derive(Debug, Clone)]
pub struct RemoteItem {
    pub id: String,
    pub kind: String,
    pub title: Option<String>,
    pub body: String,
    pub url: Option<String>,
    pub author_id: Option<String>,
    pub parent_id: Option<String>,
    pub last_modified: i64,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Default)]
pub struct CollectionPage {
    pub items: Vec<RemoteItem>,
    /// Pagination cursor for the next page within this pass; `None` ends
    /// the pass.
    pub next_cursor: Option<String>,
}

/// Parameters for one page fetch.
#[derive(Debug, Clone, Copy)]
pub struct PageRequest<'a> {
    /// Within-pass pagination cursor, from the previous page's
    /// `next_cursor`.
    pub page_cursor: Option<&'a str>,
    /// The persisted sync cursor: only items modified after this point are
    /// wanted. `None` means a full pass.
    pub modified_since: Option<&'a str>,
    pub page_size: usize,
}

/// A paged remote collection (channel messages, workspace pages, team
/// rosters). Implementations own their wire format and their cursor
/// encoding; the engine treats both as opaque.
#[async_trait]
pub trait RemoteCollection: Send + Sync {
    /// Stable key for cursor and cache rows, e.g. `slack:messages:C042`.
    fn key(&self) -> String;

    async fn fetch_page(
        &self,
        client: &ApiClient,
        account_id: &str,
        request: PageRequest<'_>,
    ) -> Result<CollectionPage, ClientError>;

    /// The sync cursor to persist after a pass that applied `items`
    /// cleanly. The default encodes the newest `last_modified` seen,
    /// falling back to the previous cursor when the pass was empty.
    fn next_sync_cursor(&self, items: &[RemoteItem], previous: Option<&str>) -> Option<String> {
        items
            .iter()
            .map(|item| item.last_modified)
            .max()
            .map(|ms| ms.to_string())
            .or_else(|| previous.map(String::from))
    }
}

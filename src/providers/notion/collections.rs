//! The Notion workspace page collection, backed by `/v1/search`.

use async_trait::async_trait;

use crate::client::{ApiClient, ClientError};
use crate::sync::{CollectionPage, PageRequest, RemoteCollection, RemoteItem};

use super::types::NotionSearchResponse;

/// Every page the integration can see. Search has no modified-since
/// parameter, so incremental passes sort by `last_edited_time` descending
/// and filter client-side.
pub struct NotionPagesCollection;

#[async_trait]
impl RemoteCollection for NotionPagesCollection {
    fn key(&self) -> String {
        "notion:pages".into()
    }

    async fn fetch_page(
        &self,
        client: &ApiClient,
        account_id: &str,
        request: PageRequest<'_>,
    ) -> Result<CollectionPage, ClientError> {
        let mut body = serde_json::json!({
            "filter": { "property": "object", "value": "page" },
            "sort": { "direction": "descending", "timestamp": "last_edited_time" },
            "page_size": request.page_size,
        });
        if let Some(cursor) = request.page_cursor {
            body["start_cursor"] = serde_json::Value::String(cursor.to_string());
        }

        let response: NotionSearchResponse =
            client.post_json(account_id, "/v1/search", &body).await?;

        let since = request
            .modified_since
            .and_then(|cursor| cursor.parse::<i64>().ok());

        let mut exhausted_window = false;
        let items: Vec<RemoteItem> = response
            .results
            .into_iter()
            .filter(|page| !page.archived)
            .filter(|page| match since {
                Some(since) => {
                    let fresh = page.last_edited_millis() > since;
                    if !fresh {
                        exhausted_window = true;
                    }
                    fresh
                }
                None => true,
            })
            .map(|page| RemoteItem {
                id: page.id.clone(),
                kind: "page".into(),
                title: page.title(),
                body: page.text_content(),
                url: page.url.clone(),
                author_id: None,
                parent_id: page.parent_id(),
                last_modified: page.last_edited_millis(),
                metadata: None,
            })
            .collect();

        // Results are newest-first, so the first stale page means the rest
        // of the listing is stale too; stop paging early.
        let next_cursor = if exhausted_window {
            None
        } else {
            response.next_cursor.filter(|_| response.has_more)
        };

        Ok(CollectionPage { items, next_cursor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_key() {
        assert_eq!(NotionPagesCollection.key(), "notion:pages");
    }
}

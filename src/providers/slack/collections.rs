//! Slack collections: the channel roster and per-channel message history.

use async_trait::async_trait;

use crate::client::{ApiClient, ClientError};
use crate::sync::{CollectionPage, PageRequest, RemoteCollection, RemoteItem};

use super::types::{
    check_ok, ts_to_millis, ConversationsHistoryResponse, ConversationsListResponse,
};

/// The workspace's channel roster. Slack has no modified-since filter for
/// `conversations.list`, so incremental passes filter on the channel's
/// `updated` stamp client-side.
pub struct SlackChannelsCollection;

#[async_trait]
impl RemoteCollection for SlackChannelsCollection {
    fn key(&self) -> String {
        "slack:channels".into()
    }

    async fn fetch_page(
        &self,
        client: &ApiClient,
        account_id: &str,
        request: PageRequest<'_>,
    ) -> Result<CollectionPage, ClientError> {
        let mut path = format!(
            "/conversations.list?limit={}&types=public_channel,private_channel",
            request.page_size
        );
        if let Some(cursor) = request.page_cursor {
            path.push_str("&cursor=");
            path.push_str(&urlencoding::encode(cursor));
        }

        let response: ConversationsListResponse = client.get_json(account_id, &path).await?;
        check_ok(response.ok, response.error)?;

        let since = request
            .modified_since
            .and_then(|cursor| cursor.parse::<i64>().ok());

        let items = response
            .channels
            .into_iter()
            .filter(|channel| match (since, channel.updated) {
                (Some(since), Some(updated)) => updated > since,
                _ => true,
            })
            .map(|channel| {
                let name = channel.name.unwrap_or_else(|| channel.id.clone());
                let body = channel
                    .topic
                    .map(|t| t.value)
                    .or(channel.purpose.map(|p| p.value))
                    .unwrap_or_default();
                RemoteItem {
                    id: channel.id,
                    kind: "channel".into(),
                    title: Some(format!("#{}", name)),
                    body,
                    url: None,
                    author_id: None,
                    parent_id: None,
                    last_modified: channel.updated.unwrap_or(0),
                    metadata: Some(serde_json::json!({
                        "is_private": channel.is_private,
                        "is_im": channel.is_im,
                        "num_members": channel.num_members,
                    })),
                }
            })
            .collect();

        Ok(CollectionPage {
            items,
            next_cursor: response.response_metadata.and_then(|m| m.cursor()),
        })
    }
}

/// Message history of one channel. The sync cursor is the newest message
/// timestamp in milliseconds; Slack's `oldest` parameter does the
/// incremental filtering server-side.
pub struct SlackMessagesCollection {
    channel_id: String,
}

impl SlackMessagesCollection {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
        }
    }
}

#[async_trait]
impl RemoteCollection for SlackMessagesCollection {
    fn key(&self) -> String {
        format!("slack:messages:{}", self.channel_id)
    }

    async fn fetch_page(
        &self,
        client: &ApiClient,
        account_id: &str,
        request: PageRequest<'_>,
    ) -> Result<CollectionPage, ClientError> {
        let mut path = format!(
            "/conversations.history?channel={}&limit={}",
            urlencoding::encode(&self.channel_id),
            request.page_size
        );
        if let Some(since) = request.modified_since {
            if let Ok(ms) = since.parse::<i64>() {
                path.push_str(&format!("&oldest={}", millis_to_ts(ms)));
            }
        }
        if let Some(cursor) = request.page_cursor {
            path.push_str("&cursor=");
            path.push_str(&urlencoding::encode(cursor));
        }

        let response: ConversationsHistoryResponse = client.get_json(account_id, &path).await?;
        check_ok(response.ok, response.error)?;

        let channel_id = self.channel_id.clone();
        let items = response
            .messages
            .into_iter()
            .map(|message| RemoteItem {
                id: message.ts.clone(),
                kind: "message".into(),
                title: None,
                body: message.text.unwrap_or_default(),
                url: None,
                author_id: message.user,
                parent_id: message.thread_ts.or_else(|| Some(channel_id.clone())),
                last_modified: ts_to_millis(&message.ts),
                metadata: message
                    .subtype
                    .map(|subtype| serde_json::json!({ "subtype": subtype })),
            })
            .collect();

        Ok(CollectionPage {
            items,
            next_cursor: response.response_metadata.and_then(|m| m.cursor()),
        })
    }
}

/// Back to Slack's fractional-seconds timestamp format.
fn millis_to_ts(ms: i64) -> String {
    format!("{}.{:03}000", ms / 1000, ms % 1000)
}

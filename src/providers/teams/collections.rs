//! Teams collections: the joined-team roster and per-channel messages.

use async_trait::async_trait;

use crate::client::{ApiClient, ClientError};
use crate::sync::{CollectionPage, PageRequest, RemoteCollection, RemoteItem};

use super::types::{GraphChannelMessage, GraphList, GraphTeam};

/// Teams the signed-in user belongs to. Graph offers no delta filter here;
/// the roster is small, so every pass lists it and relies on the
/// replace-on-newer cache rule.
pub struct TeamsJoinedCollection;

#[async_trait]
impl RemoteCollection for TeamsJoinedCollection {
    fn key(&self) -> String {
        "teams:joined".into()
    }

    async fn fetch_page(
        &self,
        client: &ApiClient,
        account_id: &str,
        request: PageRequest<'_>,
    ) -> Result<CollectionPage, ClientError> {
        let path = match request.page_cursor {
            Some(cursor) => cursor.to_string(),
            None => "/v1.0/me/joinedTeams".to_string(),
        };

        let list: GraphList<GraphTeam> = client.get_json(account_id, &path).await?;
        let next_cursor = list.next_path(client.base_url());

        let now = chrono::Utc::now().timestamp_millis();
        let items = list
            .value
            .into_iter()
            .map(|team| RemoteItem {
                id: team.id.clone(),
                kind: "team".into(),
                title: team.display_name,
                body: team.description.unwrap_or_default(),
                url: None,
                author_id: None,
                parent_id: None,
                // Graph does not stamp teams, so each pass refreshes the
                // whole roster.
                last_modified: now,
                metadata: None,
            })
            .collect();

        Ok(CollectionPage { items, next_cursor })
    }

    /// Roster passes carry no usable modified stamps, so the cursor stays
    /// wherever the pass began.
    fn next_sync_cursor(&self, _items: &[RemoteItem], previous: Option<&str>) -> Option<String> {
        previous.map(String::from)
    }
}

/// Message history of one channel in one team.
pub struct TeamsChannelMessagesCollection {
    team_id: String,
    channel_id: String,
}

impl TeamsChannelMessagesCollection {
    pub fn new(team_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            team_id: team_id.into(),
            channel_id: channel_id.into(),
        }
    }
}

#[async_trait]
impl RemoteCollection for TeamsChannelMessagesCollection {
    fn key(&self) -> String {
        format!("teams:messages:{}:{}", self.team_id, self.channel_id)
    }

    async fn fetch_page(
        &self,
        client: &ApiClient,
        account_id: &str,
        request: PageRequest<'_>,
    ) -> Result<CollectionPage, ClientError> {
        let path = match request.page_cursor {
            Some(cursor) => cursor.to_string(),
            None => format!(
                "/v1.0/teams/{}/channels/{}/messages?$top={}",
                self.team_id, self.channel_id, request.page_size
            ),
        };

        let list: GraphList<GraphChannelMessage> = client.get_json(account_id, &path).await?;
        let next_cursor = list.next_path(client.base_url());

        let since = request
            .modified_since
            .and_then(|cursor| cursor.parse::<i64>().ok());

        let items = list
            .value
            .into_iter()
            .filter(|message| match since {
                Some(since) => message.last_modified_millis() > since,
                None => true,
            })
            .map(|message| RemoteItem {
                author_id: message.author_id(),
                last_modified: message.last_modified_millis(),
                id: message.id,
                kind: "message".into(),
                title: None,
                body: message
                    .body
                    .and_then(|body| body.content)
                    .unwrap_or_default(),
                url: message.web_url,
                parent_id: message.reply_to_id.or_else(|| Some(self.channel_id.clone())),
                metadata: message
                    .message_type
                    .map(|kind| serde_json::json!({ "message_type": kind })),
            })
            .collect();

        Ok(CollectionPage { items, next_cursor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_keys() {
        assert_eq!(TeamsJoinedCollection.key(), "teams:joined");
        assert_eq!(
            TeamsChannelMessagesCollection::new("t1", "c9").key(),
            "teams:messages:t1:c9"
        );
    }

    #[test]
    fn test_roster_cursor_never_moves() {
        assert_eq!(
            TeamsJoinedCollection.next_sync_cursor(&[], Some("123")),
            Some("123".into())
        );
        assert_eq!(TeamsJoinedCollection.next_sync_cursor(&[], None), None);
    }
}

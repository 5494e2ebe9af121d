//! Microsoft Graph wire models.

use serde::Deserialize;

/// Graph's standard list envelope: a `value` array plus an absolute
/// `@odata.nextLink` URL when more pages exist.
#[derive(Debug, Deserialize)]
pub struct GraphList<T> {
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
}

impl<T> GraphList<T> {
    /// The next page as a path-and-query relative to the API base, which is
    /// what the client dispatches on.
    pub fn next_path(&self, base_url: &str) -> Option<String> {
        self.next_link
            .as_deref()
            .map(|link| link.strip_prefix(base_url).unwrap_or(link).to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphTeam {
    pub id: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphChannelMessage {
    pub id: String,
    pub message_type: Option<String>,
    pub created_date_time: Option<String>,
    pub last_modified_date_time: Option<String>,
    pub web_url: Option<String>,
    pub reply_to_id: Option<String>,
    pub body: Option<GraphItemBody>,
    pub from: Option<GraphIdentitySet>,
}

impl GraphChannelMessage {
    pub fn last_modified_millis(&self) -> i64 {
        self.last_modified_date_time
            .as_deref()
            .or(self.created_date_time.as_deref())
            .and_then(|stamp| chrono::DateTime::parse_from_rfc3339(stamp).ok())
            .map(|dt| dt.timestamp_millis())
            .unwrap_or(0)
    }

    pub fn author_id(&self) -> Option<String> {
        self.from
            .as_ref()
            .and_then(|from| from.user.as_ref())
            .map(|user| user.id.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphItemBody {
    pub content_type: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphIdentitySet {
    pub user: Option<GraphIdentity>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphIdentity {
    pub id: String,
    pub display_name: Option<String>,
}

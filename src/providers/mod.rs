//! Provider plugins: wire models, collections, and OAuth settings for each
//! supported remote service.

pub mod notion;
pub mod slack;
pub mod teams;

use crate::auth::OAuthConfig;
use crate::db::schema::ProviderKind;

/// API base URL for the provider's client.
pub fn base_url(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Slack => slack::SLACK_API_BASE,
        ProviderKind::Notion => notion::NOTION_API_BASE,
        ProviderKind::Teams => teams::GRAPH_API_BASE,
    }
}

/// Header the provider requires on every API request, if any.
pub fn api_version_header(kind: ProviderKind) -> Option<(&'static str, &'static str)> {
    match kind {
        ProviderKind::Notion => Some(("Notion-Version", notion::NOTION_API_VERSION)),
        _ => None,
    }
}

pub fn oauth_config(
    kind: ProviderKind,
    client_id: impl Into<String>,
    client_secret: impl Into<String>,
) -> OAuthConfig {
    match kind {
        ProviderKind::Slack => slack::oauth_config(client_id, client_secret),
        ProviderKind::Notion => notion::oauth_config(client_id, client_secret),
        ProviderKind::Teams => teams::oauth_config(client_id, client_secret),
    }
}

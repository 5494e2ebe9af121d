//! Slack plugin: Web API models, channel and message collections, OAuth
//! settings.

mod collections;
mod types;

pub use collections::{SlackChannelsCollection, SlackMessagesCollection};
pub use types::{
    ConversationsHistoryResponse, ConversationsListResponse, SlackChannel, SlackMessage,
};

use crate::auth::OAuthConfig;
use crate::db::schema::ProviderKind;

pub const SLACK_API_BASE: &str = "https://slack.com/api";
const SLACK_AUTHORIZE_URL: &str = "https://slack.com/oauth/v2/authorize";
const SLACK_TOKEN_URL: &str = "https://slack.com/api/oauth.v2.access";
const REDIRECT_PORT: u16 = 8374;

const USER_SCOPES: &str = "channels:history,channels:read,groups:history,groups:read,im:history,im:read,users:read,search:read";

/// Slack issues user tokens through the `user_scope` parameter and does not
/// support PKCE on this flow.
pub fn oauth_config(
    client_id: impl Into<String>,
    client_secret: impl Into<String>,
) -> OAuthConfig {
    OAuthConfig {
        provider: ProviderKind::Slack,
        client_id: client_id.into(),
        client_secret: client_secret.into(),
        authorize_url: SLACK_AUTHORIZE_URL.into(),
        token_url: SLACK_TOKEN_URL.into(),
        redirect_port: REDIRECT_PORT,
        authorize_params: vec![
            ("scope".into(), String::new()),
            ("user_scope".into(), USER_SCOPES.into()),
        ],
        use_pkce: false,
    }
}

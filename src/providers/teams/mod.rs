//! Microsoft Teams plugin: Graph API models, joined-team and
//! channel-message collections, OAuth settings.

mod collections;
mod types;

pub use collections::{TeamsChannelMessagesCollection, TeamsJoinedCollection};
pub use types::{GraphChannelMessage, GraphList, GraphTeam};

use crate::auth::OAuthConfig;
use crate::db::schema::ProviderKind;

pub const GRAPH_API_BASE: &str = "https://graph.microsoft.com";

const TEAMS_AUTHORIZE_URL: &str =
    "https://login.microsoftonline.com/common/oauth2/v2.0/authorize";
const TEAMS_TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";
const REDIRECT_PORT: u16 = 8376;

const SCOPES: &str = "offline_access User.Read Team.ReadBasic.All Channel.ReadBasic.All ChannelMessage.Read.All";

/// Azure AD supports (and for public clients expects) PKCE.
pub fn oauth_config(
    client_id: impl Into<String>,
    client_secret: impl Into<String>,
) -> OAuthConfig {
    OAuthConfig {
        provider: ProviderKind::Teams,
        client_id: client_id.into(),
        client_secret: client_secret.into(),
        authorize_url: TEAMS_AUTHORIZE_URL.into(),
        token_url: TEAMS_TOKEN_URL.into(),
        redirect_port: REDIRECT_PORT,
        authorize_params: vec![
            ("response_type".into(), "code".into()),
            ("response_mode".into(), "query".into()),
            ("scope".into(), SCOPES.into()),
        ],
        use_pkce: true,
    }
}

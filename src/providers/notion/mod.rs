//! Notion plugin: v1 API models, the workspace page collection, OAuth
//! settings.

mod collections;
mod types;

pub use collections::NotionPagesCollection;
pub use types::{NotionPage, NotionProperty, NotionSearchResponse};

use crate::auth::OAuthConfig;
use crate::db::schema::ProviderKind;

pub const NOTION_API_BASE: &str = "https://api.notion.com";
/// Sent as the `Notion-Version` header on every API call.
pub const NOTION_API_VERSION: &str = "2022-06-28";

const NOTION_AUTHORIZE_URL: &str = "https://api.notion.com/v1/oauth/authorize";
const NOTION_TOKEN_URL: &str = "https://api.notion.com/v1/oauth/token";
const REDIRECT_PORT: u16 = 8375;

pub fn oauth_config(
    client_id: impl Into<String>,
    client_secret: impl Into<String>,
) -> OAuthConfig {
    OAuthConfig {
        provider: ProviderKind::Notion,
        client_id: client_id.into(),
        client_secret: client_secret.into(),
        authorize_url: NOTION_AUTHORIZE_URL.into(),
        token_url: NOTION_TOKEN_URL.into(),
        redirect_port: REDIRECT_PORT,
        authorize_params: vec![
            ("owner".into(), "user".into()),
            ("response_type".into(), "code".into()),
        ],
        use_pkce: false,
    }
}

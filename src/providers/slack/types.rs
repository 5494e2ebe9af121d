//! Slack Web API wire models.
//!
//! Every Slack response carries an `ok` flag and reports failures inside a
//! 200 body; [`check_ok`] folds that envelope into the client error
//! taxonomy.

use serde::Deserialize;

use crate::client::ClientError;

#[derive(Debug, Deserialize)]
pub struct ConversationsListResponse {
    pub ok: bool,
    pub error: Option<String>,
    #[serde(default)]
    pub channels: Vec<SlackChannel>,
    pub response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct ConversationsHistoryResponse {
    pub ok: bool,
    pub error: Option<String>,
    #[serde(default)]
    pub messages: Vec<SlackMessage>,
    #[serde(default)]
    pub has_more: bool,
    pub response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseMetadata {
    pub next_cursor: Option<String>,
}

impl ResponseMetadata {
    /// Slack signals "no more pages" with an empty cursor string.
    pub fn cursor(self) -> Option<String> {
        self.next_cursor.filter(|cursor| !cursor.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackChannel {
    pub id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub is_im: bool,
    pub topic: Option<SlackTopic>,
    pub purpose: Option<SlackTopic>,
    pub num_members: Option<i64>,
    /// Seconds since epoch of the last channel-metadata change.
    pub updated: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackTopic {
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackMessage {
    /// Message timestamp, also its unique id within the channel, as
    /// `"1712345678.000200"`.
    pub ts: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub subtype: Option<String>,
    pub user: Option<String>,
    pub text: Option<String>,
    pub thread_ts: Option<String>,
}

/// Fold the Slack `ok`/`error` envelope into an error when the call failed.
pub fn check_ok(ok: bool, error: Option<String>) -> Result<(), ClientError> {
    if ok {
        return Ok(());
    }
    let code = error.unwrap_or_else(|| "unknown_error".into());
    Err(ClientError::Api {
        status: 200,
        message: format!("Slack API error: {}", code),
        code: Some(code),
    })
}

/// Slack `ts` values are epoch seconds with fractional precision.
pub fn ts_to_millis(ts: &str) -> i64 {
    ts.parse::<f64>().map(|secs| (secs * 1000.0) as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_response_decodes() {
        let json = r#"{
            "ok": true,
            "messages": [
                {"type": "message", "ts": "1712345678.000200", "user": "U1", "text": "hello"},
                {"type": "message", "ts": "1712345679.000300", "user": "U2", "text": "hi", "thread_ts": "1712345678.000200"}
            ],
            "has_more": true,
            "response_metadata": {"next_cursor": "bmV4dF90czo="}
        }"#;

        let response: ConversationsHistoryResponse = serde_json::from_str(json).unwrap();
        assert!(response.ok);
        assert_eq!(response.messages.len(), 2);
        assert_eq!(response.messages[1].thread_ts.as_deref(), Some("1712345678.000200"));
        assert_eq!(response.response_metadata.unwrap().cursor(), Some("bmV4dF90czo=".into()));
    }

    #[test]
    fn test_error_envelope() {
        let json = r#"{"ok": false, "error": "channel_not_found"}"#;
        let response: ConversationsHistoryResponse = serde_json::from_str(json).unwrap();

        let err = check_ok(response.ok, response.error).unwrap_err();
        match err {
            ClientError::Api { code, .. } => assert_eq!(code.as_deref(), Some("channel_not_found")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_empty_cursor_means_done() {
        let json = r#"{"ok": true, "messages": [], "response_metadata": {"next_cursor": ""}}"#;
        let response: ConversationsHistoryResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.response_metadata.unwrap().cursor(), None);
    }

    #[test]
    fn test_ts_to_millis() {
        assert_eq!(ts_to_millis("1712345678.000200"), 1_712_345_678_000);
        assert_eq!(ts_to_millis("not-a-ts"), 0);
    }
}

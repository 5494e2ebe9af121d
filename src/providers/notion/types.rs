//! Notion v1 API wire models.

use std::collections::HashMap;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct NotionSearchResponse {
    #[serde(default)]
    pub results: Vec<NotionPage>,
    #[serde(default)]
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotionPage {
    pub id: String,
    pub url: Option<String>,
    /// RFC 3339, e.g. `2024-04-05T13:45:00.000Z`.
    pub last_edited_time: String,
    pub created_time: Option<String>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub properties: HashMap<String, NotionProperty>,
    pub parent: Option<NotionParent>,
}

impl NotionPage {
    /// The page title: the plain text of its single `title` property.
    pub fn title(&self) -> Option<String> {
        self.properties.values().find_map(|property| match property {
            NotionProperty::Title { title } => Some(plain_text(title)),
            _ => None,
        })
    }

    /// Searchable text: the title plus every rich-text property. Block
    /// children are not fetched; properties are what search surfaces.
    pub fn text_content(&self) -> String {
        let mut parts = Vec::new();
        if let Some(title) = self.title() {
            parts.push(title);
        }
        for property in self.properties.values() {
            if let NotionProperty::RichText { rich_text } = property {
                let text = plain_text(rich_text);
                if !text.is_empty() {
                    parts.push(text);
                }
            }
        }
        parts.join("\n")
    }

    pub fn last_edited_millis(&self) -> i64 {
        chrono::DateTime::parse_from_rfc3339(&self.last_edited_time)
            .map(|dt| dt.timestamp_millis())
            .unwrap_or(0)
    }

    pub fn parent_id(&self) -> Option<String> {
        self.parent.as_ref().and_then(|parent| {
            parent
                .page_id
                .clone()
                .or_else(|| parent.database_id.clone())
        })
    }
}

/// Property payloads are tagged by their `type` field; only the text-bearing
/// variants matter here.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum NotionProperty {
    #[serde(rename = "title")]
    Title { title: Vec<NotionRichText> },
    #[serde(rename = "rich_text")]
    RichText { rich_text: Vec<NotionRichText> },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotionRichText {
    pub plain_text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotionParent {
    pub page_id: Option<String>,
    pub database_id: Option<String>,
}

fn plain_text(spans: &[NotionRichText]) -> String {
    spans
        .iter()
        .map(|span| span.plain_text.as_str())
        .collect::<Vec<_>>()
        .join("")
}

//! Projection of cache entries into the host shell's search index.
//!
//! The adapter is stateless: each applied cache entry is converted into a
//! [`SearchableDocument`] and handed to whatever [`SearchIndex`] the host
//! registered. Index failures are logged and swallowed; search is a
//! convenience layer and must never abort a sync pass.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sync::CacheEntry;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Index rejected document {0}")]
    Rejected(String),

    #[error("Index unavailable: {0}")]
    Unavailable(String),
}

/// Normalized unit of searchable content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchableDocument {
    /// Stable id, `{account_id}:{collection}:{remote_id}`.
    pub id: String,
    pub account_id: String,
    pub title: String,
    pub body: String,
    pub url: Option<String>,
    pub content_type: String,
    pub tags: Vec<String>,
    pub last_modified: i64,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub document: SearchableDocument,
    pub score: f64,
}

/// The host shell's search collaborator.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn index(&self, document: SearchableDocument) -> Result<(), IndexError>;

    /// Drop every document belonging to the account, used on disconnect.
    async fn remove_account(&self, account_id: &str) -> Result<(), IndexError>;

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, IndexError>;
}

/// Forwards applied cache entries into the search index.
pub struct Indexer {
    index: Arc<dyn SearchIndex>,
}

impl Indexer {
    pub fn new(index: Arc<dyn SearchIndex>) -> Self {
        Self { index }
    }

    /// Index one applied entry. Failures are logged, never propagated.
    pub async fn index_entry(&self, entry: &CacheEntry) {
        let document = document_for(entry);
        if let Err(e) = self.index.index(document).await {
            tracing::warn!(
                "Indexing {}:{}:{} failed: {}",
                entry.account_id,
                entry.collection,
                entry.remote_id,
                e
            );
        }
    }

    pub async fn remove_account(&self, account_id: &str) {
        if let Err(e) = self.index.remove_account(account_id).await {
            tracing::warn!("Removing account {} from index failed: {}", account_id, e);
        }
    }

    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, IndexError> {
        self.index.search(query, limit).await
    }
}

/// Deterministic projection: the same entry always yields the same document.
pub fn document_for(entry: &CacheEntry) -> SearchableDocument {
    let mut tags = vec![entry.kind.clone()];
    if let Some((provider, _)) = entry.collection.split_once(':') {
        tags.push(provider.to_string());
    }

    SearchableDocument {
        id: format!("{}:{}:{}", entry.account_id, entry.collection, entry.remote_id),
        account_id: entry.account_id.clone(),
        title: entry
            .title
            .clone()
            .unwrap_or_else(|| entry.body.chars().take(80).collect()),
        body: entry.body.clone(),
        url: entry.url.clone(),
        content_type: entry.kind.clone(),
        tags,
        last_modified: entry.last_modified,
    }
}

/// In-process reference index backing tests and the default runtime wiring
/// when the host has not registered its own.
#[derive(Default)]
pub struct MemoryIndex {
    documents: Mutex<HashMap<String, SearchableDocument>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn index(&self, document: SearchableDocument) -> Result<(), IndexError> {
        let mut documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        documents.insert(document.id.clone(), document);
        Ok(())
    }

    async fn remove_account(&self, account_id: &str) -> Result<(), IndexError> {
        let mut documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        documents.retain(|_, doc| doc.account_id != account_id);
        Ok(())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, IndexError> {
        let needle = query.to_lowercase();
        let documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());

        let mut hits: Vec<SearchHit> = documents
            .values()
            .filter_map(|doc| {
                let mut score = 0.0;
                if doc.title.to_lowercase().contains(&needle) {
                    score += 2.0;
                }
                if doc.body.to_lowercase().contains(&needle) {
                    score += 1.0;
                }
                (score > 0.0).then(|| SearchHit {
                    document: doc.clone(),
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.document.last_modified.cmp(&a.document.last_modified))
        });
        hits.truncate(limit);

        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry(remote_id: &str, title: Option<&str>, body: &str) -> CacheEntry {
        CacheEntry {
            account_id: "acct-1".into(),
            collection: "slack:messages:C1".into(),
            remote_id: remote_id.into(),
            kind: "message".into(),
            title: title.map(String::from),
            body: body.into(),
            url: None,
            author_id: None,
            parent_id: None,
            last_modified: 1000,
            metadata: None,
        }
    }

    #[test]
    fn test_document_projection_is_deterministic() {
        let e = entry("m1", Some("Standup notes"), "we shipped the thing");
        let a = document_for(&e);
        let b = document_for(&e);

        assert_eq!(a.id, "acct-1:slack:messages:C1:m1");
        assert_eq!(a.id, b.id);
        assert_eq!(a.title, b.title);
        assert!(a.tags.contains(&"slack".to_string()));
    }

    #[test]
    fn test_untitled_entry_falls_back_to_body_prefix() {
        let e = entry("m1", None, "quick question about the deploy");
        let doc = document_for(&e);
        assert_eq!(doc.title, "quick question about the deploy");
    }

    #[tokio::test]
    async fn test_memory_index_scores_title_over_body() {
        let index = MemoryIndex::new();
        index.index(document_for(&entry("m1", Some("deploy plan"), "notes"))).await.unwrap();
        index.index(document_for(&entry("m2", Some("lunch"), "deploy went fine"))).await.unwrap();

        let hits = index.search("deploy", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].document.id.ends_with(":m1"));
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_remove_account_scoped() {
        let index = MemoryIndex::new();
        index.index(document_for(&entry("m1", Some("a"), "x"))).await.unwrap();

        let mut other = entry("m2", Some("b"), "y");
        other.account_id = "acct-2".into();
        index.index(document_for(&other)).await.unwrap();

        index.remove_account("acct-1").await.unwrap();
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn test_indexer_swallows_failures() {
        struct Failing;

        #[async_trait]
        impl SearchIndex for Failing {
            async fn index(&self, doc: SearchableDocument) -> Result<(), IndexError> {
                Err(IndexError::Rejected(doc.id))
            }
            async fn remove_account(&self, _account_id: &str) -> Result<(), IndexError> {
                Ok(())
            }
            async fn search(&self, _q: &str, _l: usize) -> Result<Vec<SearchHit>, IndexError> {
                Ok(vec![])
            }
        }

        // Must not panic or propagate.
        let indexer = Indexer::new(Arc::new(Failing));
        indexer.index_entry(&entry("m1", None, "body")).await;
    }

    #[tokio::test]
    async fn test_indexer_forwards_each_entry() {
        struct Counting(AtomicUsize);

        #[async_trait]
        impl SearchIndex for Counting {
            async fn index(&self, _doc: SearchableDocument) -> Result<(), IndexError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            async fn remove_account(&self, _account_id: &str) -> Result<(), IndexError> {
                Ok(())
            }
            async fn search(&self, _q: &str, _l: usize) -> Result<Vec<SearchHit>, IndexError> {
                Ok(vec![])
            }
        }

        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let indexer = Indexer::new(counting.clone());
        indexer.index_entry(&entry("m1", None, "a")).await;
        indexer.index_entry(&entry("m2", None, "b")).await;
        assert_eq!(counting.0.load(Ordering::SeqCst), 2);
    }
}

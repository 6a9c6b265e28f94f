//! Document store abstraction consumed by the fetchers and the chain maintainer.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::entities::{DocumentKey, DocumentRecord, SiteKey};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found")]
    NotFound,
    /// Lost an optimistic-concurrency race; the whole operation may be retried.
    #[error("transaction conflicted with a concurrent write")]
    Conflict,
    #[error("document store unavailable: {message}")]
    Unavailable { message: String },
    #[error("stored document is corrupt: {message}")]
    Corrupt { message: String },
}

impl StoreError {
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            message: err.to_string(),
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CreatedOrder {
    #[default]
    Ascending,
    Descending,
}

/// Ancestor-scoped query with equality filters, ordered by creation time.
#[derive(Debug, Clone)]
pub struct DocumentQuery {
    pub site: SiteKey,
    pub published: Option<bool>,
    pub chain_member: Option<bool>,
    pub order: CreatedOrder,
    pub limit: Option<usize>,
}

impl DocumentQuery {
    pub fn new(site: &SiteKey) -> Self {
        Self {
            site: site.clone(),
            published: None,
            chain_member: None,
            order: CreatedOrder::Ascending,
            limit: None,
        }
    }

    /// Published chain members of `site`, oldest first.
    pub fn chain_members(site: &SiteKey) -> Self {
        Self::new(site).published(true).chain_member(true)
    }

    pub fn published(mut self, value: bool) -> Self {
        self.published = Some(value);
        self
    }

    pub fn chain_member(mut self, value: bool) -> Self {
        self.chain_member = Some(value);
        self
    }

    pub fn order(mut self, order: CreatedOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, doc: &DocumentRecord) -> bool {
        doc.key.site == self.site
            && self.published.is_none_or(|value| doc.published == value)
            && self.chain_member.is_none_or(|value| doc.chain_member == value)
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, key: &DocumentKey) -> Result<DocumentRecord, StoreError>;

    async fn put(&self, doc: &DocumentRecord) -> Result<(), StoreError>;

    async fn query(&self, query: &DocumentQuery) -> Result<Vec<DocumentRecord>, StoreError>;

    /// Open an optimistic transaction. Dropping it without `commit` discards its writes.
    async fn begin(&self) -> Result<Box<dyn DocumentTransaction>, StoreError>;
}

#[async_trait]
pub trait DocumentTransaction: Send {
    async fn get(&mut self, key: &DocumentKey) -> Result<DocumentRecord, StoreError>;

    async fn query(&mut self, query: &DocumentQuery) -> Result<Vec<DocumentRecord>, StoreError>;

    async fn put(&mut self, doc: &DocumentRecord) -> Result<(), StoreError>;

    /// Overwrite only the `prev`/`next` links of an existing document.
    ///
    /// Fails with [`StoreError::NotFound`] instead of recreating a document
    /// that has gone away; every other field is left as stored.
    async fn update_links(&mut self, doc: &DocumentRecord) -> Result<(), StoreError>;

    /// Apply buffered writes, failing with [`StoreError::Conflict`] when a
    /// concurrent write touched what this transaction read.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

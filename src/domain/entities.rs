//! Domain entities mirrored from persistent storage.

use std::fmt;

use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::domain::error::DomainError;

/// Documents modified this long after creation count as edited.
const EDITED_THRESHOLD: Duration = Duration::hours(12);

/// Ancestor scope under which a site's documents are grouped.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SiteKey(String);

impl SiteKey {
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("site key must not be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SiteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store identity of a document: a name scoped under its site.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DocumentKey {
    pub site: SiteKey,
    pub name: String,
}

impl DocumentKey {
    pub fn new(site: &SiteKey, name: impl Into<String>) -> Self {
        Self {
            site: site.clone(),
            name: name.into(),
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.site, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentRecord {
    pub key: DocumentKey,
    pub title: String,
    pub description: String,
    pub category: String,
    pub tags: Vec<String>,
    pub contents: String,
    pub created: OffsetDateTime,
    pub last_modified: OffsetDateTime,
    pub published: bool,
    /// Whether the document takes part in the chronological prev/next chain.
    pub chain_member: bool,
    pub prev: Option<DocumentKey>,
    pub next: Option<DocumentKey>,
}

impl DocumentRecord {
    /// A blank, unpublished document with both timestamps set to `now`.
    pub fn draft(key: DocumentKey, title: impl Into<String>, now: OffsetDateTime) -> Self {
        Self {
            key,
            title: title.into(),
            description: String::new(),
            category: String::new(),
            tags: Vec::new(),
            contents: String::new(),
            created: now,
            last_modified: now,
            published: false,
            chain_member: false,
            prev: None,
            next: None,
        }
    }

    /// Published and flagged as part of the ordered sequence.
    pub fn in_chain(&self) -> bool {
        self.published && self.chain_member
    }

    pub fn edited(&self) -> bool {
        self.last_modified - self.created > EDITED_THRESHOLD
    }

    /// The newest chain member is the only one without a successor.
    pub fn is_latest(&self) -> bool {
        self.next.is_none()
    }

    pub fn tag_list(&self) -> String {
        self.tags.join(", ")
    }
}

//! Chronological prev/next chain over published chain members.
//!
//! The functions here are pure: they take the chain members already loaded
//! from the store and decide which links are wrong. Persisting the result is
//! the job of [`crate::application::chain::ChainMaintainer`].

use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;

use crate::domain::entities::{DocumentKey, DocumentRecord};

/// Creation order with the document name as a deterministic tie-break.
pub fn chronological(a: &DocumentRecord, b: &DocumentRecord) -> Ordering {
    a.created
        .cmp(&b.created)
        .then_with(|| a.key.name.cmp(&b.key.name))
}

pub fn sort_chronologically(docs: &mut [DocumentRecord]) {
    docs.sort_by(chronological);
}

/// Rewrite `prev`/`next` on chronologically ordered chain members.
///
/// Returns the indexes of documents whose links changed, ascending and
/// without duplicates. An already-correct chain yields an empty vector.
pub fn plan_links(docs: &mut [DocumentRecord]) -> Vec<usize> {
    let mut changed = Vec::new();

    for index in 0..docs.len() {
        let desired_prev = index
            .checked_sub(1)
            .map(|before| docs[before].key.clone());
        let desired_next = docs.get(index + 1).map(|after| after.key.clone());

        let doc = &mut docs[index];
        let mut dirty = false;
        if doc.prev != desired_prev {
            doc.prev = desired_prev;
            dirty = true;
        }
        if doc.next != desired_next {
            doc.next = desired_next;
            dirty = true;
        }
        if dirty {
            changed.push(index);
        }
    }

    changed
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkField {
    Prev,
    Next,
}

impl fmt::Display for LinkField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prev => f.write_str("prev"),
            Self::Next => f.write_str("next"),
        }
    }
}

/// A stored link that disagrees with creation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainViolation {
    pub key: DocumentKey,
    pub field: LinkField,
    pub expected: Option<DocumentKey>,
    pub actual: Option<DocumentKey>,
}

impl fmt::Display for ChainViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |key: &Option<DocumentKey>| match key {
            Some(key) => key.name.clone(),
            None => "none".to_string(),
        };
        write!(
            f,
            "{}.{}: expected {}, found {}",
            self.key.name,
            self.field,
            show(&self.expected),
            show(&self.actual)
        )
    }
}

/// Report every link on chronologically ordered chain members that is wrong.
pub fn chain_violations(docs: &[DocumentRecord]) -> Vec<ChainViolation> {
    let mut violations = Vec::new();

    for (index, doc) in docs.iter().enumerate() {
        let expected_prev = index
            .checked_sub(1)
            .map(|before| docs[before].key.clone());
        let expected_next = docs.get(index + 1).map(|after| after.key.clone());

        if doc.prev != expected_prev {
            violations.push(ChainViolation {
                key: doc.key.clone(),
                field: LinkField::Prev,
                expected: expected_prev,
                actual: doc.prev.clone(),
            });
        }
        if doc.next != expected_next {
            violations.push(ChainViolation {
                key: doc.key.clone(),
                field: LinkField::Next,
                expected: expected_next,
                actual: doc.next.clone(),
            });
        }
    }

    violations
}

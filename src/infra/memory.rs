//! In-process document store with optimistic transactions.
//!
//! Every site scope carries a version that bumps on each committed write. A
//! transaction remembers the version of each scope it read and refuses to
//! commit if any of them moved, so two repairs of one site cannot both win.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::application::repos::{
    CreatedOrder, DocumentQuery, DocumentStore, DocumentTransaction, StoreError,
};
use crate::cache::lock::mutex_lock;
use crate::domain::chain::chronological;
use crate::domain::entities::{DocumentKey, DocumentRecord, SiteKey};

const SOURCE: &str = "infra::memory";

#[derive(Default)]
struct State {
    docs: BTreeMap<DocumentKey, DocumentRecord>,
    versions: HashMap<SiteKey, u64>,
    writes: u64,
}

impl State {
    fn version(&self, site: &SiteKey) -> u64 {
        self.versions.get(site).copied().unwrap_or(0)
    }

    fn store(&mut self, doc: DocumentRecord) {
        *self.versions.entry(doc.key.site.clone()).or_insert(0) += 1;
        self.docs.insert(doc.key.clone(), doc);
    }

    fn select<'a>(
        &'a self,
        query: &DocumentQuery,
        overlay: &'a BTreeMap<DocumentKey, DocumentRecord>,
    ) -> Vec<DocumentRecord> {
        let mut merged: BTreeMap<&DocumentKey, &DocumentRecord> = self
            .docs
            .range(scope_start(&query.site)..)
            .take_while(|(key, _)| key.site == query.site)
            .collect();
        for (key, doc) in overlay.range(scope_start(&query.site)..) {
            if key.site != query.site {
                break;
            }
            merged.insert(key, doc);
        }

        let mut selected: Vec<DocumentRecord> = merged
            .into_values()
            .filter(|doc| query.matches(doc))
            .cloned()
            .collect();

        selected.sort_by(|a, b| match query.order {
            CreatedOrder::Ascending => chronological(a, b),
            CreatedOrder::Descending => chronological(b, a),
        });
        if let Some(limit) = query.limit {
            selected.truncate(limit);
        }
        selected
    }
}

fn scope_start(site: &SiteKey) -> DocumentKey {
    DocumentKey::new(site, String::new())
}

#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    state: Arc<Mutex<State>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document. Bumps the scope version but is not counted as a write.
    pub fn insert(&self, doc: DocumentRecord) {
        mutex_lock(&self.state, SOURCE, "insert").store(doc);
    }

    /// Current committed copy of a document.
    pub fn document(&self, key: &DocumentKey) -> Option<DocumentRecord> {
        mutex_lock(&self.state, SOURCE, "document")
            .docs
            .get(key)
            .cloned()
    }

    /// Number of documents written through `put` or committed transactions.
    pub fn write_count(&self) -> u64 {
        mutex_lock(&self.state, SOURCE, "write_count").writes
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, key: &DocumentKey) -> Result<DocumentRecord, StoreError> {
        self.document(key).ok_or(StoreError::NotFound)
    }

    async fn put(&self, doc: &DocumentRecord) -> Result<(), StoreError> {
        let mut state = mutex_lock(&self.state, SOURCE, "put");
        state.store(doc.clone());
        state.writes += 1;
        Ok(())
    }

    async fn query(&self, query: &DocumentQuery) -> Result<Vec<DocumentRecord>, StoreError> {
        let state = mutex_lock(&self.state, SOURCE, "query");
        Ok(state.select(query, &BTreeMap::new()))
    }

    async fn begin(&self) -> Result<Box<dyn DocumentTransaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            read_versions: HashMap::new(),
            writes: BTreeMap::new(),
        }))
    }
}

struct MemoryTransaction {
    state: Arc<Mutex<State>>,
    read_versions: HashMap<SiteKey, u64>,
    writes: BTreeMap<DocumentKey, DocumentRecord>,
}

impl MemoryTransaction {
    fn observe(&mut self, state: &State, site: &SiteKey) {
        self.read_versions
            .entry(site.clone())
            .or_insert_with(|| state.version(site));
    }
}

#[async_trait]
impl DocumentTransaction for MemoryTransaction {
    async fn get(&mut self, key: &DocumentKey) -> Result<DocumentRecord, StoreError> {
        if let Some(doc) = self.writes.get(key) {
            return Ok(doc.clone());
        }
        let state = Arc::clone(&self.state);
        let state = mutex_lock(&state, SOURCE, "tx.get");
        self.observe(&state, &key.site);
        state.docs.get(key).cloned().ok_or(StoreError::NotFound)
    }

    async fn query(&mut self, query: &DocumentQuery) -> Result<Vec<DocumentRecord>, StoreError> {
        let state = Arc::clone(&self.state);
        let state = mutex_lock(&state, SOURCE, "tx.query");
        self.observe(&state, &query.site);
        Ok(state.select(query, &self.writes))
    }

    async fn put(&mut self, doc: &DocumentRecord) -> Result<(), StoreError> {
        self.writes.insert(doc.key.clone(), doc.clone());
        Ok(())
    }

    async fn update_links(&mut self, doc: &DocumentRecord) -> Result<(), StoreError> {
        let mut current = self.get(&doc.key).await?;
        current.prev = doc.prev.clone();
        current.next = doc.next.clone();
        self.writes.insert(current.key.clone(), current);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction {
            state,
            read_versions,
            writes,
        } = *self;
        let mut state = mutex_lock(&state, SOURCE, "tx.commit");

        let conflicted = read_versions
            .iter()
            .any(|(site, seen)| state.version(site) != *seen);
        if conflicted {
            return Err(StoreError::Conflict);
        }

        let written = writes.len() as u64;
        for doc in writes.into_values() {
            state.store(doc);
        }
        state.writes += written;
        Ok(())
    }
}

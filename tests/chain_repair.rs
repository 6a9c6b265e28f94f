use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use quire::application::chain::{ChainMaintainer, RepairReport, RetryPolicy, repair_with_retry};
use quire::application::repos::{
    DocumentQuery, DocumentStore, DocumentTransaction, StoreError,
};
use quire::domain::chain::LinkField;
use quire::domain::entities::{DocumentKey, DocumentRecord, SiteKey};
use quire::infra::memory::MemoryDocumentStore;
use time::{Duration, OffsetDateTime, macros::datetime};
use tokio::sync::Barrier;

const BASE: OffsetDateTime = datetime!(2024-01-01 00:00 UTC);

fn site() -> SiteKey {
    SiteKey::new("blog").expect("valid site key")
}

fn key(name: &str) -> DocumentKey {
    DocumentKey::new(&site(), name)
}

fn member(name: &str, hours: i64) -> DocumentRecord {
    let mut doc = DocumentRecord::draft(key(name), name, BASE + Duration::hours(hours));
    doc.published = true;
    doc.chain_member = true;
    doc
}

fn links(store: &MemoryDocumentStore, name: &str) -> (Option<String>, Option<String>) {
    let doc = store.document(&key(name)).expect("document exists");
    (doc.prev.map(|k| k.name), doc.next.map(|k| k.name))
}

fn named(prev: Option<&str>, next: Option<&str>) -> (Option<String>, Option<String>) {
    (prev.map(str::to_string), next.map(str::to_string))
}

fn seeded(docs: impl IntoIterator<Item = DocumentRecord>) -> Arc<MemoryDocumentStore> {
    let store = Arc::new(MemoryDocumentStore::new());
    for doc in docs {
        store.insert(doc);
    }
    store
}

#[tokio::test]
async fn empty_scope_is_a_noop() {
    let site = site();
    let store = seeded([]);
    let report = ChainMaintainer::new(store.clone())
        .repair_chain(&site)
        .await
        .expect("repair succeeds");

    assert_eq!(report, RepairReport::default());
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn single_member_loses_stale_links() {
    let site = site();
    let mut only = member("only", 0);
    only.prev = Some(key("ghost"));
    only.next = Some(key("ghost"));
    let store = seeded([only]);

    let report = ChainMaintainer::new(store.clone())
        .repair_chain(&site)
        .await
        .expect("repair succeeds");

    assert_eq!(report.updated, vec![key("only")]);
    assert_eq!(links(&store, "only"), named(None, None));
}

#[tokio::test]
async fn members_are_linked_in_creation_order_and_stay_linked() {
    let site = site();
    let store = seeded([member("c", 3), member("a", 1), member("b", 2)]);
    let maintainer = ChainMaintainer::new(store.clone());

    let report = maintainer.repair_chain(&site).await.expect("first repair");
    assert_eq!(report.members, 3);
    assert_eq!(report.updated, vec![key("a"), key("b"), key("c")]);
    assert_eq!(links(&store, "a"), named(None, Some("b")));
    assert_eq!(links(&store, "b"), named(Some("a"), Some("c")));
    assert_eq!(links(&store, "c"), named(Some("b"), None));

    let writes = store.write_count();
    let again = maintainer.repair_chain(&site).await.expect("second repair");
    assert!(again.is_noop());
    assert_eq!(store.write_count(), writes);
}

#[tokio::test]
async fn only_wrong_links_are_rewritten() {
    let site = site();
    let store = seeded([member("a", 1), member("b", 2)]);
    let maintainer = ChainMaintainer::new(store.clone());
    maintainer.repair_chain(&site).await.expect("initial repair");

    store.insert(member("c", 3));
    let report = maintainer.repair_chain(&site).await.expect("repair after append");

    assert_eq!(report.updated, vec![key("b"), key("c")]);
    assert_eq!(links(&store, "a"), named(None, Some("b")));
    assert_eq!(links(&store, "b"), named(Some("a"), Some("c")));
}

#[tokio::test]
async fn documents_outside_the_chain_are_untouched() {
    let site = site();
    let mut draft = member("draft", 2);
    draft.published = false;
    draft.prev = Some(key("stale"));
    let mut about = member("about", 0);
    about.chain_member = false;
    about.next = Some(key("stale"));
    let store = seeded([member("a", 1), draft.clone(), about.clone(), member("b", 3)]);

    ChainMaintainer::new(store.clone())
        .repair_chain(&site)
        .await
        .expect("repair succeeds");

    assert_eq!(store.document(&key("draft")), Some(draft));
    assert_eq!(store.document(&key("about")), Some(about));
    assert_eq!(links(&store, "a"), named(None, Some("b")));
    assert_eq!(links(&store, "b"), named(Some("a"), None));
}

#[tokio::test]
async fn other_sites_are_not_relinked() {
    let site = site();
    let other = SiteKey::new("other").expect("valid site key");
    let mut foreign = DocumentRecord::draft(DocumentKey::new(&other, "x"), "x", BASE);
    foreign.published = true;
    foreign.chain_member = true;
    foreign.next = Some(DocumentKey::new(&other, "stale"));
    let store = seeded([member("a", 1), foreign.clone()]);

    ChainMaintainer::new(store.clone())
        .repair_chain(&site)
        .await
        .expect("repair succeeds");

    assert_eq!(store.document(&foreign.key), Some(foreign));
}

#[tokio::test]
async fn equal_creation_times_order_by_name() {
    let site = site();
    let store = seeded([member("beta", 0), member("alpha", 0)]);

    ChainMaintainer::new(store.clone())
        .repair_chain(&site)
        .await
        .expect("repair succeeds");

    assert_eq!(links(&store, "alpha"), named(None, Some("beta")));
    assert_eq!(links(&store, "beta"), named(Some("alpha"), None));
}

#[tokio::test]
async fn verify_reports_broken_links_without_writing() {
    let site = site();
    let store = seeded([member("a", 1), member("b", 2)]);
    let maintainer = ChainMaintainer::new(store.clone());

    let violations = maintainer.verify_chain(&site).await.expect("verify");
    assert_eq!(violations.len(), 2);
    assert_eq!(violations[0].key, key("a"));
    assert_eq!(violations[0].field, LinkField::Next);
    assert_eq!(violations[0].to_string(), "a.next: expected b, found none");
    assert_eq!(store.write_count(), 0);

    maintainer.repair_chain(&site).await.expect("repair");
    assert!(maintainer.verify_chain(&site).await.expect("verify").is_empty());
}

/// Holds every transaction at commit until all parties have arrived, then
/// until the release barrier opens.
struct GatedStore {
    inner: Arc<MemoryDocumentStore>,
    reached: Arc<Barrier>,
    release: Arc<Barrier>,
}

struct GatedTransaction {
    inner: Box<dyn DocumentTransaction>,
    reached: Arc<Barrier>,
    release: Arc<Barrier>,
}

#[async_trait]
impl DocumentStore for GatedStore {
    async fn get(&self, key: &DocumentKey) -> Result<DocumentRecord, StoreError> {
        self.inner.get(key).await
    }

    async fn put(&self, doc: &DocumentRecord) -> Result<(), StoreError> {
        self.inner.put(doc).await
    }

    async fn query(&self, query: &DocumentQuery) -> Result<Vec<DocumentRecord>, StoreError> {
        self.inner.query(query).await
    }

    async fn begin(&self) -> Result<Box<dyn DocumentTransaction>, StoreError> {
        Ok(Box::new(GatedTransaction {
            inner: self.inner.begin().await?,
            reached: Arc::clone(&self.reached),
            release: Arc::clone(&self.release),
        }))
    }
}

#[async_trait]
impl DocumentTransaction for GatedTransaction {
    async fn get(&mut self, key: &DocumentKey) -> Result<DocumentRecord, StoreError> {
        self.inner.get(key).await
    }

    async fn query(&mut self, query: &DocumentQuery) -> Result<Vec<DocumentRecord>, StoreError> {
        self.inner.query(query).await
    }

    async fn put(&mut self, doc: &DocumentRecord) -> Result<(), StoreError> {
        self.inner.put(doc).await
    }

    async fn update_links(&mut self, doc: &DocumentRecord) -> Result<(), StoreError> {
        self.inner.update_links(doc).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.reached.wait().await;
        self.release.wait().await;
        self.inner.commit().await
    }
}

#[tokio::test]
async fn concurrent_repairs_conflict_and_converge() {
    let site = site();
    let inner = seeded([member("a", 1), member("b", 2), member("c", 3)]);
    let gated = Arc::new(GatedStore {
        inner: inner.clone(),
        reached: Arc::new(Barrier::new(2)),
        release: Arc::new(Barrier::new(1)),
    });
    let first = ChainMaintainer::new(gated.clone());
    let second = ChainMaintainer::new(gated);

    let (left, right) = tokio::join!(first.repair_chain(&site), second.repair_chain(&site));
    let conflicts = [&left, &right]
        .into_iter()
        .filter(|result| matches!(result, Err(StoreError::Conflict)))
        .count();
    assert_eq!(conflicts, 1, "exactly one repair should lose: {left:?} / {right:?}");

    let plain = ChainMaintainer::new(inner.clone());
    assert!(plain.repair_chain(&site).await.expect("rerun").is_noop());
    assert_eq!(links(&inner, "b"), named(Some("a"), Some("c")));
}

#[tokio::test]
async fn reordering_during_repair_conflicts_then_converges() {
    let site = site();
    let inner = seeded([member("a", 1), member("b", 2), member("c", 3)]);
    let reached = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    let gated = Arc::new(GatedStore {
        inner: inner.clone(),
        reached: Arc::clone(&reached),
        release: Arc::clone(&release),
    });

    let task_site = site.clone();
    let repair = tokio::spawn(async move {
        let maintainer = ChainMaintainer::new(gated);
        maintainer.repair_chain(&task_site).await
    });

    reached.wait().await;
    let mut moved = inner.document(&key("a")).expect("a exists");
    moved.created = BASE + Duration::hours(10);
    inner.put(&moved).await.expect("concurrent edit");
    release.wait().await;

    let outcome = repair.await.expect("repair task joins");
    assert!(matches!(outcome, Err(StoreError::Conflict)));

    ChainMaintainer::new(inner.clone())
        .repair_chain(&site)
        .await
        .expect("rerun succeeds");
    assert_eq!(links(&inner, "b"), named(None, Some("c")));
    assert_eq!(links(&inner, "c"), named(Some("b"), Some("a")));
    assert_eq!(links(&inner, "a"), named(Some("c"), None));
}

/// Fails the first `conflicts` commits with a conflict, or every commit with
/// an outage when `fatal` is set.
struct FlakyStore {
    inner: Arc<MemoryDocumentStore>,
    conflicts: Arc<AtomicU32>,
    attempts: Arc<AtomicU32>,
    fatal: bool,
}

struct FlakyTransaction {
    inner: Box<dyn DocumentTransaction>,
    conflicts: Arc<AtomicU32>,
    fatal: bool,
}

impl FlakyStore {
    fn new(inner: Arc<MemoryDocumentStore>, conflicts: u32, fatal: bool) -> Self {
        Self {
            inner,
            conflicts: Arc::new(AtomicU32::new(conflicts)),
            attempts: Arc::new(AtomicU32::new(0)),
            fatal,
        }
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn get(&self, key: &DocumentKey) -> Result<DocumentRecord, StoreError> {
        self.inner.get(key).await
    }

    async fn put(&self, doc: &DocumentRecord) -> Result<(), StoreError> {
        self.inner.put(doc).await
    }

    async fn query(&self, query: &DocumentQuery) -> Result<Vec<DocumentRecord>, StoreError> {
        self.inner.query(query).await
    }

    async fn begin(&self) -> Result<Box<dyn DocumentTransaction>, StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FlakyTransaction {
            inner: self.inner.begin().await?,
            conflicts: Arc::clone(&self.conflicts),
            fatal: self.fatal,
        }))
    }
}

#[async_trait]
impl DocumentTransaction for FlakyTransaction {
    async fn get(&mut self, key: &DocumentKey) -> Result<DocumentRecord, StoreError> {
        self.inner.get(key).await
    }

    async fn query(&mut self, query: &DocumentQuery) -> Result<Vec<DocumentRecord>, StoreError> {
        self.inner.query(query).await
    }

    async fn put(&mut self, doc: &DocumentRecord) -> Result<(), StoreError> {
        self.inner.put(doc).await
    }

    async fn update_links(&mut self, doc: &DocumentRecord) -> Result<(), StoreError> {
        self.inner.update_links(doc).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if self.fatal {
            return Err(StoreError::unavailable("connection reset"));
        }
        let remaining = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if remaining.is_ok() {
            return Err(StoreError::Conflict);
        }
        self.inner.commit().await
    }
}

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts: NonZeroU32::new(max_attempts).expect("non-zero attempts"),
        backoff: StdDuration::from_millis(50),
    }
}

#[tokio::test(start_paused = true)]
async fn retry_rides_out_transient_conflicts() {
    let site = site();
    let inner = seeded([member("a", 1), member("b", 2)]);
    let flaky = Arc::new(FlakyStore::new(inner.clone(), 2, false));
    let maintainer = ChainMaintainer::new(flaky.clone());

    let report = repair_with_retry(&maintainer, &site, policy(5))
        .await
        .expect("third attempt succeeds");

    assert_eq!(report.updated.len(), 2);
    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(links(&inner, "b"), named(Some("a"), None));
}

#[tokio::test(start_paused = true)]
async fn retry_gives_up_after_max_attempts() {
    let site = site();
    let inner = seeded([member("a", 1)]);
    let flaky = Arc::new(FlakyStore::new(inner.clone(), 100, false));
    let maintainer = ChainMaintainer::new(flaky.clone());

    let err = repair_with_retry(&maintainer, &site, policy(3))
        .await
        .expect_err("conflicts persist");

    assert!(matches!(err, StoreError::Conflict));
    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(inner.write_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn retry_does_not_repeat_fatal_errors() {
    let site = site();
    let inner = seeded([member("a", 1)]);
    let flaky = Arc::new(FlakyStore::new(inner, 0, true));
    let maintainer = ChainMaintainer::new(flaky.clone());

    let err = repair_with_retry(&maintainer, &site, policy(5))
        .await
        .expect_err("outage is fatal");

    assert!(matches!(err, StoreError::Unavailable { .. }));
    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 1);
}

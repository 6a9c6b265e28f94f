//! Keeps the published chain members of a site linked in creation order.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, info, warn};

use crate::application::repos::{DocumentQuery, DocumentStore, StoreError};
use crate::domain::chain::{ChainViolation, chain_violations, plan_links, sort_chronologically};
use crate::domain::entities::{DocumentKey, SiteKey};

const SOURCE: &str = "application::chain::ChainMaintainer";

/// What a successful repair did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Number of published chain members found in the scope.
    pub members: usize,
    /// Documents whose links were rewritten, in chain order.
    pub updated: Vec<DocumentKey>,
}

impl RepairReport {
    pub fn is_noop(&self) -> bool {
        self.updated.is_empty()
    }
}

/// Sole writer of the `prev`/`next` fields.
#[derive(Clone)]
pub struct ChainMaintainer {
    store: Arc<dyn DocumentStore>,
}

impl ChainMaintainer {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Recompute the chain for `site` inside one store transaction and write
    /// back only the documents whose links are wrong.
    ///
    /// A lost optimistic-concurrency race surfaces as [`StoreError::Conflict`];
    /// this method never retries. Running it again converges.
    pub async fn repair_chain(&self, site: &SiteKey) -> Result<RepairReport, StoreError> {
        let mut tx = self.store.begin().await?;

        let mut members = tx.query(&DocumentQuery::chain_members(site)).await?;
        if members.is_empty() {
            debug!(target: SOURCE, %site, "No chain members; nothing to relink");
            return Ok(RepairReport::default());
        }

        sort_chronologically(&mut members);
        let changed = plan_links(&mut members);

        for &index in &changed {
            tx.update_links(&members[index]).await?;
        }

        if let Err(err) = tx.commit().await {
            if err.is_retryable() {
                counter!("quire_chain_repair_conflict_total").increment(1);
                warn!(target: SOURCE, %site, error = %err, "Chain repair lost a concurrent write race");
            }
            return Err(err);
        }

        counter!("quire_chain_repair_writes_total").increment(changed.len() as u64);

        let report = RepairReport {
            members: members.len(),
            updated: changed
                .into_iter()
                .map(|index| members[index].key.clone())
                .collect(),
        };

        if report.is_noop() {
            debug!(target: SOURCE, %site, members = report.members, "Chain already consistent");
        } else {
            info!(
                target: SOURCE,
                %site,
                members = report.members,
                changed = report.updated.len(),
                "Relinked chain"
            );
        }

        Ok(report)
    }

    /// List stored links that disagree with creation order, without writing.
    pub async fn verify_chain(&self, site: &SiteKey) -> Result<Vec<ChainViolation>, StoreError> {
        let mut members = self
            .store
            .query(&DocumentQuery::chain_members(site))
            .await?;
        sort_chronologically(&mut members);
        Ok(chain_violations(&members))
    }
}

/// Caller-side retry policy for [`ChainMaintainer::repair_chain`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: NonZeroU32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: NonZeroU32::new(5).unwrap_or(NonZeroU32::MIN),
            backoff: Duration::from_millis(50),
        }
    }
}

/// Run a repair, retrying only on [`StoreError::Conflict`].
///
/// Fatal store errors are returned immediately; after `max_attempts`
/// conflicts the last conflict is returned.
pub async fn repair_with_retry(
    maintainer: &ChainMaintainer,
    site: &SiteKey,
    policy: RetryPolicy,
) -> Result<RepairReport, StoreError> {
    let mut attempt = 1;
    loop {
        match maintainer.repair_chain(site).await {
            Ok(report) => return Ok(report),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts.get() => {
                debug!(target: SOURCE, %site, attempt, "Retrying chain repair after conflict");
                attempt += 1;
                tokio::time::sleep(policy.backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}

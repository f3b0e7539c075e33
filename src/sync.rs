//! Detects documents that another device changed in the store.
//!
//! After the initial load of a budget, the monitor periodically compares the `updated_at` of the
//! stored budget and of every cached month with the cached copies. A newer remote document is
//! adopted silently unless the cached entry has a local change that is still being written, in
//! which case a conflict is recorded and neither side is overwritten. Fetch failures are logged and
//! otherwise ignored; the next check tries again.

use crate::cache::{CacheKey, LocalCache};
use crate::error::{Error, ErrorType, IntoResult};
use crate::model::{Budget, Month, StaleChannel, YearMonth};
use crate::months::{decode_budget, decode_month, MonthRepository};
use crate::staleness::StalenessPropagator;
use crate::store::{is_precondition_failed, to_document, Filter, BUDGETS, MONTHS};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// How to settle a `SyncConflict`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Write the cached document over the remote one and mark the months it affects stale.
    KeepLocal,
    /// Adopt the remote document into the cache, discarding the local pending change.
    TakeRemote,
}

serde_plain::derive_display_from_serialize!(Resolution);
serde_plain::derive_fromstr_from_deserialize!(Resolution);

/// A remote document that was not adopted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteDocument {
    Budget(Budget),
    Month(Month),
}

impl RemoteDocument {
    fn updated_at(&self) -> Option<DateTime<Utc>> {
        match self {
            RemoteDocument::Budget(b) => b.updated_at,
            RemoteDocument::Month(m) => m.updated_at,
        }
    }
}

/// A newer remote document that collides with a local change still being written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConflict {
    pub key: CacheKey,
    pub local_updated_at: Option<DateTime<Utc>>,
    pub remote_updated_at: Option<DateTime<Utc>>,
    pub remote: RemoteDocument,
}

/// What one check did.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// The budget has not finished its initial load, so nothing was checked.
    pub skipped: bool,
    /// Fetching from the store failed; nothing was changed.
    pub fetch_failed: bool,
    pub adopted: Vec<CacheKey>,
    pub conflicts: Vec<CacheKey>,
    /// Cached months that no longer exist in the store and were dropped from the cache.
    pub removed: Vec<CacheKey>,
}

impl SyncReport {
    pub fn is_quiet(&self) -> bool {
        self.adopted.is_empty() && self.conflicts.is_empty() && self.removed.is_empty()
    }
}

/// Compares cached documents with the store and adopts remote changes.
#[derive(Clone)]
pub struct SyncMonitor {
    repo: MonthRepository,
    propagator: StalenessPropagator,
    conflicts: Arc<Mutex<BTreeMap<CacheKey, SyncConflict>>>,
}

impl SyncMonitor {
    pub fn new(repo: MonthRepository, propagator: StalenessPropagator) -> Self {
        Self {
            repo,
            propagator,
            conflicts: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    fn cache(&self) -> &LocalCache {
        self.repo.cache()
    }

    fn recorded(&self) -> MutexGuard<'_, BTreeMap<CacheKey, SyncConflict>> {
        self.conflicts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The conflicts that have been detected and not yet resolved, in key order.
    pub fn conflicts(&self) -> Vec<SyncConflict> {
        self.recorded().values().cloned().collect()
    }

    /// Starts checking `budget_id` every `period`, the first check one `period` from now. The
    /// task runs until it is aborted through the returned handle.
    pub fn spawn(&self, budget_id: &str, period: Duration) -> JoinHandle<()> {
        let monitor = self.clone();
        let budget_id = budget_id.to_string();
        tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let report = monitor.check_once(&budget_id).await;
                if !report.is_quiet() {
                    debug!("Sync check of '{budget_id}': {report:?}");
                }
            }
        })
    }

    /// Runs one check of `budget_id`. Never fails: a fetch failure leaves everything as it was.
    pub async fn check_once(&self, budget_id: &str) -> SyncReport {
        let mut report = SyncReport::default();
        if !self.cache().is_loaded(budget_id) {
            trace!("Skipping the sync check of '{budget_id}', it has not been loaded yet");
            report.skipped = true;
            return report;
        }

        let store = self.repo.store();
        let remote_budget = match store.read(BUDGETS, budget_id).await {
            Ok(Some(doc)) => match decode_budget(doc) {
                Ok(budget) => Some(budget),
                Err(e) => {
                    warn!("Ignoring an unreadable remote budget '{budget_id}': {e:#}");
                    report.fetch_failed = true;
                    return report;
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Unable to fetch budget '{budget_id}' for the sync check: {e:#}");
                report.fetch_failed = true;
                return report;
            }
        };
        let docs = match store
            .query(MONTHS, &[Filter::eq("budget_id", budget_id)])
            .await
        {
            Ok(docs) => docs,
            Err(e) => {
                warn!("Unable to fetch months of '{budget_id}' for the sync check: {e:#}");
                report.fetch_failed = true;
                return report;
            }
        };
        let mut remote_months = BTreeMap::new();
        for doc in docs {
            match decode_month(doc, budget_id) {
                Ok(month) => {
                    remote_months.insert(month.year_month(), month);
                }
                Err(e) => warn!("Ignoring an unreadable remote month of '{budget_id}': {e:#}"),
            }
        }

        if let Some(remote) = remote_budget {
            let local = self.cache().budget(budget_id).and_then(|b| b.updated_at);
            self.reconcile(
                CacheKey::budget(budget_id),
                local,
                RemoteDocument::Budget(remote),
                &mut report,
            );
        }

        let cached: BTreeSet<YearMonth> = self
            .cache()
            .months(budget_id)
            .iter()
            .map(Month::year_month)
            .collect();
        for ym in cached {
            let key = CacheKey::month(budget_id, ym);
            let local = self.cache().month(budget_id, ym).and_then(|m| m.updated_at);
            match remote_months.remove(&ym) {
                Some(remote) => {
                    self.reconcile(key, local, RemoteDocument::Month(remote), &mut report)
                }
                None if self.cache().pending(&key) == 0 => {
                    debug!("Month {ym} of '{budget_id}' was deleted remotely");
                    self.cache().remove_month(budget_id, ym);
                    report.removed.push(key);
                }
                None => {}
            }
        }
        report
    }

    fn reconcile(
        &self,
        key: CacheKey,
        local_updated_at: Option<DateTime<Utc>>,
        remote: RemoteDocument,
        report: &mut SyncReport,
    ) {
        let remote_updated_at = remote.updated_at();
        let newer = match (remote_updated_at, local_updated_at) {
            (Some(remote), Some(local)) => remote > local,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !newer {
            // The local copy caught up, so any earlier conflict is moot.
            if self.cache().pending(&key) == 0 {
                self.recorded().remove(&key);
            }
            return;
        }
        if self.cache().pending(&key) == 0 {
            trace!("Adopting the remote version of {key}");
            self.adopt(remote);
            self.recorded().remove(&key);
            report.adopted.push(key);
            return;
        }
        warn!(
            "{key} changed remotely ({remote_updated_at:?}) while a local change is pending \
             ({local_updated_at:?})"
        );
        self.recorded().insert(
            key.clone(),
            SyncConflict {
                key: key.clone(),
                local_updated_at,
                remote_updated_at,
                remote,
            },
        );
        report.conflicts.push(key);
    }

    fn adopt(&self, remote: RemoteDocument) {
        match remote {
            RemoteDocument::Budget(budget) => self.cache().put_budget(budget),
            RemoteDocument::Month(month) => self.cache().put_month(month),
        }
    }

    /// Settles a recorded conflict.
    pub async fn resolve(&self, key: &CacheKey, resolution: Resolution) -> Result<()> {
        let conflict = self.recorded().remove(key).ok_or_else(|| {
            Error::msg(ErrorType::NotFound, format!("There is no sync conflict for {key}"))
        })?;
        let result = match resolution {
            Resolution::TakeRemote => {
                self.adopt(conflict.remote.clone());
                self.cache().clear_pending(key);
                Ok(())
            }
            Resolution::KeepLocal => self.keep_local(key, conflict.remote_updated_at).await,
        };
        match &result {
            Ok(()) => info!("Resolved the sync conflict on {key} with {resolution}"),
            Err(_) => {
                self.recorded().insert(key.clone(), conflict);
            }
        }
        result
    }

    /// Writes the cached document over the remote one, provided the remote one is still the
    /// version the conflict was recorded against.
    async fn keep_local(
        &self,
        key: &CacheKey,
        remote_updated_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let not_cached = || Error::msg(ErrorType::NotFound, format!("{key} is not cached"));
        let classify = |e: anyhow::Error| {
            if is_precondition_failed(&e) {
                let message = format!("{key} changed remotely after the conflict was recorded");
                Error::new(ErrorType::SyncConflict, e.context(message))
            } else {
                Error::new(ErrorType::StoreWrite, e)
            }
        };
        match key {
            CacheKey::Budget { budget_id } => {
                let local = self.cache().budget(budget_id).ok_or_else(not_cached)?;
                let data = to_document(&local).pub_result(ErrorType::Internal)?;
                let updated_at = self
                    .repo
                    .write_budget_fields_expecting(budget_id, data, remote_updated_at)
                    .await
                    .map_err(classify)?;
                self.cache().update_budget(budget_id, |b| b.updated_at = Some(updated_at));
                if let Some(earliest) = local.earliest_month() {
                    self.propagator
                        .mark_stale_from(budget_id, earliest, StaleChannel::Both)
                        .await?;
                }
            }
            CacheKey::Month {
                budget_id,
                year_month,
            } => {
                let local = self
                    .cache()
                    .month(budget_id, *year_month)
                    .ok_or_else(not_cached)?;
                self.repo
                    .save_month_expecting(&local, remote_updated_at)
                    .await
                    .map_err(classify)?;
                self.propagator
                    .mark_stale_from(budget_id, *year_month, StaleChannel::Both)
                    .await?;
            }
        }
        Ok(())
    }
}

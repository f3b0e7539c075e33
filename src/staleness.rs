//! Marks months whose persisted balances may no longer be right.
//!
//! An edit to a month changes the end balances that every later month starts from. Rather than
//! recalculating the whole chain on every edit, the later months are flagged stale and recalculated
//! lazily. Marking happens in two halves:
//! - the cache half updates cached months synchronously so the UI can show staleness at once,
//! - the store half writes the flags to the store.
//!
//! Both halves only ever set flags, so running them any number of times converges on the same
//! state. Clearing flags is the job of the recalculator.

use crate::error::{ErrorType, IntoResult};
use crate::model::{Month, StaleChannel, YearMonth};
use crate::months::MonthRepository;
use crate::store::{fields, WriteOptions, MONTHS};
use crate::Result;
use anyhow::Context;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace};

/// Which months a marking applies to, relative to the edited month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Strictly after the edited month.
    After(YearMonth),
    /// The edited month and every month after it.
    From(YearMonth),
}

impl Scope {
    pub fn contains(&self, ym: YearMonth) -> bool {
        match self {
            Scope::After(edited) => ym > *edited,
            Scope::From(edited) => ym >= *edited,
        }
    }

    pub fn edited(&self) -> YearMonth {
        match self {
            Scope::After(ym) | Scope::From(ym) => *ym,
        }
    }
}

/// The outcome of marking months stale.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct StaleReport {
    /// How many cached months were changed by the cache half.
    pub cached: usize,
    /// The months whose stored flags were written by the store half.
    pub written: Vec<YearMonth>,
    /// True if the store half was skipped because the cache already showed every month in scope
    /// as stale.
    pub short_circuited: bool,
}

/// Marks months stale in the cache and in the store.
#[derive(Clone)]
pub struct StalenessPropagator {
    repo: MonthRepository,
}

impl StalenessPropagator {
    pub fn new(repo: MonthRepository) -> Self {
        Self { repo }
    }

    /// Marks every month strictly after `ym` stale on `channel`.
    pub async fn mark_stale_after(
        &self,
        budget_id: &str,
        ym: YearMonth,
        channel: StaleChannel,
    ) -> Result<StaleReport> {
        self.mark(budget_id, Scope::After(ym), channel).await
    }

    /// Marks `ym` and every month after it stale on `channel`.
    pub async fn mark_stale_from(
        &self,
        budget_id: &str,
        ym: YearMonth,
        channel: StaleChannel,
    ) -> Result<StaleReport> {
        self.mark(budget_id, Scope::From(ym), channel).await
    }

    async fn mark(&self, budget_id: &str, scope: Scope, channel: StaleChannel) -> Result<StaleReport> {
        let covered = self.cache_covers(budget_id, scope, channel);
        let cached = self.mark_cached(budget_id, scope, channel);
        if covered {
            trace!(
                "Months of '{budget_id}' in scope of {} are already stale in the cache",
                scope.edited()
            );
            return Ok(StaleReport {
                cached,
                written: Vec::new(),
                short_circuited: true,
            });
        }
        let written = self.mark_stored(budget_id, scope, channel).await?;
        Ok(StaleReport {
            cached,
            written,
            short_circuited: false,
        })
    }

    /// True if the cached budget lists at least one month in scope and every such month is cached,
    /// already covers `channel`, and is flagged in the cached `month_map`.
    fn cache_covers(&self, budget_id: &str, scope: Scope, channel: StaleChannel) -> bool {
        let cache = self.repo.cache();
        let Some(budget) = cache.budget(budget_id) else {
            return false;
        };
        let in_scope: Vec<YearMonth> = budget
            .months()
            .into_iter()
            .filter(|ym| scope.contains(*ym))
            .collect();
        !in_scope.is_empty()
            && in_scope.iter().all(|ym| {
                let flagged = budget
                    .month_map
                    .get(&ym.key())
                    .is_some_and(|e| e.needs_recalculation);
                let month_covered = cache
                    .month(budget_id, *ym)
                    .is_some_and(|m| m.status.covers(channel));
                flagged && month_covered
            })
    }

    /// The cache half: flags every cached month in scope. Returns how many entries changed.
    pub fn mark_cached(&self, budget_id: &str, scope: Scope, channel: StaleChannel) -> usize {
        let cache = self.repo.cache();
        let changed = cache.update_months(
            budget_id,
            |month| scope.contains(month.year_month()),
            |month| {
                if month.status.covers(channel) {
                    false
                } else {
                    month.status = month.status.mark(channel);
                    true
                }
            },
        );
        cache.update_budget(budget_id, |budget| {
            for ym in budget.months() {
                if scope.contains(ym) {
                    budget.set_needs_recalculation(ym, true);
                }
            }
        });
        changed
    }

    /// The store half: writes the flags of every stored month in scope that does not have them
    /// yet, then flags those months in the budget's `month_map`. Returns the months written.
    ///
    /// The `month_map` entry of a month whose flags were written is rewritten even if it is
    /// already set, so that a recalculation clearing the `month_map` concurrently sees the budget
    /// change and re-checks its months.
    pub async fn mark_stored(
        &self,
        budget_id: &str,
        scope: Scope,
        channel: StaleChannel,
    ) -> Result<Vec<YearMonth>> {
        let budget = self.repo.read_budget(budget_id).await?;
        let months = self
            .repo
            .fetch_months_from(budget_id, scope.edited())
            .await?;

        let mut written = Vec::new();
        let mut map_entries = Vec::new();
        for month in months.iter().filter(|m| scope.contains(m.year_month())) {
            let ym = month.year_month();
            let wrote_flags = !month.status.covers(channel);
            if wrote_flags {
                self.write_flags(month, channel).await?;
                written.push(ym);
            }
            let flagged = budget
                .month_map
                .get(&ym.key())
                .is_some_and(|e| e.needs_recalculation);
            if wrote_flags || !flagged {
                map_entries.push((ym, true));
            }
        }
        self.repo.write_month_map(budget_id, &map_entries).await?;

        if !written.is_empty() || !map_entries.is_empty() {
            debug!(
                "Marked {} months of '{budget_id}' stale ({channel}) after an edit to {}",
                written.len(),
                scope.edited()
            );
        }
        Ok(written)
    }

    async fn write_flags(&self, month: &Month, channel: StaleChannel) -> Result<()> {
        let data = match channel {
            StaleChannel::Categories => fields([("category_balances_stale", Value::Bool(true))]),
            StaleChannel::Accounts => fields([("account_balances_stale", Value::Bool(true))]),
            StaleChannel::Both => fields([
                ("category_balances_stale", Value::Bool(true)),
                ("account_balances_stale", Value::Bool(true)),
            ]),
        };
        let updated_at = self
            .repo
            .store()
            .write(MONTHS, &month.id(), data, WriteOptions::merge())
            .await
            .with_context(|| format!("Unable to mark month '{}' stale", month.id()))
            .pub_result(ErrorType::StoreWrite)?;

        // Keep the cached copy in step with the write so that the sync monitor does not mistake
        // it for a remote change.
        let marked = self.repo.cache().update_month(
            &month.budget_id,
            month.year_month(),
            |cached| {
                cached.status = cached.status.mark(channel);
                cached.updated_at = Some(updated_at);
            },
        );
        if !marked {
            let mut stored = month.clone();
            stored.status = stored.status.mark(channel);
            stored.updated_at = Some(updated_at);
            self.repo.cache_month(&stored);
        }
        Ok(())
    }
}

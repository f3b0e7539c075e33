//! Reads and writes budget and month documents, keeping the local cache in step.
//!
//! A month document is created lazily, the first time it is asked for, and only next to the
//! budget's existing range of months so that `month_map` never has gaps.

use crate::cache::{CacheKey, LocalCache};
use crate::calc::{compute_month_balances, PreviousBalances};
use crate::error::{Error, ErrorType, IntoResult, Res};
use crate::model::{Budget, Month, YearMonth};
use crate::store::{
    fields, to_document, Document, DocumentStore, Filter, WriteOptions, BUDGETS, MONTHS,
};
use crate::Result;
use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tracing::{debug, info};

/// The detail of an `ErrorType::OutOfSequence` error, available through `Error::downcast_ref`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfSequence {
    pub requested: YearMonth,
    pub earliest: YearMonth,
    pub latest: YearMonth,
    /// The month closest to `requested` that could be created or opened instead.
    pub nearest: YearMonth,
}

impl Display for OutOfSequence {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Month {} is not adjacent to the budget's months ({}..{}), the nearest valid month is {}",
            self.requested, self.earliest, self.latest, self.nearest
        )
    }
}

impl std::error::Error for OutOfSequence {}

/// Reads and writes month and budget documents.
#[derive(Clone)]
pub struct MonthRepository {
    store: Arc<dyn DocumentStore>,
    cache: LocalCache,
}

impl MonthRepository {
    pub fn new(store: Arc<dyn DocumentStore>, cache: LocalCache) -> Self {
        Self { store, cache }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    /// Writes a new budget document, replacing any existing one.
    pub async fn create_budget(&self, budget: &Budget) -> Result<Budget> {
        let data = to_document(budget).pub_result(ErrorType::Internal)?;
        let updated_at = self
            .store
            .write(BUDGETS, &budget.id, data, WriteOptions::replace())
            .await
            .with_context(|| format!("Unable to create budget '{}'", budget.id))
            .pub_result(ErrorType::StoreWrite)?;
        let mut budget = budget.clone();
        budget.updated_at = Some(updated_at);
        self.cache.put_budget(budget.clone());
        Ok(budget)
    }

    /// Reads a budget from the store and caches it.
    pub async fn read_budget(&self, budget_id: &str) -> Result<Budget> {
        let doc = self
            .store
            .read(BUDGETS, budget_id)
            .await
            .with_context(|| format!("Unable to read budget '{budget_id}'"))
            .pub_result(ErrorType::StoreRead)?
            .ok_or_else(|| {
                Error::msg(
                    ErrorType::NotFound,
                    format!("Budget '{budget_id}' does not exist"),
                )
            })?;
        let budget = decode_budget(doc).pub_result(ErrorType::StoreRead)?;
        self.cache_budget(&budget);
        Ok(budget)
    }

    /// Merge-writes `data` into the budget document and returns the new `updated_at`.
    pub(crate) async fn write_budget_fields(
        &self,
        budget_id: &str,
        data: Value,
    ) -> Result<DateTime<Utc>> {
        self.store
            .write(BUDGETS, budget_id, data, WriteOptions::merge())
            .await
            .with_context(|| format!("Unable to update budget '{budget_id}'"))
            .pub_result(ErrorType::StoreWrite)
    }

    /// Like `write_budget_fields`, but fails unless the stored budget still has
    /// `expected_updated_at`. Use `is_precondition_failed` on the error to tell that case apart.
    pub(crate) async fn write_budget_fields_expecting(
        &self,
        budget_id: &str,
        data: Value,
        expected_updated_at: Option<DateTime<Utc>>,
    ) -> Res<DateTime<Utc>> {
        let options = WriteOptions::merge().expecting(expected_updated_at);
        self.store
            .write(BUDGETS, budget_id, data, options)
            .await
            .with_context(|| format!("Unable to update budget '{budget_id}'"))
    }

    /// Sets `needs_recalculation` for each month in `entries` in the stored `month_map`, and in the
    /// cached budget.
    pub(crate) async fn write_month_map(
        &self,
        budget_id: &str,
        entries: &[(YearMonth, bool)],
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let map: serde_json::Map<String, Value> = entries
            .iter()
            .map(|(ym, stale)| (ym.key(), json!({ "needs_recalculation": stale })))
            .collect();
        let updated_at = self
            .write_budget_fields(budget_id, fields([("month_map", Value::Object(map))]))
            .await?;
        self.cache.update_budget(budget_id, |budget| {
            for (ym, stale) in entries {
                budget.set_needs_recalculation(*ym, *stale);
            }
            budget.updated_at = Some(updated_at);
        });
        Ok(())
    }

    /// Reads a month from the store. Returns `Ok(None)` if the month has not been created yet.
    pub async fn read_month(&self, budget_id: &str, ym: YearMonth) -> Result<Option<Month>> {
        let id = Month::document_id(budget_id, ym);
        let doc = self
            .store
            .read(MONTHS, &id)
            .await
            .with_context(|| format!("Unable to read month '{id}'"))
            .pub_result(ErrorType::StoreRead)?;
        let Some(doc) = doc else {
            return Ok(None);
        };
        let month = decode_month(doc, budget_id).pub_result(ErrorType::StoreRead)?;
        self.cache_month(&month);
        Ok(Some(month))
    }

    /// Fetches, in one query, every month of the budget from `from` onwards, in ascending order
    /// regardless of the order the store returns them in.
    pub async fn fetch_months_from(&self, budget_id: &str, from: YearMonth) -> Result<Vec<Month>> {
        let docs = self
            .store
            .query(
                MONTHS,
                &[
                    Filter::eq("budget_id", budget_id),
                    Filter::gte("year_month_ordinal", from.ordinal()),
                ],
            )
            .await
            .with_context(|| format!("Unable to fetch months of budget '{budget_id}' from {from}"))
            .pub_result(ErrorType::StoreRead)?;
        let mut months = docs
            .into_iter()
            .map(|doc| decode_month(doc, budget_id))
            .collect::<Res<Vec<_>>>()
            .pub_result(ErrorType::StoreRead)?;
        months.sort_by_key(|m| m.year_month_ordinal);
        Ok(months)
    }

    /// Returns the month, creating it if it does not exist yet.
    ///
    /// A month can only be created directly before the budget's earliest month or directly after
    /// its latest month (or anywhere if the budget has no months). Otherwise the error is
    /// `ErrorType::OutOfSequence` and carries an `OutOfSequence` naming the nearest valid month.
    pub async fn get_or_create_month(&self, budget_id: &str, ym: YearMonth) -> Result<Month> {
        let budget = self.read_budget(budget_id).await?;
        if budget.has_month(ym) {
            if let Some(month) = self.read_month(budget_id, ym).await? {
                return Ok(month);
            }
            debug!("Month {ym} is in the month_map of '{budget_id}' but has no document");
        } else {
            check_adjacent(&budget, ym)?;
        }
        self.create_month(&budget, ym).await
    }

    async fn create_month(&self, budget: &Budget, ym: YearMonth) -> Result<Month> {
        let mut month = Month::new(&budget.id, ym);

        // The month before, if there is one, provides the starting balances.
        let previous = if budget.has_month(ym.prev()) {
            self.read_month(&budget.id, ym.prev()).await?
        } else {
            None
        };
        let prior_balances = previous
            .as_ref()
            .map(PreviousBalances::from_month)
            .transpose()?;
        if let Some(previous) = &previous {
            month.previous_month_income = previous.total_income()?;
            // Balances computed from a stale month are stale too.
            month.status = previous.status;
        }

        let balances = compute_month_balances(&month, prior_balances.as_ref(), budget)?;
        month.account_balances = balances.accounts;
        month.category_balances = balances.categories;

        let data = to_document(&month).pub_result(ErrorType::Internal)?;
        let updated_at = self
            .store
            .write(MONTHS, &month.id(), data, WriteOptions::replace())
            .await
            .with_context(|| format!("Unable to create month '{}'", month.id()))
            .pub_result(ErrorType::StoreWrite)?;
        month.updated_at = Some(updated_at);

        self.write_month_map(&budget.id, &[(ym, month.status.needs_recalculation())])
            .await?;
        self.cache.put_month(month.clone());
        info!("Created month {ym} for budget '{}'", budget.id);
        Ok(month)
    }

    /// Merge-writes every field of `month`, preserving fields of the stored document that `Month`
    /// does not know about, and returns the month as stored.
    pub async fn save_month(&self, month: &Month) -> Result<Month> {
        self.write_month(month, WriteOptions::merge()).await
    }

    /// Like `save_month`, but fails unless the stored document still has `expected_updated_at`.
    pub(crate) async fn save_month_expecting(
        &self,
        month: &Month,
        expected_updated_at: Option<DateTime<Utc>>,
    ) -> Res<Month> {
        let data = to_document(month)?;
        let options = WriteOptions::merge().expecting(expected_updated_at);
        let updated_at = self
            .store
            .write(MONTHS, &month.id(), data, options)
            .await
            .with_context(|| format!("Unable to save month '{}'", month.id()))?;
        let mut saved = month.clone();
        saved.updated_at = Some(updated_at);
        self.cache.put_month(saved.clone());
        Ok(saved)
    }

    async fn write_month(&self, month: &Month, options: WriteOptions) -> Result<Month> {
        let data = to_document(month).pub_result(ErrorType::Internal)?;
        let updated_at = self
            .store
            .write(MONTHS, &month.id(), data, options)
            .await
            .with_context(|| format!("Unable to save month '{}'", month.id()))
            .pub_result(ErrorType::StoreWrite)?;
        let mut saved = month.clone();
        saved.updated_at = Some(updated_at);
        self.cache.put_month(saved.clone());
        Ok(saved)
    }

    /// Deletes placeholder months after `horizon` from the end of the budget's chain.
    ///
    /// Months are considered from the latest backwards and pruning stops at the first month that
    /// has transactions or finalized allocations, so the `month_map` stays gap-free. The budget's
    /// earliest month is never deleted. Returns the deleted months in ascending order.
    pub async fn prune_placeholder_months(
        &self,
        budget_id: &str,
        horizon: YearMonth,
    ) -> Result<Vec<YearMonth>> {
        let mut budget = self.read_budget(budget_id).await?;
        let Some(earliest) = budget.earliest_month() else {
            return Ok(Vec::new());
        };

        let mut pruned = Vec::new();
        for ym in budget.months().into_iter().rev() {
            if ym <= horizon || ym == earliest {
                break;
            }
            match self.read_month(budget_id, ym).await? {
                Some(month) if !month.is_placeholder() => break,
                _ => pruned.push(ym),
            }
        }
        if pruned.is_empty() {
            return Ok(pruned);
        }
        pruned.reverse();

        // The month_map is rewritten whole because a merge write cannot remove keys.
        let expected = budget.updated_at;
        for ym in &pruned {
            budget.month_map.remove(&ym.key());
        }
        let data = to_document(&budget).pub_result(ErrorType::Internal)?;
        let updated_at = self
            .store
            .write(
                BUDGETS,
                budget_id,
                data,
                WriteOptions::replace().expecting(expected),
            )
            .await
            .with_context(|| format!("Unable to remove pruned months from budget '{budget_id}'"))
            .pub_result(ErrorType::StoreWrite)?;
        budget.updated_at = Some(updated_at);
        self.cache.put_budget(budget);

        for ym in &pruned {
            let id = Month::document_id(budget_id, *ym);
            self.store
                .delete(MONTHS, &id)
                .await
                .with_context(|| format!("Unable to delete month '{id}'"))
                .pub_result(ErrorType::StoreWrite)?;
            self.cache.remove_month(budget_id, *ym);
        }
        info!("Pruned {} placeholder months from budget '{budget_id}'", pruned.len());
        Ok(pruned)
    }

    /// Caches an authoritative budget unless a local change to it is still being written.
    pub(crate) fn cache_budget(&self, budget: &Budget) {
        if self.cache.pending(&CacheKey::budget(&budget.id)) == 0 {
            self.cache.put_budget(budget.clone());
        }
    }

    /// Caches an authoritative month unless a local change to it is still being written.
    pub(crate) fn cache_month(&self, month: &Month) {
        let key = CacheKey::month(&month.budget_id, month.year_month());
        if self.cache.pending(&key) == 0 {
            self.cache.put_month(month.clone());
        }
    }
}

/// Fails with `OutOfSequence` unless `ym` may be created for `budget`.
fn check_adjacent(budget: &Budget, ym: YearMonth) -> Result<()> {
    let (Some(earliest), Some(latest)) = (budget.earliest_month(), budget.latest_month()) else {
        return Ok(());
    };
    if ym == earliest.prev() || ym == latest.next() || (earliest..=latest).contains(&ym) {
        return Ok(());
    }
    let nearest = if ym < earliest {
        earliest.prev()
    } else {
        latest.next()
    };
    Err(Error::new(
        ErrorType::OutOfSequence,
        anyhow::Error::new(OutOfSequence {
            requested: ym,
            earliest,
            latest,
            nearest,
        }),
    ))
}

pub(crate) fn decode_budget(doc: Document) -> Res<Budget> {
    let id = doc.id.clone();
    let mut budget: Budget = serde_json::from_value(doc.data)
        .with_context(|| format!("Budget document '{id}' is malformed"))?;
    budget.updated_at = Some(doc.updated_at);
    if budget.id.is_empty() {
        budget.id = id;
    }
    Ok(budget)
}

pub(crate) fn decode_month(doc: Document, budget_id: &str) -> Res<Month> {
    let id = doc.id.clone();
    let mut month: Month = serde_json::from_value(doc.data)
        .with_context(|| format!("Month document '{id}' is malformed"))?;
    let ym = YearMonth::new(month.year, month.month)
        .with_context(|| format!("Month document '{id}' has an invalid year or month"))?;
    if month.year_month_ordinal != ym.ordinal() {
        bail!(
            "Month document '{id}' has year_month_ordinal {} but is for {ym}",
            month.year_month_ordinal
        );
    }
    if month.budget_id != budget_id {
        bail!(
            "Month document '{id}' belongs to budget '{}', not '{budget_id}'",
            month.budget_id
        );
    }
    month.updated_at = Some(doc.updated_at);
    Ok(month)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Account, Category, Expense, Income, RecalcStatus};
    use crate::store::MemoryStore;
    use crate::test::{amt, ym, TestLedger};

    #[tokio::test]
    async fn first_month_can_be_anything() {
        let env = TestLedger::new().await;
        let month = env
            .repo()
            .get_or_create_month("b1", ym(2024, 5))
            .await
            .unwrap();
        assert_eq!(month.year_month(), ym(2024, 5));
        assert_eq!(month.account_balances["checking"].start_balance, amt("1000"));
        let budget = env.repo().read_budget("b1").await.unwrap();
        assert_eq!(budget.months(), vec![ym(2024, 5)]);
    }

    #[tokio::test]
    async fn creation_only_adjacent() {
        let env = TestLedger::with_months(ym(2024, 5), 4).await;
        let repo = env.repo();

        let err = repo.get_or_create_month("b1", ym(2024, 3)).await.unwrap_err();
        assert!(err.is(ErrorType::OutOfSequence));
        let detail = err.downcast_ref::<OutOfSequence>().unwrap();
        assert_eq!(detail.nearest, ym(2024, 4));
        assert_eq!(detail.earliest, ym(2024, 5));
        assert_eq!(detail.latest, ym(2024, 8));

        let err = repo.get_or_create_month("b1", ym(2024, 10)).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<OutOfSequence>().unwrap().nearest,
            ym(2024, 9)
        );

        repo.get_or_create_month("b1", ym(2024, 4)).await.unwrap();
        repo.get_or_create_month("b1", ym(2024, 9)).await.unwrap();
        let budget = repo.read_budget("b1").await.unwrap();
        assert_eq!(budget.earliest_month(), Some(ym(2024, 4)));
        assert_eq!(budget.latest_month(), Some(ym(2024, 9)));
    }

    #[tokio::test]
    async fn new_month_rolls_over_and_inherits_staleness() {
        let env = TestLedger::with_months(ym(2024, 1), 1).await;
        let repo = env.repo();
        let mut jan = repo.read_month("b1", ym(2024, 1)).await.unwrap().unwrap();
        jan.income.push(Income {
            id: "i1".into(),
            account_id: "checking".into(),
            amount: amt("50"),
            ..Default::default()
        });
        jan.status = RecalcStatus::StaleAccounts;
        jan.account_balances.get_mut("checking").unwrap().end_balance = amt("1050");
        jan.account_balances.get_mut("checking").unwrap().income = amt("50");
        jan.account_balances.get_mut("checking").unwrap().net_change = amt("50");
        repo.save_month(&jan).await.unwrap();

        let feb = repo.get_or_create_month("b1", ym(2024, 2)).await.unwrap();
        assert_eq!(feb.previous_month_income, amt("50"));
        assert_eq!(feb.account_balances["checking"].start_balance, amt("1050"));
        assert_eq!(feb.status, RecalcStatus::StaleAccounts);
        let budget = repo.read_budget("b1").await.unwrap();
        assert!(budget.month_map[&ym(2024, 2).key()].needs_recalculation);
    }

    #[tokio::test]
    async fn read_missing_month_is_none() {
        let env = TestLedger::new().await;
        assert!(env
            .repo()
            .read_month("b1", ym(2030, 1))
            .await
            .unwrap()
            .is_none());
        let err = env.repo().read_budget("nope").await.unwrap_err();
        assert!(err.is(ErrorType::NotFound));
    }

    #[tokio::test]
    async fn save_preserves_unknown_fields() {
        let env = TestLedger::with_months(ym(2024, 1), 1).await;
        let id = Month::document_id("b1", ym(2024, 1));
        env.store
            .write(MONTHS, &id, json!({ "notes": "keep me" }), WriteOptions::merge())
            .await
            .unwrap();
        let mut month = env.repo().read_month("b1", ym(2024, 1)).await.unwrap().unwrap();
        month.are_allocations_finalized = true;
        let saved = env.repo().save_month(&month).await.unwrap();
        let doc = env.store.read(MONTHS, &id).await.unwrap().unwrap();
        assert_eq!(doc.data["notes"], json!("keep me"));
        assert_eq!(doc.data["are_allocations_finalized"], json!(true));
        assert_eq!(saved.updated_at, Some(doc.updated_at));
    }

    #[tokio::test]
    async fn fetch_is_ascending_even_when_store_scrambles() {
        let env = TestLedger::with_months(ym(2023, 11), 5).await;
        env.store.set_scramble_queries(true);
        let months = env
            .repo()
            .fetch_months_from("b1", ym(2023, 12))
            .await
            .unwrap();
        let yms: Vec<YearMonth> = months.iter().map(|m| m.year_month()).collect();
        assert_eq!(
            yms,
            vec![ym(2023, 12), ym(2024, 1), ym(2024, 2), ym(2024, 3)]
        );
    }

    #[tokio::test]
    async fn prune_only_trailing_placeholders() {
        let env = TestLedger::with_months(ym(2024, 1), 5).await;
        let repo = env.repo();
        let mut march = repo.read_month("b1", ym(2024, 3)).await.unwrap().unwrap();
        march.expenses.push(Expense {
            id: "e1".into(),
            account_id: "checking".into(),
            category_id: "groceries".into(),
            amount: amt("10"),
            ..Default::default()
        });
        repo.save_month(&march).await.unwrap();

        let pruned = repo
            .prune_placeholder_months("b1", ym(2024, 1))
            .await
            .unwrap();
        assert_eq!(pruned, vec![ym(2024, 4), ym(2024, 5)]);
        let budget = repo.read_budget("b1").await.unwrap();
        assert_eq!(budget.latest_month(), Some(ym(2024, 3)));
        assert!(repo.read_month("b1", ym(2024, 5)).await.unwrap().is_none());
        assert!(env.cache.month("b1", ym(2024, 5)).is_none());
    }

    #[tokio::test]
    async fn store_failures_are_classified() {
        let store = MemoryStore::new();
        let repo = MonthRepository::new(Arc::new(store.clone()), LocalCache::new());
        let mut budget = Budget::new("b1", "u1");
        budget.accounts.insert("a".into(), Account::default());
        budget.categories.insert("c".into(), Category::default());
        repo.create_budget(&budget).await.unwrap();

        store.fail_next_writes(MONTHS, 1);
        let err = repo.get_or_create_month("b1", ym(2024, 1)).await.unwrap_err();
        assert!(err.is(ErrorType::StoreWrite), "{err}");

        store.set_fail_reads(true);
        let err = repo.read_month("b1", ym(2024, 1)).await.unwrap_err();
        assert!(err.is(ErrorType::StoreRead), "{err}");
    }
}

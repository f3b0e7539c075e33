//! Wires the components of the ledger together around one store and one cache.

use crate::cache::LocalCache;
use crate::model::{Budget, Month, YearMonth};
use crate::months::MonthRepository;
use crate::mutation::MutationGateway;
use crate::recalc::{RecalcOutcome, Recalculator};
use crate::staleness::StalenessPropagator;
use crate::store::DocumentStore;
use crate::sync::SyncMonitor;
use crate::{Error, ErrorType, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// The entry point to a ledger. Cloning it yields another handle to the same cache, in-flight
/// recalculations and recorded sync conflicts.
#[derive(Clone)]
pub struct Ledger {
    repo: MonthRepository,
    propagator: StalenessPropagator,
    recalculator: Recalculator,
    gateway: MutationGateway,
    sync: SyncMonitor,
}

/// A month as shown to the user, with the recalculation that was needed to show it, if any.
#[derive(Debug, Clone)]
pub struct OpenedMonth {
    pub month: Month,
    pub recalculation: Option<RecalcOutcome>,
}

impl Ledger {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_cache(store, LocalCache::new())
    }

    /// Creates a ledger that shares `cache` with whoever else holds it.
    pub fn with_cache(store: Arc<dyn DocumentStore>, cache: LocalCache) -> Self {
        let repo = MonthRepository::new(store, cache);
        let propagator = StalenessPropagator::new(repo.clone());
        Self {
            recalculator: Recalculator::new(repo.clone()),
            gateway: MutationGateway::new(repo.clone(), propagator.clone()),
            sync: SyncMonitor::new(repo.clone(), propagator.clone()),
            propagator,
            repo,
        }
    }

    pub fn repo(&self) -> &MonthRepository {
        &self.repo
    }

    pub fn cache(&self) -> &LocalCache {
        self.repo.cache()
    }

    pub fn propagator(&self) -> &StalenessPropagator {
        &self.propagator
    }

    pub fn recalculator(&self) -> &Recalculator {
        &self.recalculator
    }

    pub fn gateway(&self) -> &MutationGateway {
        &self.gateway
    }

    pub fn sync(&self) -> &SyncMonitor {
        &self.sync
    }

    /// Reads the budget and all of its months into the cache and marks the initial load complete,
    /// which allows sync checks to run.
    pub async fn load_budget(&self, budget_id: &str) -> Result<Budget> {
        let budget = self.repo.read_budget(budget_id).await?;
        if let Some(earliest) = budget.earliest_month() {
            let months = self.repo.fetch_months_from(budget_id, earliest).await?;
            debug!("Loaded {} months of '{budget_id}'", months.len());
            for month in &months {
                self.repo.cache_month(month);
            }
        }
        self.cache().mark_loaded(budget_id);
        info!("Loaded budget '{budget_id}'");
        Ok(budget)
    }

    /// Opens month `ym` for display: creates it if needed, then recalculates the chain first if
    /// the month or any month before it is stale.
    pub async fn open_month(&self, budget_id: &str, ym: YearMonth) -> Result<OpenedMonth> {
        let month = self.repo.get_or_create_month(budget_id, ym).await?;
        let recalculation = self
            .recalculator
            .recalculate_if_stale(budget_id, ym)
            .await?;
        let month = match recalculation {
            None => month,
            Some(_) => self.repo.read_month(budget_id, ym).await?.ok_or_else(|| {
                Error::msg(
                    ErrorType::NotFound,
                    format!("Month {ym} of budget '{budget_id}' disappeared"),
                )
            })?,
        };
        Ok(OpenedMonth {
            month,
            recalculation,
        })
    }

    /// Starts the periodic sync check of a loaded budget.
    pub fn start_sync(&self, budget_id: &str, period: Duration) -> JoinHandle<()> {
        info!("Checking '{budget_id}' for remote changes every {period:?}");
        self.sync.spawn(budget_id, period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Expense, Income, RecalcStatus};
    use crate::months::OutOfSequence;
    use crate::test::{amt, ym, TestLedger};
    use std::collections::BTreeMap;

    fn expense(id: &str, amount: &str) -> Expense {
        Expense {
            id: id.into(),
            account_id: "checking".into(),
            category_id: "groceries".into(),
            amount: amt(amount),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn expense_edits_roll_over() {
        let env = TestLedger::loaded(ym(2024, 1), 2).await;
        let ledger = env.ledger();
        let gateway = ledger.gateway();
        gateway
            .add_expense("b1", ym(2024, 1), expense("e1", "200"))
            .await
            .unwrap();
        let feb = ledger.open_month("b1", ym(2024, 2)).await.unwrap();
        assert!(feb.recalculation.is_some());
        assert_eq!(
            feb.month.account_balances["checking"].start_balance,
            amt("800")
        );
        assert_eq!(feb.month.status, RecalcStatus::Fresh);

        gateway
            .update_expense("b1", ym(2024, 1), expense("e1", "150"))
            .await
            .unwrap();
        let feb = ledger.open_month("b1", ym(2024, 2)).await.unwrap();
        assert_eq!(
            feb.month.account_balances["checking"].start_balance,
            amt("850")
        );
        let budget = ledger.repo().read_budget("b1").await.unwrap();
        assert_eq!(budget.accounts["checking"].balance, amt("850"));
        assert_eq!(budget.earliest_stale(), None);
    }

    #[tokio::test]
    async fn allocation_edit_rolls_into_next_month() {
        let env = TestLedger::loaded(ym(2024, 1), 2).await;
        let ledger = env.ledger();
        let gateway = ledger.gateway();
        let mut drafts = BTreeMap::new();
        drafts.insert("groceries".to_string(), amt("100"));
        gateway
            .finalize_allocations("b1", ym(2024, 1), drafts)
            .await
            .unwrap();
        gateway
            .add_expense("b1", ym(2024, 1), expense("e1", "40"))
            .await
            .unwrap();
        let feb = ledger.open_month("b1", ym(2024, 2)).await.unwrap();
        assert_eq!(
            feb.month.category_balances["groceries"].start_balance,
            amt("60")
        );

        gateway
            .edit_allocation("b1", ym(2024, 1), "groceries", amt("150"))
            .await
            .unwrap();
        let feb = ledger.open_month("b1", ym(2024, 2)).await.unwrap();
        assert_eq!(
            feb.month.category_balances["groceries"].start_balance,
            amt("110")
        );
    }

    #[tokio::test]
    async fn months_far_from_the_range_are_out_of_sequence() {
        let env = TestLedger::loaded(ym(2024, 5), 4).await;
        let err = env
            .ledger()
            .open_month("b1", ym(2024, 3))
            .await
            .unwrap_err();
        assert!(err.is(ErrorType::OutOfSequence));
        let detail = err.downcast_ref::<OutOfSequence>().unwrap();
        assert_eq!(detail.nearest, ym(2024, 4));
        assert_eq!(detail.earliest, ym(2024, 5));
        assert_eq!(detail.latest, ym(2024, 8));
    }

    #[tokio::test]
    async fn percentage_allocation_is_fixed_once_finalized() {
        let env = TestLedger::loaded(ym(2024, 1), 2).await;
        let ledger = env.ledger();
        let gateway = ledger.gateway();
        gateway
            .add_income(
                "b1",
                ym(2024, 1),
                Income {
                    id: "i1".into(),
                    account_id: "checking".into(),
                    amount: amt("2000"),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let feb = ledger.open_month("b1", ym(2024, 2)).await.unwrap();
        assert_eq!(feb.month.previous_month_income, amt("2000"));

        let mut drafts = BTreeMap::new();
        drafts.insert("groceries".to_string(), amt("12.345"));
        let feb = gateway
            .finalize_allocations("b1", ym(2024, 2), drafts)
            .await
            .unwrap();
        assert_eq!(feb.allocations["savings_goal"], amt("200.00"));
        assert_eq!(feb.allocations["groceries"], amt("12.35"));

        gateway
            .update_income(
                "b1",
                ym(2024, 1),
                Income {
                    id: "i1".into(),
                    account_id: "checking".into(),
                    amount: amt("3000"),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let feb = ledger.open_month("b1", ym(2024, 2)).await.unwrap();
        assert_eq!(feb.month.previous_month_income, amt("3000"));
        assert_eq!(feb.month.allocations["savings_goal"], amt("200.00"));
    }

    #[tokio::test]
    async fn load_fills_the_cache() {
        let env = TestLedger::with_months(ym(2024, 1), 3).await;
        let ledger = Ledger::new(Arc::new(env.store.clone()));
        assert!(!ledger.cache().is_loaded("b1"));
        ledger.load_budget("b1").await.unwrap();
        assert!(ledger.cache().is_loaded("b1"));
        assert_eq!(ledger.cache().months("b1").len(), 3);
    }
}

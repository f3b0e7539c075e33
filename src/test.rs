//! Shared test utilities for creating test environments.
//!
//! This module is only compiled when running tests (`#[cfg(test)]`).

use crate::cache::LocalCache;
use crate::ledger::Ledger;
use crate::model::{Account, AllocationRule, Amount, Budget, Category, YearMonth};
use crate::months::MonthRepository;
use crate::mutation::MutationGateway;
use crate::recalc::Recalculator;
use crate::staleness::StalenessPropagator;
use crate::store::{Document, DocumentStore, MemoryStore, BUDGETS, MONTHS};
use crate::sync::SyncMonitor;
use crate::Config;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tempfile::TempDir;

pub(crate) fn amt(s: &str) -> Amount {
    Amount::from_str(s).unwrap()
}

pub(crate) fn ym(year: i32, month: u32) -> YearMonth {
    YearMonth::new(year, month).unwrap()
}

/// The budget every `TestLedger` starts with:
/// - `checking`, opening balance 1000,
/// - `savings`, opening balance 0,
/// - `groceries`, no allocation rule,
/// - `savings_goal`, 10% of the previous month's income.
pub(crate) fn budget() -> Budget {
    let mut budget = Budget::new("b1", "u1");
    budget.accounts.insert(
        "checking".into(),
        Account {
            name: "Checking".into(),
            opening_balance: amt("1000"),
            balance: amt("1000"),
            ..Default::default()
        },
    );
    budget.accounts.insert(
        "savings".into(),
        Account {
            name: "Savings".into(),
            ..Default::default()
        },
    );
    budget.categories.insert(
        "groceries".into(),
        Category {
            name: "Groceries".into(),
            ..Default::default()
        },
    );
    budget.categories.insert(
        "savings_goal".into(),
        Category {
            name: "Savings Goal".into(),
            allocation_rule: Some(AllocationRule::Percentage {
                percentage: Decimal::new(10, 0),
            }),
            ..Default::default()
        },
    );
    budget
}

/// A ledger over a `MemoryStore`, seeded with `budget()`.
pub(crate) struct TestLedger {
    pub store: MemoryStore,
    pub cache: LocalCache,
    ledger: Ledger,
}

impl TestLedger {
    pub async fn new() -> Self {
        let store = MemoryStore::new();
        let cache = LocalCache::new();
        let ledger = Ledger::with_cache(Arc::new(store.clone()), cache.clone());
        ledger.repo().create_budget(&budget()).await.unwrap();
        Self {
            store,
            cache,
            ledger,
        }
    }

    /// Creates `count` consecutive months starting at `start`.
    pub async fn with_months(start: YearMonth, count: i64) -> Self {
        let env = Self::new().await;
        for i in 0..count {
            env.repo()
                .get_or_create_month("b1", start.add_months(i))
                .await
                .unwrap();
        }
        env
    }

    /// Like `with_months`, then completes the initial load so that sync checks run.
    pub async fn loaded(start: YearMonth, count: i64) -> Self {
        let env = Self::with_months(start, count).await;
        env.ledger.load_budget("b1").await.unwrap();
        env
    }

    pub fn ledger(&self) -> Ledger {
        self.ledger.clone()
    }

    pub fn repo(&self) -> MonthRepository {
        self.ledger.repo().clone()
    }

    pub fn propagator(&self) -> StalenessPropagator {
        self.ledger.propagator().clone()
    }

    pub fn recalculator(&self) -> Recalculator {
        self.ledger.recalculator().clone()
    }

    pub fn gateway(&self) -> MutationGateway {
        self.ledger.gateway().clone()
    }

    pub fn sync(&self) -> SyncMonitor {
        self.ledger.sync().clone()
    }

    /// Every stored document, budgets first.
    pub async fn store_dump(&self) -> Vec<Document> {
        let mut docs = Vec::new();
        for collection in [BUDGETS, MONTHS] {
            docs.extend(self.store.query(collection, &[]).await.unwrap());
        }
        docs
    }
}

/// Test environment that sets up a ledger home directory with a SQLite store and a budget `b1`
/// holding the `checking` account (opening balance 1000) and the `groceries` category.
/// Holds TempDir to keep the directory alive for the duration of the test.
pub(crate) struct TestEnv {
    _temp_dir: TempDir,
    config: Config,
}

impl TestEnv {
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("ledger");
        let config = Config::create(&root, "b1", "u1").await.unwrap();
        let gateway = config.ledger().gateway().clone();
        gateway
            .add_account(
                "b1",
                "checking",
                Account {
                    name: "Checking".into(),
                    opening_balance: amt("1000"),
                    balance: amt("1000"),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        gateway
            .add_category(
                "b1",
                "groceries",
                Category {
                    name: "Groceries".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        Self {
            _temp_dir: temp_dir,
            config,
        }
    }

    /// Returns a clone of the Config.
    pub fn config(&self) -> Config {
        self.config.clone()
    }
}

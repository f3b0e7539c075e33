//! Applies user edits optimistically.
//!
//! Every mutation goes through three steps:
//! 1. snapshot every cached entry of the budget,
//! 2. apply the edit to the cache synchronously, marking the touched entries as pending,
//! 3. write to the store, then either commit (replace the optimistic entries with what was
//!    stored) or roll back (put the snapshot back exactly).
//!
//! Mutations of one budget are serialized so that a rollback never discards another mutation's
//! optimistic state.
//!
//! Store writes for a transaction edit happen in this order: the staleness flags of the edited
//! month and every later month, then the edited month itself, then the account running balances.
//! Writing the month is the commit point. A failure before it leaves at most some extra stale
//! flags behind, which only cost a recalculation. The running balances are derived data that every
//! recalculation rewrites, so failing to adjust them is logged rather than rolled back.

use crate::cache::{CacheKey, LocalCache};
use crate::calc::propose_allocations;
use crate::error::{Error, ErrorType, IntoResult};
use crate::model::{
    Account, Adjustment, Amount, Budget, Category, Expense, Income, Month, StaleChannel,
    TransactionKind, Transfer, YearMonth,
};
use crate::months::MonthRepository;
use crate::staleness::{Scope, StalenessPropagator};
use crate::store::{fields, is_precondition_failed, to_document};
use crate::Result;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

/// How many times a month edit is re-applied to a fresh copy when another device wrote the month
/// in between.
const MAX_EDIT_ATTEMPTS: usize = 3;

/// Changes to account running balances, by account id.
pub type BalanceDeltas = BTreeMap<String, Amount>;

/// An edit to the transactions of a month.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionEdit {
    AddIncome(Income),
    UpdateIncome(Income),
    AddExpense(Expense),
    UpdateExpense(Expense),
    AddTransfer(Transfer),
    AddAdjustment(Adjustment),
    /// Deletes the transaction with this id from whichever list holds it.
    Delete(String),
}

impl TransactionEdit {
    /// Gives a new transaction an id if it has none.
    fn with_id(self) -> Self {
        fn fill(id: &mut String) {
            if id.is_empty() {
                *id = uuid::Uuid::new_v4().to_string();
            }
        }
        let mut edit = self;
        match &mut edit {
            TransactionEdit::AddIncome(t) => fill(&mut t.id),
            TransactionEdit::AddExpense(t) => fill(&mut t.id),
            TransactionEdit::AddTransfer(t) => fill(&mut t.id),
            TransactionEdit::AddAdjustment(t) => fill(&mut t.id),
            _ => {}
        }
        edit
    }

    /// The id of the transaction this edit touches.
    pub fn transaction_id(&self) -> &str {
        match self {
            TransactionEdit::AddIncome(t) | TransactionEdit::UpdateIncome(t) => &t.id,
            TransactionEdit::AddExpense(t) | TransactionEdit::UpdateExpense(t) => &t.id,
            TransactionEdit::AddTransfer(t) => &t.id,
            TransactionEdit::AddAdjustment(t) => &t.id,
            TransactionEdit::Delete(id) => id,
        }
    }
}

/// Which balances `edit` can change.
fn channel_of(month: &Month, edit: &TransactionEdit) -> StaleChannel {
    match edit {
        TransactionEdit::AddIncome(_) | TransactionEdit::UpdateIncome(_) => StaleChannel::Accounts,
        TransactionEdit::AddExpense(_) | TransactionEdit::UpdateExpense(_) => StaleChannel::Both,
        TransactionEdit::AddTransfer(_) => StaleChannel::Accounts,
        TransactionEdit::AddAdjustment(a) => adjustment_channel(a),
        TransactionEdit::Delete(id) => match month.find_transaction(id) {
            Some(TransactionKind::Expense) => StaleChannel::Both,
            Some(TransactionKind::Adjustment) => month
                .adjustments
                .iter()
                .find(|a| &a.id == id)
                .map_or(StaleChannel::Both, adjustment_channel),
            _ => StaleChannel::Accounts,
        },
    }
}

fn adjustment_channel(adjustment: &Adjustment) -> StaleChannel {
    match (&adjustment.account_id, &adjustment.category_id) {
        (Some(_), None) => StaleChannel::Accounts,
        (None, Some(_)) => StaleChannel::Categories,
        _ => StaleChannel::Both,
    }
}

fn not_found(what: &str, id: &str, month_id: &str) -> Error {
    Error::msg(
        ErrorType::NotFound,
        format!("{what} '{id}' does not exist in month {month_id}"),
    )
}

fn duplicate(id: &str, month_id: &str) -> Error {
    Error::msg(
        ErrorType::Validation,
        format!("A transaction with id '{id}' already exists in month {month_id}"),
    )
}

fn add_delta(deltas: &mut BalanceDeltas, account_id: &str, amount: Amount) {
    *deltas.entry(account_id.to_string()).or_default() += amount;
}

/// Applies `edit` to `month`, returning the resulting change to account running balances.
///
/// Referenced accounts and categories must exist in `budget`; updated and deleted transactions
/// must exist in `month`.
pub fn apply_transaction_edit(
    month: &mut Month,
    budget: &Budget,
    edit: &TransactionEdit,
) -> Result<BalanceDeltas> {
    let month_id = month.id();
    let mut deltas = BalanceDeltas::new();
    match edit {
        TransactionEdit::AddIncome(income) => {
            budget.account(&income.account_id)?;
            if month.find_transaction(&income.id).is_some() {
                return Err(duplicate(&income.id, &month_id));
            }
            add_delta(&mut deltas, &income.account_id, income.amount);
            month.income.push(income.clone());
        }
        TransactionEdit::UpdateIncome(income) => {
            budget.account(&income.account_id)?;
            let existing = month
                .income
                .iter_mut()
                .find(|t| t.id == income.id)
                .ok_or_else(|| not_found("Income", &income.id, &month_id))?;
            add_delta(&mut deltas, &existing.account_id, -existing.amount);
            add_delta(&mut deltas, &income.account_id, income.amount);
            *existing = income.clone();
        }
        TransactionEdit::AddExpense(expense) => {
            budget.account(&expense.account_id)?;
            budget.category(&expense.category_id)?;
            if month.find_transaction(&expense.id).is_some() {
                return Err(duplicate(&expense.id, &month_id));
            }
            add_delta(&mut deltas, &expense.account_id, -expense.amount);
            month.expenses.push(expense.clone());
        }
        TransactionEdit::UpdateExpense(expense) => {
            budget.account(&expense.account_id)?;
            budget.category(&expense.category_id)?;
            let existing = month
                .expenses
                .iter_mut()
                .find(|t| t.id == expense.id)
                .ok_or_else(|| not_found("Expense", &expense.id, &month_id))?;
            add_delta(&mut deltas, &existing.account_id, existing.amount);
            add_delta(&mut deltas, &expense.account_id, -expense.amount);
            *existing = expense.clone();
        }
        TransactionEdit::AddTransfer(transfer) => {
            budget.account(&transfer.from_account_id)?;
            budget.account(&transfer.to_account_id)?;
            if transfer.from_account_id == transfer.to_account_id {
                return Err(Error::msg(
                    ErrorType::Validation,
                    "A transfer needs two different accounts",
                ));
            }
            if month.find_transaction(&transfer.id).is_some() {
                return Err(duplicate(&transfer.id, &month_id));
            }
            add_delta(&mut deltas, &transfer.from_account_id, -transfer.amount);
            add_delta(&mut deltas, &transfer.to_account_id, transfer.amount);
            month.transfers.push(transfer.clone());
        }
        TransactionEdit::AddAdjustment(adjustment) => {
            if adjustment.account_id.is_none() && adjustment.category_id.is_none() {
                return Err(Error::msg(
                    ErrorType::Validation,
                    "An adjustment needs an account, a category, or both",
                ));
            }
            if let Some(account_id) = &adjustment.account_id {
                budget.account(account_id)?;
                add_delta(&mut deltas, account_id, adjustment.amount);
            }
            if let Some(category_id) = &adjustment.category_id {
                budget.category(category_id)?;
            }
            if month.find_transaction(&adjustment.id).is_some() {
                return Err(duplicate(&adjustment.id, &month_id));
            }
            month.adjustments.push(adjustment.clone());
        }
        TransactionEdit::Delete(id) => match month.find_transaction(id) {
            Some(TransactionKind::Income) => {
                month.income.retain(|t| {
                    if &t.id == id {
                        add_delta(&mut deltas, &t.account_id, -t.amount);
                    }
                    &t.id != id
                });
            }
            Some(TransactionKind::Expense) => {
                month.expenses.retain(|t| {
                    if &t.id == id {
                        add_delta(&mut deltas, &t.account_id, t.amount);
                    }
                    &t.id != id
                });
            }
            Some(TransactionKind::Transfer) => {
                month.transfers.retain(|t| {
                    if &t.id == id {
                        add_delta(&mut deltas, &t.from_account_id, t.amount);
                        add_delta(&mut deltas, &t.to_account_id, -t.amount);
                    }
                    &t.id != id
                });
            }
            Some(TransactionKind::Adjustment) => {
                month.adjustments.retain(|t| {
                    if &t.id == id {
                        if let Some(account_id) = &t.account_id {
                            add_delta(&mut deltas, account_id, -t.amount);
                        }
                    }
                    &t.id != id
                });
            }
            None => return Err(not_found("Transaction", id, &month_id)),
        },
    }
    deltas.retain(|_, amount| !amount.is_zero());
    Ok(deltas)
}

/// Applies user edits to the cache and the store, rolling the cache back if the store write fails.
#[derive(Clone)]
pub struct MutationGateway {
    repo: MonthRepository,
    propagator: StalenessPropagator,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl MutationGateway {
    pub fn new(repo: MonthRepository, propagator: StalenessPropagator) -> Self {
        Self {
            repo,
            propagator,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn cache(&self) -> &LocalCache {
        self.repo.cache()
    }

    async fn lock(&self, budget_id: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(budget_id.to_string())
            .or_default()
            .clone();
        mutex.lock_owned().await
    }

    /// Runs a mutation of `budget_id`: snapshot, `apply` to the cache, then `write` to the store.
    ///
    /// `apply` returns the cache keys it changed; they are marked pending until the write
    /// finishes. If `apply` fails, every cached entry of the budget is restored exactly as it was.
    /// If `write` fails, only the entries `apply` changed are put back; those that a recalculation
    /// or sync replaced again while the write was running are then reloaded from the store. Store read failures inside `write` are reported as
    /// `ErrorType::StoreWrite` because the mutation as a whole could not be stored.
    pub async fn mutate<T, A, W, Fut>(
        &self,
        budget_id: &str,
        operation: &str,
        apply: A,
        write: W,
    ) -> Result<T>
    where
        A: FnOnce(&LocalCache) -> Result<Vec<CacheKey>>,
        W: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _guard = self.lock(budget_id).await;
        let cache = self.cache();
        let snapshot = cache.snapshot(budget_id);

        let keys = match apply(cache) {
            Ok(keys) => keys,
            Err(e) => {
                cache.restore(snapshot);
                return Err(e);
            }
        };
        let applied = cache.snapshot(budget_id);
        for key in &keys {
            cache.begin_pending(key);
        }

        match write().await {
            Ok(value) => {
                for key in &keys {
                    cache.end_pending(key);
                }
                debug!("Committed {operation} for budget '{budget_id}'");
                Ok(value)
            }
            Err(e) => {
                let replaced = cache.rollback(snapshot, &applied);
                for key in &keys {
                    cache.end_pending(key);
                }
                for key in &replaced {
                    self.reload(key).await;
                }
                warn!("Rolled back {operation} for budget '{budget_id}': {e}");
                if e.is(ErrorType::StoreRead) {
                    Err(e.with_type(ErrorType::StoreWrite))
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Re-reads a rolled back entry that was also replaced by a newer document during the write.
    /// If the read fails the restored value stays until the next sync check adopts the newer one.
    async fn reload(&self, key: &CacheKey) {
        let reloaded = match key {
            CacheKey::Budget { budget_id } => self.repo.read_budget(budget_id).await.map(drop),
            CacheKey::Month {
                budget_id,
                year_month,
            } => self.repo.read_month(budget_id, *year_month).await.map(drop),
        };
        match reloaded {
            Ok(()) => debug!("Reloaded {key} after a rollback"),
            Err(e) => warn!("Unable to reload {key} after a rollback: {e}"),
        }
    }

    /// Returns the budget from the cache, reading it from the store if it is not cached.
    async fn budget(&self, budget_id: &str) -> Result<Budget> {
        match self.cache().budget(budget_id) {
            Some(budget) => Ok(budget),
            None => self.repo.read_budget(budget_id).await,
        }
    }

    /// Makes sure the month exists and is cached.
    async fn ensure_month(&self, budget_id: &str, ym: YearMonth) -> Result<()> {
        if self.cache().month(budget_id, ym).is_none() {
            self.repo.get_or_create_month(budget_id, ym).await?;
        }
        Ok(())
    }

    pub async fn add_income(&self, budget_id: &str, ym: YearMonth, income: Income) -> Result<Month> {
        self.edit_transactions(budget_id, ym, TransactionEdit::AddIncome(income))
            .await
    }

    pub async fn update_income(
        &self,
        budget_id: &str,
        ym: YearMonth,
        income: Income,
    ) -> Result<Month> {
        self.edit_transactions(budget_id, ym, TransactionEdit::UpdateIncome(income))
            .await
    }

    pub async fn delete_income(&self, budget_id: &str, ym: YearMonth, id: &str) -> Result<Month> {
        self.delete_of_kind(budget_id, ym, id, TransactionKind::Income)
            .await
    }

    pub async fn add_expense(
        &self,
        budget_id: &str,
        ym: YearMonth,
        expense: Expense,
    ) -> Result<Month> {
        self.edit_transactions(budget_id, ym, TransactionEdit::AddExpense(expense))
            .await
    }

    pub async fn update_expense(
        &self,
        budget_id: &str,
        ym: YearMonth,
        expense: Expense,
    ) -> Result<Month> {
        self.edit_transactions(budget_id, ym, TransactionEdit::UpdateExpense(expense))
            .await
    }

    pub async fn delete_expense(&self, budget_id: &str, ym: YearMonth, id: &str) -> Result<Month> {
        self.delete_of_kind(budget_id, ym, id, TransactionKind::Expense)
            .await
    }

    pub async fn add_transfer(
        &self,
        budget_id: &str,
        ym: YearMonth,
        transfer: Transfer,
    ) -> Result<Month> {
        self.edit_transactions(budget_id, ym, TransactionEdit::AddTransfer(transfer))
            .await
    }

    pub async fn add_adjustment(
        &self,
        budget_id: &str,
        ym: YearMonth,
        adjustment: Adjustment,
    ) -> Result<Month> {
        self.edit_transactions(budget_id, ym, TransactionEdit::AddAdjustment(adjustment))
            .await
    }

    /// Deletes a transaction of any kind.
    pub async fn delete_transaction(
        &self,
        budget_id: &str,
        ym: YearMonth,
        id: &str,
    ) -> Result<Month> {
        self.edit_transactions(budget_id, ym, TransactionEdit::Delete(id.to_string()))
            .await
    }

    async fn delete_of_kind(
        &self,
        budget_id: &str,
        ym: YearMonth,
        id: &str,
        kind: TransactionKind,
    ) -> Result<Month> {
        self.ensure_month(budget_id, ym).await?;
        let found = self
            .cache()
            .month(budget_id, ym)
            .and_then(|m| m.find_transaction(id));
        if found != Some(kind) {
            return Err(Error::msg(
                ErrorType::NotFound,
                format!("There is no {kind} '{id}' in month {ym} of budget '{budget_id}'"),
            ));
        }
        self.delete_transaction(budget_id, ym, id).await
    }

    /// Applies a transaction edit to month `ym`, marking it and every later month stale and
    /// adjusting the cached running balance of the affected accounts.
    pub async fn edit_transactions(
        &self,
        budget_id: &str,
        ym: YearMonth,
        edit: TransactionEdit,
    ) -> Result<Month> {
        let edit = edit.with_id();
        self.ensure_month(budget_id, ym).await?;
        let budget = self.budget(budget_id).await?;
        let channel = match self.cache().month(budget_id, ym) {
            Some(month) => channel_of(&month, &edit),
            None => StaleChannel::Both,
        };
        let operation = format!("transaction edit '{}' in {ym}", edit.transaction_id());
        let edit = &edit;

        let saved = self
            .mutate(
                budget_id,
                &operation,
                |cache| {
                    let mut month = cache.month(budget_id, ym).ok_or_else(|| {
                        Error::msg(ErrorType::NotFound, format!("Month {ym} is not cached"))
                    })?;
                    let deltas = apply_transaction_edit(&mut month, &budget, edit)?;
                    month.status = month.status.mark(channel);
                    cache.put_month(month);
                    cache.update_budget(budget_id, |cached| apply_deltas(cached, &deltas));
                    self.propagator
                        .mark_cached(budget_id, Scope::From(ym), channel);
                    Ok(vec![CacheKey::budget(budget_id), CacheKey::month(budget_id, ym)])
                },
                || async move {
                    self.propagator
                        .mark_stored(budget_id, Scope::From(ym), channel)
                        .await?;
                    let (saved, deltas) = self
                        .write_month_edit(budget_id, ym, channel, |month, budget| {
                            apply_transaction_edit(month, budget, edit)
                        })
                        .await?;
                    self.adjust_running_balances(budget_id, &deltas).await;
                    Ok(saved)
                },
            )
            .await?;

        // Authoritative now that the write is done.
        self.cache().put_month(saved.clone());
        info!("Saved {operation} for budget '{budget_id}'");
        Ok(saved)
    }

    /// Finalizes the allocations of month `ym`. Each category gets its draft amount if one is
    /// given, otherwise the amount its allocation rule proposes from the month's
    /// `previous_month_income`, rounded to cents. Finalized amounts are never recomputed later.
    pub async fn finalize_allocations(
        &self,
        budget_id: &str,
        ym: YearMonth,
        drafts: BTreeMap<String, Amount>,
    ) -> Result<Month> {
        self.edit_allocations(budget_id, ym, "finalize allocations", move |month, budget| {
            if month.are_allocations_finalized {
                return Err(Error::msg(
                    ErrorType::Validation,
                    format!("The allocations of month {} are already finalized", month.id()),
                ));
            }
            month.allocations = propose_allocations(month, budget, &drafts);
            month.are_allocations_finalized = true;
            Ok(BalanceDeltas::new())
        })
        .await
    }

    /// Changes one finalized allocation of month `ym`. Only category balances are affected.
    pub async fn edit_allocation(
        &self,
        budget_id: &str,
        ym: YearMonth,
        category_id: &str,
        amount: Amount,
    ) -> Result<Month> {
        let category_id = category_id.to_string();
        self.edit_allocations(budget_id, ym, "edit allocation", move |month, budget| {
            budget.category(&category_id)?;
            if !month.are_allocations_finalized {
                return Err(Error::msg(
                    ErrorType::Validation,
                    format!(
                        "The allocations of month {} must be finalized before they are edited",
                        month.id()
                    ),
                ));
            }
            month
                .allocations
                .insert(category_id.clone(), amount.round_currency());
            Ok(BalanceDeltas::new())
        })
        .await
    }

    async fn edit_allocations<E>(
        &self,
        budget_id: &str,
        ym: YearMonth,
        operation: &str,
        edit: E,
    ) -> Result<Month>
    where
        E: Fn(&mut Month, &Budget) -> Result<BalanceDeltas>,
    {
        self.ensure_month(budget_id, ym).await?;
        let budget = self.budget(budget_id).await?;
        let channel = StaleChannel::Categories;
        let edit = &edit;
        let saved = self
            .mutate(
                budget_id,
                operation,
                |cache| {
                    let mut month = cache.month(budget_id, ym).ok_or_else(|| {
                        Error::msg(ErrorType::NotFound, format!("Month {ym} is not cached"))
                    })?;
                    edit(&mut month, &budget)?;
                    month.status = month.status.mark(channel);
                    cache.put_month(month);
                    self.propagator
                        .mark_cached(budget_id, Scope::From(ym), channel);
                    Ok(vec![CacheKey::month(budget_id, ym)])
                },
                || async move {
                    self.propagator
                        .mark_stored(budget_id, Scope::From(ym), channel)
                        .await?;
                    let (saved, _) = self
                        .write_month_edit(budget_id, ym, channel, edit)
                        .await?;
                    Ok(saved)
                },
            )
            .await?;
        self.cache().put_month(saved.clone());
        info!("Saved {operation} for month {ym} of budget '{budget_id}'");
        Ok(saved)
    }

    /// Applies `edit` to a fresh copy of the stored month and writes it, retrying on a fresh copy
    /// if another device wrote the month in between.
    async fn write_month_edit<E>(
        &self,
        budget_id: &str,
        ym: YearMonth,
        channel: StaleChannel,
        edit: E,
    ) -> Result<(Month, BalanceDeltas)>
    where
        E: Fn(&mut Month, &Budget) -> Result<BalanceDeltas>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let budget = self.repo.read_budget(budget_id).await?;
            let fresh = self
                .repo
                .read_month(budget_id, ym)
                .await?
                .ok_or_else(|| {
                    Error::msg(
                        ErrorType::NotFound,
                        format!("Month {ym} of budget '{budget_id}' does not exist"),
                    )
                })?;
            let mut month = fresh.clone();
            let deltas = edit(&mut month, &budget)?;
            month.status = month.status.mark(channel);
            match self
                .repo
                .save_month_expecting(&month, fresh.updated_at)
                .await
            {
                Ok(saved) => return Ok((saved, deltas)),
                Err(e) if is_precondition_failed(&e) && attempt < MAX_EDIT_ATTEMPTS => {
                    debug!("Month {ym} changed while it was being edited, retrying: {e}");
                }
                Err(e) => return Err(Error::new(ErrorType::StoreWrite, e)),
            }
        }
    }

    /// Adds `deltas` to the stored running balances. Failures are logged because the balances are
    /// rewritten by the next complete recalculation anyway.
    async fn adjust_running_balances(&self, budget_id: &str, deltas: &BalanceDeltas) {
        if deltas.is_empty() {
            return;
        }
        let result = async {
            let budget = self.repo.read_budget(budget_id).await?;
            let mut accounts = Map::new();
            for (id, delta) in deltas {
                let current = budget.account(id)?.balance;
                let balance = serde_json::to_value(current + *delta)
                    .map_err(anyhow::Error::from)
                    .pub_result(ErrorType::Internal)?;
                accounts.insert(id.clone(), json!({ "balance": balance }));
            }
            let updated_at = self
                .repo
                .write_budget_fields(budget_id, fields([("accounts", Value::Object(accounts))]))
                .await?;
            let mut stored = budget;
            apply_deltas(&mut stored, deltas);
            stored.updated_at = Some(updated_at);
            Ok::<Budget, Error>(stored)
        }
        .await;
        match result {
            Ok(stored) => {
                let cache = self.cache();
                let month_map = cache.budget(budget_id).map(|b| b.month_map);
                let mut stored = stored;
                if let Some(month_map) = month_map {
                    stored.month_map = month_map;
                }
                cache.put_budget(stored);
            }
            Err(e) => warn!("Unable to adjust the running balances of '{budget_id}': {e}"),
        }
    }

    /// Adds an account to the budget. Every month is marked stale on the accounts channel so that
    /// the next recalculation includes it.
    pub async fn add_account(&self, budget_id: &str, id: &str, account: Account) -> Result<Budget> {
        let value = to_document(&account).pub_result(ErrorType::Internal)?;
        self.add_entity(budget_id, id, "accounts", value, StaleChannel::Accounts, |b| {
            b.accounts.insert(id.to_string(), account.clone());
        })
        .await
    }

    /// Adds a category to the budget. Every month is marked stale on the categories channel so
    /// that the next recalculation includes it.
    pub async fn add_category(
        &self,
        budget_id: &str,
        id: &str,
        category: Category,
    ) -> Result<Budget> {
        let value = to_document(&category).pub_result(ErrorType::Internal)?;
        self.add_entity(budget_id, id, "categories", value, StaleChannel::Categories, |b| {
            b.categories.insert(id.to_string(), category.clone());
        })
        .await
    }

    async fn add_entity<F>(
        &self,
        budget_id: &str,
        id: &str,
        field: &str,
        value: Value,
        channel: StaleChannel,
        insert: F,
    ) -> Result<Budget>
    where
        F: Fn(&mut Budget),
    {
        let budget = self.budget(budget_id).await?;
        if budget.accounts.contains_key(id) || budget.categories.contains_key(id) {
            return Err(Error::msg(
                ErrorType::Validation,
                format!("Budget '{budget_id}' already has an account or category '{id}'"),
            ));
        }
        let earliest = budget.earliest_month();
        let operation = format!("add {field} '{id}'");
        self.mutate(
            budget_id,
            &operation,
            |cache| {
                cache.update_budget(budget_id, &insert);
                if let Some(earliest) = earliest {
                    self.propagator
                        .mark_cached(budget_id, Scope::From(earliest), channel);
                }
                Ok(vec![CacheKey::budget(budget_id)])
            },
            || async move {
                let mut entities = Map::new();
                entities.insert(id.to_string(), value);
                self.repo
                    .write_budget_fields(budget_id, fields([(field, Value::Object(entities))]))
                    .await?;
                if let Some(earliest) = earliest {
                    self.propagator
                        .mark_stored(budget_id, Scope::From(earliest), channel)
                        .await?;
                }
                Ok(())
            },
        )
        .await?;
        let budget = self.repo.read_budget(budget_id).await?;
        info!("Added {field} '{id}' to budget '{budget_id}'");
        Ok(budget)
    }
}

fn apply_deltas(budget: &mut Budget, deltas: &BalanceDeltas) {
    for (id, delta) in deltas {
        if let Some(account) = budget.accounts.get_mut(id) {
            account.balance += *delta;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Res;
    use crate::ledger::Ledger;
    use crate::model::RecalcStatus;
    use crate::recalc::Recalculator;
    use crate::store::{Document, DocumentStore, Filter, MemoryStore, WriteOptions, BUDGETS, MONTHS};
    use crate::test::{amt, ym, TestLedger};
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

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
    async fn expense_marks_edited_and_later_months_stale() {
        let env = TestLedger::with_months(ym(2024, 1), 3).await;
        let month = env
            .gateway()
            .add_expense("b1", ym(2024, 2), expense("e1", "200"))
            .await
            .unwrap();
        assert_eq!(month.expenses.len(), 1);
        assert_eq!(month.status, RecalcStatus::StaleBoth);

        let repo = env.repo();
        let jan = repo.read_month("b1", ym(2024, 1)).await.unwrap().unwrap();
        let mar = repo.read_month("b1", ym(2024, 3)).await.unwrap().unwrap();
        assert_eq!(jan.status, RecalcStatus::Fresh);
        assert_eq!(mar.status, RecalcStatus::StaleBoth);
        let budget = env.cache.budget("b1").unwrap();
        assert_eq!(budget.earliest_stale(), Some(ym(2024, 2)));
        assert_eq!(budget.accounts["checking"].balance, amt("800"));
        assert_eq!(env.cache.pending(&CacheKey::month("b1", ym(2024, 2))), 0);
    }

    #[tokio::test]
    async fn failed_write_restores_the_cache_exactly() {
        let env = TestLedger::with_months(ym(2024, 1), 3).await;
        let before = env.cache.snapshot("b1");
        env.store
            .fail_writes_to(MONTHS, &Month::document_id("b1", ym(2024, 2)));

        let err = env
            .gateway()
            .add_expense("b1", ym(2024, 2), expense("e1", "200"))
            .await
            .unwrap_err();
        assert!(err.is(ErrorType::StoreWrite), "{err}");
        assert_eq!(env.cache.snapshot("b1"), before);
    }

    /// Recalculates the budget from January, through the shared cache, before failing the first
    /// write to March.
    struct RecalcThenFail {
        inner: MemoryStore,
        cache: LocalCache,
        fired: AtomicBool,
    }

    #[async_trait::async_trait]
    impl DocumentStore for RecalcThenFail {
        async fn read(&self, collection: &str, id: &str) -> Res<Option<Document>> {
            self.inner.read(collection, id).await
        }

        async fn write(
            &self,
            collection: &str,
            id: &str,
            data: Value,
            options: WriteOptions,
        ) -> Res<DateTime<Utc>> {
            if collection == MONTHS
                && id == Month::document_id("b1", ym(2024, 3))
                && !self.fired.swap(true, Ordering::SeqCst)
            {
                let repo = MonthRepository::new(Arc::new(self.inner.clone()), self.cache.clone());
                Recalculator::new(repo).recalculate("b1", ym(2024, 1)).await?;
                anyhow::bail!("Simulated write failure for {collection}/{id}");
            }
            self.inner.write(collection, id, data, options).await
        }

        async fn query(&self, collection: &str, filters: &[Filter]) -> Res<Vec<Document>> {
            self.inner.query(collection, filters).await
        }

        async fn delete(&self, collection: &str, id: &str) -> Res<()> {
            self.inner.delete(collection, id).await
        }
    }

    #[tokio::test]
    async fn failed_write_keeps_entries_recalculated_meanwhile() {
        let env = TestLedger::with_months(ym(2024, 1), 3).await;
        env.gateway()
            .add_expense("b1", ym(2024, 1), expense("e1", "10"))
            .await
            .unwrap();
        assert_eq!(
            env.cache.month("b1", ym(2024, 1)).unwrap().status,
            RecalcStatus::StaleBoth
        );

        let store = RecalcThenFail {
            inner: env.store.clone(),
            cache: env.cache.clone(),
            fired: AtomicBool::new(false),
        };
        let ledger = Ledger::with_cache(Arc::new(store), env.cache.clone());
        let income = Income {
            id: "i1".into(),
            account_id: "checking".into(),
            amount: amt("50"),
            ..Default::default()
        };
        let err = ledger
            .gateway()
            .add_income("b1", ym(2024, 3), income)
            .await
            .unwrap_err();
        assert!(err.is(ErrorType::StoreWrite), "{err}");

        // Read the cache before the store; store reads refresh the cache.
        let cached_months = env.cache.months("b1");
        let budget = env.cache.budget("b1").unwrap();
        assert_eq!(budget.earliest_stale(), None);
        assert_eq!(budget.accounts["checking"].balance, amt("990"));
        assert_eq!(env.cache.pending(&CacheKey::budget("b1")), 0);
        assert_eq!(cached_months.len(), 3);
        assert_eq!(cached_months[0].account_end_balance("checking"), Some(amt("990")));
        assert!(cached_months[2].income.is_empty());

        let repo = env.repo();
        for cached in cached_months {
            let stored = repo
                .read_month("b1", cached.year_month())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(stored.status, RecalcStatus::Fresh);
            assert_eq!(cached.status, RecalcStatus::Fresh, "{}", cached.id());
            assert_eq!(cached.updated_at, stored.updated_at, "{}", cached.id());
            assert_eq!(
                env.cache.pending(&CacheKey::month("b1", cached.year_month())),
                0
            );
        }
    }

    #[tokio::test]
    async fn failed_budget_write_restores_the_cache_exactly() {
        let env = TestLedger::with_months(ym(2024, 1), 2).await;
        let before = env.cache.snapshot("b1");
        env.store.fail_next_writes(BUDGETS, 1);
        let err = env
            .gateway()
            .add_account("b1", "cash", Account::default())
            .await
            .unwrap_err();
        assert!(err.is(ErrorType::StoreWrite), "{err}");
        assert_eq!(env.cache.snapshot("b1"), before);
    }

    #[tokio::test]
    async fn invalid_edits_change_nothing() {
        let env = TestLedger::with_months(ym(2024, 1), 1).await;
        let before = env.cache.snapshot("b1");
        let writes = env.store.write_count();
        let gateway = env.gateway();

        let mut bad = expense("e1", "10");
        bad.category_id = "nope".into();
        let err = gateway.add_expense("b1", ym(2024, 1), bad).await.unwrap_err();
        assert!(err.is(ErrorType::NotFound));

        let err = gateway
            .delete_transaction("b1", ym(2024, 1), "missing")
            .await
            .unwrap_err();
        assert!(err.is(ErrorType::NotFound));

        assert_eq!(env.cache.snapshot("b1"), before);
        assert_eq!(env.store.write_count(), writes);
    }

    #[tokio::test]
    async fn update_and_delete_adjust_running_balance() {
        let env = TestLedger::with_months(ym(2024, 1), 1).await;
        let gateway = env.gateway();
        gateway
            .add_expense("b1", ym(2024, 1), expense("e1", "200"))
            .await
            .unwrap();
        gateway
            .update_expense("b1", ym(2024, 1), expense("e1", "150"))
            .await
            .unwrap();
        assert_eq!(
            env.cache.budget("b1").unwrap().accounts["checking"].balance,
            amt("850")
        );
        let err = gateway
            .delete_income("b1", ym(2024, 1), "e1")
            .await
            .unwrap_err();
        assert!(err.is(ErrorType::NotFound));
        let month = gateway
            .delete_expense("b1", ym(2024, 1), "e1")
            .await
            .unwrap();
        assert!(month.expenses.is_empty());
        let stored = env.repo().read_budget("b1").await.unwrap();
        assert_eq!(stored.accounts["checking"].balance, amt("1000"));
    }

    #[tokio::test]
    async fn allocation_edit_marks_only_categories() {
        let env = TestLedger::with_months(ym(2024, 1), 2).await;
        let gateway = env.gateway();
        let mut drafts = BTreeMap::new();
        drafts.insert("groceries".to_string(), amt("100"));
        let jan = gateway
            .finalize_allocations("b1", ym(2024, 1), drafts.clone())
            .await
            .unwrap();
        assert!(jan.are_allocations_finalized);
        assert_eq!(jan.allocations["groceries"], amt("100"));
        assert_eq!(jan.status, RecalcStatus::StaleCategories);

        let err = gateway
            .finalize_allocations("b1", ym(2024, 1), drafts)
            .await
            .unwrap_err();
        assert!(err.is(ErrorType::Validation));

        let feb = env.repo().read_month("b1", ym(2024, 2)).await.unwrap().unwrap();
        assert_eq!(feb.status, RecalcStatus::StaleCategories);
        let err = gateway
            .edit_allocation("b1", ym(2024, 2), "groceries", amt("5"))
            .await
            .unwrap_err();
        assert!(err.is(ErrorType::Validation));
    }

    #[tokio::test]
    async fn concurrent_remote_edit_is_not_lost() {
        let env = TestLedger::with_months(ym(2024, 1), 1).await;
        // Another device adds an expense the local cache has not seen.
        let mut remote = env.repo().read_month("b1", ym(2024, 1)).await.unwrap().unwrap();
        remote.expenses.push(expense("remote", "1"));
        let other = crate::months::MonthRepository::new(
            std::sync::Arc::new(env.store.clone()),
            LocalCache::new(),
        );
        other.save_month(&remote).await.unwrap();

        let month = env
            .gateway()
            .add_expense("b1", ym(2024, 1), expense("local", "2"))
            .await
            .unwrap();
        let ids: Vec<&str> = month.expenses.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["remote", "local"]);
    }

    #[test]
    fn transfer_deltas() {
        let env_budget = crate::test::budget();
        let mut month = Month::new("b1", ym(2024, 1));
        let deltas = apply_transaction_edit(
            &mut month,
            &env_budget,
            &TransactionEdit::AddTransfer(Transfer {
                id: "t1".into(),
                from_account_id: "checking".into(),
                to_account_id: "savings".into(),
                amount: amt("300"),
                ..Default::default()
            }),
        )
        .unwrap();
        assert_eq!(deltas["checking"], amt("-300"));
        assert_eq!(deltas["savings"], amt("300"));
        let deltas =
            apply_transaction_edit(&mut month, &env_budget, &TransactionEdit::Delete("t1".into()))
                .unwrap();
        assert_eq!(deltas["checking"], amt("300"));
        assert!(month.transfers.is_empty());
    }
}

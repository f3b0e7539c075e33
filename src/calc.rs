//! The balance calculator.
//!
//! Everything in this module is pure: a month's per-account and per-category balances are derived
//! from the month's own transactions, its finalized allocations and the previous month's end
//! balances. Nothing here reads or writes a store.
//!
//! Malformed records (a transaction that references an account or category the budget does not
//! have) are logged, reported in `MonthBalances::skipped`, and contribute nothing. The only error
//! is arithmetic overflow, because continuing past it would break
//! `end = start + inflows - outflows`.

use crate::error::{ErrorType, IntoResult, Res};
use crate::model::{
    AccountMonthBalance, Amount, Budget, CategoryMonthBalance, Month, TransactionKind,
};
use crate::Result;
use anyhow::{bail, Context};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{trace, warn};

/// The previous month's end balances, which become this month's start balances.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PreviousBalances {
    pub accounts: BTreeMap<String, Amount>,
    pub categories: BTreeMap<String, Amount>,
    /// Total income of the previous month.
    pub total_income: Amount,
}

impl PreviousBalances {
    /// Takes the end balances stored in `month`. Fails with `ErrorType::Calculation` if the
    /// month's total income overflows.
    pub fn from_month(month: &Month) -> Result<Self> {
        Ok(Self {
            accounts: month
                .account_balances
                .iter()
                .map(|(id, b)| (id.clone(), b.end_balance))
                .collect(),
            categories: month
                .category_balances
                .iter()
                .map(|(id, b)| (id.clone(), b.end_balance))
                .collect(),
            total_income: month.total_income()?,
        })
    }
}

/// A record the calculator ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRecord {
    pub kind: TransactionKind,
    pub id: String,
    pub reason: String,
}

/// The derived balances of one month.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MonthBalances {
    pub accounts: BTreeMap<String, AccountMonthBalance>,
    pub categories: BTreeMap<String, CategoryMonthBalance>,
    pub skipped: Vec<SkippedRecord>,
}

/// Computes the balances of `month`.
///
/// `previous` is `None` when `month` is the first month of the budget, in which case accounts
/// start from their opening balance. Otherwise an account or category that is missing from
/// `previous` (e.g. it was created after the previous month was calculated) starts at zero.
pub fn compute_month_balances(
    month: &Month,
    previous: Option<&PreviousBalances>,
    budget: &Budget,
) -> Result<MonthBalances> {
    compute(month, previous, budget)
        .with_context(|| format!("Unable to calculate balances for month {}", month.id()))
        .pub_result(ErrorType::Calculation)
}

fn compute(month: &Month, previous: Option<&PreviousBalances>, budget: &Budget) -> Res<MonthBalances> {
    let mut skipped = Vec::new();

    let mut accounts: BTreeMap<String, AccountMonthBalance> = budget
        .accounts
        .iter()
        .map(|(id, account)| {
            let start_balance = match previous {
                None => account.opening_balance,
                Some(prev) => prev.accounts.get(id).copied().unwrap_or_default(),
            };
            (
                id.clone(),
                AccountMonthBalance {
                    start_balance,
                    ..Default::default()
                },
            )
        })
        .collect();

    let mut categories: BTreeMap<String, CategoryMonthBalance> = budget
        .categories
        .keys()
        .map(|id| {
            let start_balance = previous
                .and_then(|prev| prev.categories.get(id).copied())
                .unwrap_or_default();
            let allocated = if month.are_allocations_finalized {
                month.allocations.get(id).copied().unwrap_or_default()
            } else {
                Amount::ZERO
            };
            (
                id.clone(),
                CategoryMonthBalance {
                    start_balance,
                    allocated,
                    ..Default::default()
                },
            )
        })
        .collect();

    if month.are_allocations_finalized {
        for id in month.allocations.keys() {
            if !budget.categories.contains_key(id) {
                warn!("Month {} has an allocation for unknown category '{id}'", month.id());
            }
        }
    }

    for income in &month.income {
        match accounts.get_mut(&income.account_id) {
            Some(balance) => add(&mut balance.income, income.amount, "income")?,
            None => skip(
                &mut skipped,
                month,
                TransactionKind::Income,
                &income.id,
                format!("unknown account '{}'", income.account_id),
            ),
        }
    }

    for expense in &month.expenses {
        if !accounts.contains_key(&expense.account_id) {
            skip(
                &mut skipped,
                month,
                TransactionKind::Expense,
                &expense.id,
                format!("unknown account '{}'", expense.account_id),
            );
            continue;
        }
        if !categories.contains_key(&expense.category_id) {
            skip(
                &mut skipped,
                month,
                TransactionKind::Expense,
                &expense.id,
                format!("unknown category '{}'", expense.category_id),
            );
            continue;
        }
        if let Some(balance) = accounts.get_mut(&expense.account_id) {
            add(&mut balance.expenses, expense.amount, "expenses")?;
        }
        if let Some(balance) = categories.get_mut(&expense.category_id) {
            add(&mut balance.spent, expense.amount, "spent")?;
        }
    }

    for transfer in &month.transfers {
        let known = accounts.contains_key(&transfer.from_account_id)
            && accounts.contains_key(&transfer.to_account_id);
        if !known || transfer.from_account_id == transfer.to_account_id {
            skip(
                &mut skipped,
                month,
                TransactionKind::Transfer,
                &transfer.id,
                format!(
                    "invalid accounts '{}' -> '{}'",
                    transfer.from_account_id, transfer.to_account_id
                ),
            );
            continue;
        }
        if let Some(balance) = accounts.get_mut(&transfer.from_account_id) {
            add(&mut balance.transfers, -transfer.amount, "transfers")?;
        }
        if let Some(balance) = accounts.get_mut(&transfer.to_account_id) {
            add(&mut balance.transfers, transfer.amount, "transfers")?;
        }
    }

    for adjustment in &month.adjustments {
        let account_ok = adjustment
            .account_id
            .as_ref()
            .map_or(true, |id| accounts.contains_key(id));
        let category_ok = adjustment
            .category_id
            .as_ref()
            .map_or(true, |id| categories.contains_key(id));
        let targets_something = adjustment.account_id.is_some() || adjustment.category_id.is_some();
        if !(account_ok && category_ok && targets_something) {
            skip(
                &mut skipped,
                month,
                TransactionKind::Adjustment,
                &adjustment.id,
                "adjustment targets no known account or category".to_string(),
            );
            continue;
        }
        if let Some(balance) = adjustment.account_id.as_ref().and_then(|id| accounts.get_mut(id)) {
            add(&mut balance.adjustments, adjustment.amount, "adjustments")?;
        }
        if let Some(balance) = adjustment
            .category_id
            .as_ref()
            .and_then(|id| categories.get_mut(id))
        {
            add(&mut balance.adjustments, adjustment.amount, "adjustments")?;
        }
    }

    for (id, balance) in accounts.iter_mut() {
        let net = checked(balance.income.checked_sub(balance.expenses), id)?;
        let net = checked(net.checked_add(balance.transfers), id)?;
        balance.net_change = checked(net.checked_add(balance.adjustments), id)?;
        balance.end_balance = checked(balance.start_balance.checked_add(balance.net_change), id)?;
    }

    for (id, balance) in categories.iter_mut() {
        let end = checked(balance.start_balance.checked_add(balance.allocated), id)?;
        let end = checked(end.checked_sub(balance.spent), id)?;
        balance.end_balance = checked(end.checked_add(balance.adjustments), id)?;
    }

    trace!(
        "Calculated {} account and {} category balances for {}",
        accounts.len(),
        categories.len(),
        month.id()
    );

    Ok(MonthBalances {
        accounts,
        categories,
        skipped,
    })
}

/// Proposes the allocation of every category of `budget` for `month`.
///
/// A draft amount wins; otherwise the category's allocation rule is applied to the month's
/// `previous_month_income`; otherwise zero. All amounts are rounded to cents. Drafts for
/// categories the budget does not have are ignored.
pub fn propose_allocations(
    month: &Month,
    budget: &Budget,
    drafts: &BTreeMap<String, Amount>,
) -> BTreeMap<String, Amount> {
    for id in drafts.keys() {
        if !budget.categories.contains_key(id) {
            warn!("Ignoring draft allocation for unknown category '{id}'");
        }
    }
    budget
        .categories
        .iter()
        .map(|(id, category)| {
            let amount = match drafts.get(id) {
                Some(draft) => draft.round_currency(),
                None => category
                    .allocation_rule
                    .as_ref()
                    .map(|rule| rule.propose(month.previous_month_income))
                    .unwrap_or_default(),
            };
            (id.clone(), amount)
        })
        .collect()
}

/// Checks `end = start + inflows - outflows` for every balance of `month`.
pub fn verify_month(month: &Month) -> Result<()> {
    verify(month)
        .with_context(|| format!("Balance invariant violated in month {}", month.id()))
        .pub_result(ErrorType::Calculation)
}

fn verify(month: &Month) -> Res<()> {
    for (id, b) in &month.account_balances {
        let expected = b.start_balance + b.income - b.expenses + b.transfers + b.adjustments;
        if expected != b.end_balance || b.end_balance - b.start_balance != b.net_change {
            bail!(
                "Account '{id}' ends at {} but its inputs add up to {expected}",
                b.end_balance
            );
        }
    }
    for (id, b) in &month.category_balances {
        let expected = b.start_balance + b.allocated - b.spent + b.adjustments;
        if expected != b.end_balance {
            bail!(
                "Category '{id}' ends at {} but its inputs add up to {expected}",
                b.end_balance
            );
        }
    }
    Ok(())
}

fn add(total: &mut Amount, amount: Amount, what: &str) -> Res<()> {
    *total = match total.checked_add(amount) {
        Some(sum) => sum,
        None => bail!("Overflow while adding {amount} to {what}"),
    };
    Ok(())
}

fn checked(value: Option<Amount>, id: &str) -> Res<Amount> {
    value.with_context(|| format!("Overflow while calculating the balance of '{id}'"))
}

fn skip(
    skipped: &mut Vec<SkippedRecord>,
    month: &Month,
    kind: TransactionKind,
    id: &str,
    reason: String,
) {
    warn!(
        "Treating {kind} '{id}' in month {} as zero: {reason}",
        month.id()
    );
    skipped.push(SkippedRecord {
        kind,
        id: id.to_string(),
        reason,
    });
}

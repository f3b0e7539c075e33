//! The month document: one per (budget, year, month).

use crate::error::{Error, ErrorType};
use crate::model::{Amount, RecalcStatus, YearMonth};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Money received into an account.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Income {
    pub id: String,
    pub account_id: String,
    pub amount: Amount,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<chrono::NaiveDate>,
}

/// Money spent from an account against a category.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Expense {
    pub id: String,
    pub account_id: String,
    pub category_id: String,
    pub amount: Amount,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<chrono::NaiveDate>,
}

/// Money moved between two accounts of the budget.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Transfer {
    pub id: String,
    pub from_account_id: String,
    pub to_account_id: String,
    pub amount: Amount,
    #[serde(default)]
    pub description: String,
}

/// A signed correction applied to an account balance, a category balance, or both.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Adjustment {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    pub amount: Amount,
    #[serde(default)]
    pub description: String,
}

/// One account's balances for one month.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AccountMonthBalance {
    pub start_balance: Amount,
    pub income: Amount,
    pub expenses: Amount,
    /// Transfers in minus transfers out.
    pub transfers: Amount,
    pub adjustments: Amount,
    pub net_change: Amount,
    pub end_balance: Amount,
}

/// One category's balances for one month.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CategoryMonthBalance {
    pub start_balance: Amount,
    pub allocated: Amount,
    pub spent: Amount,
    pub adjustments: Amount,
    pub end_balance: Amount,
}

/// A month of a budget, stored at `months/{budget_id}_{year}_{MM}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Month {
    pub budget_id: String,
    pub year: i32,
    pub month: u32,
    pub year_month_ordinal: i64,
    #[serde(default)]
    pub income: Vec<Income>,
    #[serde(default)]
    pub expenses: Vec<Expense>,
    #[serde(default)]
    pub transfers: Vec<Transfer>,
    #[serde(default)]
    pub adjustments: Vec<Adjustment>,
    /// Once true, `allocations` is locked in and used by the balance calculation.
    #[serde(default)]
    pub are_allocations_finalized: bool,
    /// Finalized allocation per category id.
    #[serde(default)]
    pub allocations: BTreeMap<String, Amount>,
    #[serde(default)]
    pub account_balances: BTreeMap<String, AccountMonthBalance>,
    #[serde(default)]
    pub category_balances: BTreeMap<String, CategoryMonthBalance>,
    #[serde(flatten)]
    pub status: RecalcStatus,
    /// Total income of the previous month, used for percentage allocation rules.
    #[serde(default)]
    pub previous_month_income: Amount,
    /// Stamped by the document store on every write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Which transaction list a transaction id was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Income,
    Expense,
    Transfer,
    Adjustment,
}

serde_plain::derive_display_from_serialize!(TransactionKind);
serde_plain::derive_fromstr_from_deserialize!(TransactionKind);

impl Month {
    /// Creates an empty, fresh month.
    pub fn new(budget_id: impl Into<String>, ym: YearMonth) -> Self {
        Self {
            budget_id: budget_id.into(),
            year: ym.year(),
            month: ym.month(),
            year_month_ordinal: ym.ordinal(),
            income: Vec::new(),
            expenses: Vec::new(),
            transfers: Vec::new(),
            adjustments: Vec::new(),
            are_allocations_finalized: false,
            allocations: BTreeMap::new(),
            account_balances: BTreeMap::new(),
            category_balances: BTreeMap::new(),
            status: RecalcStatus::Fresh,
            previous_month_income: Amount::ZERO,
            updated_at: None,
        }
    }

    /// The document id of a month.
    pub fn document_id(budget_id: &str, ym: YearMonth) -> String {
        format!("{budget_id}_{}_{:02}", ym.year(), ym.month())
    }

    pub fn id(&self) -> String {
        Month::document_id(&self.budget_id, self.year_month())
    }

    /// The month's `YearMonth`. Month documents are validated when they are read from the store.
    pub fn year_month(&self) -> YearMonth {
        YearMonth::new_unchecked(self.year, self.month)
    }

    /// The sum of all income, including income to accounts the budget does not know.
    ///
    /// # Errors
    /// - `ErrorType::Calculation` if the sum overflows.
    pub fn total_income(&self) -> Result<Amount> {
        Amount::checked_sum(self.income.iter().map(|t| t.amount))
            .ok_or_else(|| self.overflow("income"))
    }

    pub fn total_expenses(&self) -> Result<Amount> {
        Amount::checked_sum(self.expenses.iter().map(|t| t.amount))
            .ok_or_else(|| self.overflow("expenses"))
    }

    fn overflow(&self, what: &str) -> Error {
        Error::msg(
            ErrorType::Calculation,
            format!("The total {what} of month {} overflows", self.id()),
        )
    }

    /// True if the month carries no transactions and no finalized allocations.
    pub fn is_placeholder(&self) -> bool {
        self.income.is_empty()
            && self.expenses.is_empty()
            && self.transfers.is_empty()
            && self.adjustments.is_empty()
            && !self.are_allocations_finalized
    }

    /// Finds which list holds the transaction with `id`.
    pub fn find_transaction(&self, id: &str) -> Option<TransactionKind> {
        if self.income.iter().any(|t| t.id == id) {
            Some(TransactionKind::Income)
        } else if self.expenses.iter().any(|t| t.id == id) {
            Some(TransactionKind::Expense)
        } else if self.transfers.iter().any(|t| t.id == id) {
            Some(TransactionKind::Transfer)
        } else if self.adjustments.iter().any(|t| t.id == id) {
            Some(TransactionKind::Adjustment)
        } else {
            None
        }
    }

    /// The cached end balance of an account, if it has been calculated.
    pub fn account_end_balance(&self, account_id: &str) -> Option<Amount> {
        self.account_balances.get(account_id).map(|b| b.end_balance)
    }

    /// The cached end balance of a category, if it has been calculated.
    pub fn category_end_balance(&self, category_id: &str) -> Option<Amount> {
        self.category_balances
            .get(category_id)
            .map(|b| b.end_balance)
    }
}

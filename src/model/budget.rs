//! The budget document: configuration entities and the index of months.

use crate::error::{Error, ErrorType};
use crate::model::{Amount, YearMonth};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// The top-level container of a ledger, stored at `budgets/{id}`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Budget {
    pub id: String,
    #[serde(default)]
    pub owner_id: String,
    #[serde(default)]
    pub member_ids: Vec<String>,
    #[serde(default)]
    pub accounts: BTreeMap<String, Account>,
    #[serde(default)]
    pub account_groups: BTreeMap<String, Group>,
    #[serde(default)]
    pub categories: BTreeMap<String, Category>,
    #[serde(default)]
    pub category_groups: BTreeMap<String, Group>,
    /// Every month that exists for this budget, keyed by the zero-padded `YYYYMM` ordinal so that
    /// key order is chronological.
    #[serde(default)]
    pub month_map: BTreeMap<String, MonthMapEntry>,
    /// Stamped by the document store on every write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// An entry in `Budget::month_map`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MonthMapEntry {
    #[serde(default)]
    pub needs_recalculation: bool,
}

/// A named group used to organize accounts or categories.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Group {
    pub name: String,
    #[serde(default)]
    pub sort_order: i32,
}

/// A financial account such as a checking account or credit card.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Account {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default)]
    pub sort_order: i32,
    /// The balance the account starts the budget's first month with.
    #[serde(default)]
    pub opening_balance: Amount,
    /// Cached running balance. Derived from the month chain; never ground truth.
    #[serde(default)]
    pub balance: Amount,
}

/// A budget category such as "Groceries".
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Category {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default)]
    pub sort_order: i32,
    /// How the category's allocation is proposed when a month's allocations are finalized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_rule: Option<AllocationRule>,
    /// Cached running balance. Derived from the month chain; never ground truth.
    #[serde(default)]
    pub balance: Amount,
}

/// The default allocation of a category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AllocationRule {
    /// The same amount every month.
    Fixed { amount: Amount },
    /// A percentage of the previous month's total income.
    Percentage { percentage: Decimal },
}

impl AllocationRule {
    /// The amount this rule proposes given the previous month's income, rounded to cents.
    pub fn propose(&self, previous_month_income: Amount) -> Amount {
        match self {
            AllocationRule::Fixed { amount } => *amount,
            AllocationRule::Percentage { percentage } => previous_month_income
                .percent(*percentage)
                .unwrap_or_else(|| {
                    warn!("Percentage allocation of {percentage}% overflowed, using zero");
                    Amount::ZERO
                }),
        }
    }
}

impl Budget {
    /// Creates an empty budget owned by `owner_id`.
    pub fn new(id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            ..Default::default()
        }
    }

    /// All months of the budget in ascending order. Malformed keys are skipped.
    pub fn months(&self) -> Vec<YearMonth> {
        self.month_map
            .keys()
            .filter_map(|key| match YearMonth::from_key(key) {
                Ok(ym) => Some(ym),
                Err(e) => {
                    warn!("Ignoring malformed month_map key in budget {}: {e}", self.id);
                    None
                }
            })
            .collect()
    }

    pub fn earliest_month(&self) -> Option<YearMonth> {
        self.months().first().copied()
    }

    pub fn latest_month(&self) -> Option<YearMonth> {
        self.months().last().copied()
    }

    pub fn has_month(&self, ym: YearMonth) -> bool {
        self.month_map.contains_key(&ym.key())
    }

    /// True if `ym` is the first month of the budget, or the budget has no months yet.
    pub fn is_first_month(&self, ym: YearMonth) -> bool {
        match self.earliest_month() {
            Some(earliest) => ym <= earliest,
            None => true,
        }
    }

    /// Months from `from` (inclusive) to the latest month, ascending.
    pub fn months_from(&self, from: YearMonth) -> Vec<YearMonth> {
        self.months().into_iter().filter(|ym| *ym >= from).collect()
    }

    /// The earliest month flagged as needing recalculation, if any.
    pub fn earliest_stale(&self) -> Option<YearMonth> {
        self.month_map
            .iter()
            .find(|(_, entry)| entry.needs_recalculation)
            .and_then(|(key, _)| YearMonth::from_key(key).ok())
    }

    /// Sets the `month_map` flag for `ym`, creating the entry if needed.
    pub fn set_needs_recalculation(&mut self, ym: YearMonth, value: bool) {
        self.month_map.entry(ym.key()).or_default().needs_recalculation = value;
    }

    pub fn account(&self, id: &str) -> crate::Result<&Account> {
        self.accounts.get(id).ok_or_else(|| {
            Error::msg(
                ErrorType::NotFound,
                format!("Account '{id}' does not exist in budget '{}'", self.id),
            )
        })
    }

    pub fn category(&self, id: &str) -> crate::Result<&Category> {
        self.categories.get(id).ok_or_else(|| {
            Error::msg(
                ErrorType::NotFound,
                format!("Category '{id}' does not exist in budget '{}'", self.id),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn ym(y: i32, m: u32) -> YearMonth {
        YearMonth::new(y, m).unwrap()
    }

    fn budget_with_months(months: &[YearMonth]) -> Budget {
        let mut budget = Budget::new("b1", "u1");
        for m in months {
            budget.set_needs_recalculation(*m, false);
        }
        budget
    }

    #[test]
    fn months_are_chronological_across_years() {
        let budget = budget_with_months(&[ym(2024, 1), ym(2023, 11), ym(2023, 12)]);
        assert_eq!(budget.months(), vec![ym(2023, 11), ym(2023, 12), ym(2024, 1)]);
        assert_eq!(budget.earliest_month(), Some(ym(2023, 11)));
        assert_eq!(budget.latest_month(), Some(ym(2024, 1)));
    }

    #[test]
    fn earliest_stale() {
        let mut budget = budget_with_months(&[ym(2024, 1), ym(2024, 2), ym(2024, 3)]);
        assert_eq!(budget.earliest_stale(), None);
        budget.set_needs_recalculation(ym(2024, 3), true);
        budget.set_needs_recalculation(ym(2024, 2), true);
        assert_eq!(budget.earliest_stale(), Some(ym(2024, 2)));
    }

    #[test]
    fn first_month() {
        let budget = budget_with_months(&[ym(2024, 5), ym(2024, 6)]);
        assert!(budget.is_first_month(ym(2024, 5)));
        assert!(!budget.is_first_month(ym(2024, 6)));
        assert!(Budget::new("b", "u").is_first_month(ym(2030, 1)));
    }

    #[test]
    fn missing_entities_are_not_found() {
        let budget = Budget::new("b1", "u1");
        assert!(budget.account("nope").unwrap_err().is(ErrorType::NotFound));
        assert!(budget.category("nope").unwrap_err().is(ErrorType::NotFound));
    }

    #[test]
    fn allocation_rule_serde_and_proposal() {
        let rule: AllocationRule = serde_json::from_value(serde_json::json!({
            "type": "percentage",
            "percentage": "10"
        }))
        .unwrap();
        let income = Amount::from_str("2000").unwrap();
        assert_eq!(rule.propose(income), Amount::from_str("200.00").unwrap());

        let fixed = AllocationRule::Fixed {
            amount: Amount::from_str("75").unwrap(),
        };
        assert_eq!(fixed.propose(income), Amount::from_str("75").unwrap());
    }
}

//! The `month` command: opens a month the way a user navigating to it would.

use crate::args::MonthArgs;
use crate::commands::{open, Out};
use crate::model::{AccountMonthBalance, CategoryMonthBalance, YearMonth};
use crate::{Config, Result};
use serde::Serialize;
use std::collections::BTreeMap;

/// The balances of one month as shown to the user.
#[derive(Debug, Clone, Serialize)]
pub struct MonthView {
    pub month: YearMonth,
    pub allocations_finalized: bool,
    pub accounts: BTreeMap<String, AccountMonthBalance>,
    pub categories: BTreeMap<String, CategoryMonthBalance>,
    /// The months that had to be recalculated before this one could be shown.
    pub recalculated: Vec<YearMonth>,
}

/// Opens a month: creates it if it is next to the budget's months, recalculates the chain if the
/// month or an earlier one is stale, and returns its balances.
///
/// # Errors
///
/// - Returns an `OutOfSequence` error naming the nearest month that can be opened if the month
///   is not next to the budget's months.
pub async fn month(config: Config, args: MonthArgs) -> Result<Out<MonthView>> {
    let ledger = open(&config).await?;
    let opened = ledger.open_month(config.budget_id(), args.month).await?;
    let recalculated = opened
        .recalculation
        .map(|outcome| outcome.recalculated)
        .unwrap_or_default();
    let month = opened.month;

    let mut message = format!("Month {}", args.month);
    for (id, balance) in &month.account_balances {
        message.push_str(&format!(
            "\n  account {id}: {} -> {}",
            balance.start_balance, balance.end_balance
        ));
    }
    for (id, balance) in &month.category_balances {
        message.push_str(&format!(
            "\n  category {id}: {} -> {}",
            balance.start_balance, balance.end_balance
        ));
    }

    let view = MonthView {
        month: args.month,
        allocations_finalized: month.are_allocations_finalized,
        accounts: month.account_balances,
        categories: month.category_balances,
        recalculated,
    };
    Ok(Out::new(message, view))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorType;
    use crate::months::OutOfSequence;
    use crate::test::{amt, ym, TestEnv};

    #[tokio::test]
    async fn test_month_creates_and_shows_balances() {
        let env = TestEnv::new().await;
        let out = month(env.config(), MonthArgs { month: ym(2024, 1) })
            .await
            .unwrap();
        let view = out.structure().unwrap();
        assert_eq!(view.accounts["checking"].end_balance, amt("1000"));
        assert!(out.message().contains("account checking"));

        let err = month(env.config(), MonthArgs { month: ym(2024, 5) })
            .await
            .unwrap_err();
        assert!(err.is(ErrorType::OutOfSequence));
        assert_eq!(
            err.downcast_ref::<OutOfSequence>().unwrap().nearest,
            ym(2024, 2)
        );
    }
}

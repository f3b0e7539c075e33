use crate::args::RecalcArgs;
use crate::commands::{open, Out};
use crate::recalc::RecalcOutcome;
use crate::{Config, Result};

/// Recalculates the month chain from `args.from`, or from the budget's earliest month, through
/// its latest month, and brings the budget's running balances up to date.
pub async fn recalc(config: Config, args: RecalcArgs) -> Result<Out<RecalcOutcome>> {
    let ledger = open(&config).await?;
    let budget_id = config.budget_id();
    let from = match args.from {
        Some(from) => from,
        None => match ledger.cache().budget(budget_id).and_then(|b| b.earliest_month()) {
            Some(earliest) => earliest,
            None => return Ok(format!("Budget '{budget_id}' has no months yet").into()),
        },
    };
    let outcome = ledger.recalculator().recalculate(budget_id, from).await?;
    let mut message = format!(
        "Recalculated {} months, saved {}",
        outcome.recalculated.len(),
        outcome.saved.len()
    );
    if !outcome.skipped.is_empty() {
        message.push_str(&format!(
            ", skipped {} malformed records",
            outcome.skipped.len()
        ));
    }
    Ok(Out::new(message, outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::{InsertExpenseArgs, MonthArgs};
    use crate::commands::{insert_expense, month};
    use crate::test::{amt, ym, TestEnv};

    #[tokio::test]
    async fn test_recalc() {
        let env = TestEnv::new().await;
        let out = recalc(env.config(), RecalcArgs { from: None }).await.unwrap();
        assert!(out.structure().is_none());

        for m in 1..=3 {
            month(env.config(), MonthArgs { month: ym(2024, m) })
                .await
                .unwrap();
        }
        insert_expense(
            env.config(),
            InsertExpenseArgs {
                month: ym(2024, 1),
                account: "checking".into(),
                category: "groceries".into(),
                amount: amt("200"),
                description: None,
            },
        )
        .await
        .unwrap();

        let out = recalc(env.config(), RecalcArgs { from: None }).await.unwrap();
        let outcome = out.structure().unwrap();
        assert_eq!(outcome.recalculated.len(), 3);
        let march = env
            .config()
            .ledger()
            .repo()
            .read_month("b1", ym(2024, 3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(march.account_balances["checking"].end_balance, amt("800"));
    }
}

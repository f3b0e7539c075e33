use crate::args::PruneArgs;
use crate::commands::{open, Out};
use crate::model::YearMonth;
use crate::{Config, Result};

/// Deletes months after `args.horizon` that have no transactions and no finalized allocations,
/// working back from the end of the chain.
pub async fn prune(config: Config, args: PruneArgs) -> Result<Out<Vec<YearMonth>>> {
    let ledger = open(&config).await?;
    let pruned = ledger
        .repo()
        .prune_placeholder_months(config.budget_id(), args.horizon)
        .await?;
    Ok(Out::new(format!("Deleted {} empty months", pruned.len()), pruned))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::MonthArgs;
    use crate::commands::month;
    use crate::test::{ym, TestEnv};

    #[tokio::test]
    async fn test_prune() {
        let env = TestEnv::new().await;
        for m in 1..=4 {
            month(env.config(), MonthArgs { month: ym(2024, m) })
                .await
                .unwrap();
        }
        let out = prune(env.config(), PruneArgs { horizon: ym(2024, 2) })
            .await
            .unwrap();
        assert_eq!(out.structure().unwrap(), &vec![ym(2024, 3), ym(2024, 4)]);
        let budget = env.config().ledger().repo().read_budget("b1").await.unwrap();
        assert_eq!(budget.latest_month(), Some(ym(2024, 2)));
    }
}

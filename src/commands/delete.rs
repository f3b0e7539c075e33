//! Delete command handlers.

use crate::args::DeleteTransactionArgs;
use crate::commands::{open, Out};
use crate::{Config, Result};

/// Deletes a transaction of any kind from a month. Later months are marked stale.
///
/// # Errors
///
/// - Returns a `NotFound` error if the month has no transaction with the given id.
pub async fn delete_transaction(
    config: Config,
    args: DeleteTransactionArgs,
) -> Result<Out<String>> {
    let ledger = open(&config).await?;
    ledger
        .gateway()
        .delete_transaction(config.budget_id(), args.month, &args.id)
        .await?;
    Ok(Out::new(
        format!("Deleted transaction {} from {}", args.id, args.month),
        args.id,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::InsertIncomeArgs;
    use crate::commands::insert_income;
    use crate::error::ErrorType;
    use crate::test::{amt, ym, TestEnv};

    #[tokio::test]
    async fn test_delete_transaction() {
        let env = TestEnv::new().await;
        let out = insert_income(
            env.config(),
            InsertIncomeArgs {
                month: ym(2024, 1),
                account: "checking".into(),
                amount: amt("100"),
                description: None,
            },
        )
        .await
        .unwrap();
        let id = out.structure().unwrap().clone();

        let args = DeleteTransactionArgs {
            month: ym(2024, 1),
            id: id.clone(),
        };
        delete_transaction(env.config(), args.clone()).await.unwrap();
        let month = env
            .config()
            .ledger()
            .repo()
            .read_month("b1", ym(2024, 1))
            .await
            .unwrap()
            .unwrap();
        assert!(month.income.is_empty());

        let err = delete_transaction(env.config(), args).await.unwrap_err();
        assert!(err.is(ErrorType::NotFound));
    }
}

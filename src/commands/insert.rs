//! Insert command handlers.

use crate::args::{InsertAccountArgs, InsertCategoryArgs, InsertExpenseArgs, InsertIncomeArgs};
use crate::commands::{open, Out};
use crate::model::{Account, AllocationRule, Category, Expense, Income};
use crate::{Config, Result};

/// Adds an account to the configured budget.
///
/// Every existing month is marked stale so that the next recalculation carries the new account
/// through the chain, starting from its opening balance.
pub async fn insert_account(config: Config, args: InsertAccountArgs) -> Result<Out<String>> {
    let ledger = open(&config).await?;
    let account = Account {
        name: args.name.unwrap_or_else(|| args.id.clone()),
        opening_balance: args.opening_balance,
        balance: args.opening_balance,
        ..Default::default()
    };
    ledger
        .gateway()
        .add_account(config.budget_id(), &args.id, account)
        .await?;
    Ok(Out::new(format!("Inserted account '{}'", args.id), args.id))
}

/// Adds a category to the configured budget, optionally with a default allocation rule.
pub async fn insert_category(config: Config, args: InsertCategoryArgs) -> Result<Out<String>> {
    let ledger = open(&config).await?;
    let allocation_rule = match (args.fixed, args.percentage) {
        (Some(amount), _) => Some(AllocationRule::Fixed { amount }),
        (None, Some(percentage)) => Some(AllocationRule::Percentage { percentage }),
        (None, None) => None,
    };
    let category = Category {
        name: args.name.unwrap_or_else(|| args.id.clone()),
        allocation_rule,
        ..Default::default()
    };
    ledger
        .gateway()
        .add_category(config.budget_id(), &args.id, category)
        .await?;
    Ok(Out::new(format!("Inserted category '{}'", args.id), args.id))
}

/// Adds income to a month, creating the month if it is next to the budget's existing months.
///
/// The generated transaction id is returned on success.
pub async fn insert_income(config: Config, args: InsertIncomeArgs) -> Result<Out<String>> {
    let ledger = open(&config).await?;
    let id = uuid::Uuid::new_v4().to_string();
    let income = Income {
        id: id.clone(),
        account_id: args.account,
        amount: args.amount,
        description: args.description.unwrap_or_default(),
        date: None,
    };
    ledger
        .gateway()
        .add_income(config.budget_id(), args.month, income)
        .await?;
    Ok(Out::new(
        format!("Inserted income with ID: {id} in {}", args.month),
        id,
    ))
}

/// Adds an expense to a month, creating the month if it is next to the budget's existing months.
///
/// The generated transaction id is returned on success.
pub async fn insert_expense(config: Config, args: InsertExpenseArgs) -> Result<Out<String>> {
    let ledger = open(&config).await?;
    let id = uuid::Uuid::new_v4().to_string();
    let expense = Expense {
        id: id.clone(),
        account_id: args.account,
        category_id: args.category,
        amount: args.amount,
        description: args.description.unwrap_or_default(),
        date: None,
    };
    ledger
        .gateway()
        .add_expense(config.budget_id(), args.month, expense)
        .await?;
    Ok(Out::new(
        format!("Inserted expense with ID: {id} in {}", args.month),
        id,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorType;
    use crate::test::{amt, ym, TestEnv};

    #[tokio::test]
    async fn test_insert_expense() {
        let env = TestEnv::new().await;
        let out = insert_expense(
            env.config(),
            InsertExpenseArgs {
                month: ym(2024, 1),
                account: "checking".into(),
                category: "groceries".into(),
                amount: amt("12.50"),
                description: Some("Market".into()),
            },
        )
        .await
        .unwrap();
        assert!(out.message().contains("Inserted expense with ID:"));
        let id = out.structure().unwrap();

        let month = env
            .config()
            .ledger()
            .repo()
            .read_month("b1", ym(2024, 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(month.expenses.len(), 1);
        assert_eq!(&month.expenses[0].id, id);
        assert_eq!(month.expenses[0].description, "Market");
    }

    #[tokio::test]
    async fn test_insert_expense_unknown_category() {
        let env = TestEnv::new().await;
        let err = insert_expense(
            env.config(),
            InsertExpenseArgs {
                month: ym(2024, 1),
                account: "checking".into(),
                category: "nope".into(),
                amount: amt("1"),
                description: None,
            },
        )
        .await
        .unwrap_err();
        assert!(err.is(ErrorType::NotFound));
    }

    #[tokio::test]
    async fn test_insert_category_with_rule() {
        let env = TestEnv::new().await;
        insert_category(
            env.config(),
            InsertCategoryArgs {
                id: "savings".into(),
                name: None,
                fixed: None,
                percentage: Some(rust_decimal::Decimal::new(10, 0)),
            },
        )
        .await
        .unwrap();
        let budget = env.config().ledger().repo().read_budget("b1").await.unwrap();
        let category = &budget.categories["savings"];
        assert_eq!(category.name, "savings");
        assert_eq!(
            category.allocation_rule,
            Some(AllocationRule::Percentage {
                percentage: rust_decimal::Decimal::new(10, 0)
            })
        );
    }

    #[tokio::test]
    async fn test_insert_duplicate_account() {
        let env = TestEnv::new().await;
        let err = insert_account(
            env.config(),
            InsertAccountArgs {
                id: "checking".into(),
                name: None,
                opening_balance: amt("5"),
            },
        )
        .await
        .unwrap_err();
        assert!(err.is(ErrorType::Validation));
    }
}

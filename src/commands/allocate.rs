//! Allocation command handlers.

use crate::args::{AllocateArgs, FinalizeArgs};
use crate::commands::{open, Out};
use crate::model::Amount;
use crate::{Config, Result};
use std::collections::BTreeMap;

/// Finalizes a month's allocations. Categories without a draft get what their allocation rule
/// proposes from the previous month's income.
///
/// Returns the finalized allocation of every category.
pub async fn finalize(config: Config, args: FinalizeArgs) -> Result<Out<BTreeMap<String, Amount>>> {
    let ledger = open(&config).await?;
    let drafts: BTreeMap<String, Amount> = args.drafts.into_iter().collect();
    let month = ledger
        .gateway()
        .finalize_allocations(config.budget_id(), args.month, drafts)
        .await?;
    Ok(Out::new(
        format!(
            "Finalized {} allocations for {}",
            month.allocations.len(),
            args.month
        ),
        month.allocations,
    ))
}

/// Changes one finalized allocation. Later months are marked stale on category balances only.
pub async fn allocate(config: Config, args: AllocateArgs) -> Result<Out<Amount>> {
    let ledger = open(&config).await?;
    let month = ledger
        .gateway()
        .edit_allocation(config.budget_id(), args.month, &args.category, args.amount)
        .await?;
    let amount = month
        .allocations
        .get(&args.category)
        .copied()
        .unwrap_or_default();
    Ok(Out::new(
        format!(
            "Allocated {amount} to '{}' in {}",
            args.category, args.month
        ),
        amount,
    ))
}

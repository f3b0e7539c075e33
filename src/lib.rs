//! A monthly budgeting ledger.
//!
//! Each month of a budget starts with the balances the previous month ended with. Editing a month
//! marks it and every later month stale; stale months are recalculated lazily, as one chain, when
//! they are opened. Edits are applied to a local cache first and rolled back if the store write
//! fails, and a sync monitor adopts changes that other devices made to the store.

pub mod args;
mod cache;
mod calc;
pub mod commands;
mod config;
mod error;
mod ledger;
pub mod model;
mod months;
mod mutation;
mod recalc;
mod staleness;
pub mod store;
mod sync;
mod utils;

#[cfg(test)]
mod test;

pub use cache::{CacheKey, CacheSnapshot, LocalCache};
pub use calc::{compute_month_balances, propose_allocations, verify_month, MonthBalances};
pub use calc::{PreviousBalances, SkippedRecord};
pub use config::Config;
pub use error::{Error, ErrorType, Result};
pub use ledger::{Ledger, OpenedMonth};
pub use months::{MonthRepository, OutOfSequence};
pub use mutation::{apply_transaction_edit, BalanceDeltas, MutationGateway, TransactionEdit};
pub use recalc::{RecalcOutcome, RecalcPhase, RecalcProgress, RecalculationAborted, Recalculator};
pub use staleness::{Scope, StaleReport, StalenessPropagator};
pub use sync::{RemoteDocument, Resolution, SyncConflict, SyncMonitor, SyncReport};

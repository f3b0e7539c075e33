//! Command handlers for the ledger CLI.
//!
//! This module contains implementations for all CLI subcommands. Each handler opens the configured
//! store, loads the budget into a fresh cache and returns an `Out`.

mod allocate;
mod delete;
mod init;
mod insert;
mod month;
mod prune;
mod recalc;

use crate::{Config, Ledger, Result};
use serde::Serialize;
use std::fmt::Debug;
use tracing::{debug, info};

pub use allocate::{allocate, finalize};
pub use delete::delete_transaction;
pub use init::init;
pub use insert::{insert_account, insert_category, insert_expense, insert_income};
pub use month::{month, MonthView};
pub use prune::prune;
pub use recalc::recalc;

/// The output type for a command. This allows the command to return a consistent message and,
/// optionally, structured data.
#[derive(Debug, Clone, Serialize)]
pub struct Out<T>
where
    T: Serialize + Clone + Debug,
{
    /// A message that can be printed to the user regarding the outcome of the command execution.
    message: String,

    /// Any structured data that needs to be output from the call.
    structure: Option<T>,
}

impl<T, S> From<S> for Out<T>
where
    T: Debug + Clone + Serialize,
    S: Into<String>,
{
    fn from(value: S) -> Self {
        Out::new_message(value)
    }
}

impl<T> Out<T>
where
    T: Serialize + Clone + Debug,
{
    /// Create a new `Out` object that has `Some(structure)`.
    pub fn new<S>(message: S, structure: T) -> Self
    where
        S: Into<String>,
    {
        Self {
            message: message.into(),
            structure: Some(structure),
        }
    }

    /// Create a new `Out` object that has `None` for `structure`.
    pub fn new_message<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            message: message.into(),
            structure: None,
        }
    }

    /// Get the `message`.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the structured data stored in `structure`.
    pub fn structure(&self) -> Option<&T> {
        self.structure.as_ref()
    }

    /// Print the message to `info!` and the structured data (if it exists) as JSON to `debug!`.
    pub fn print(&self) {
        info!("{}", self.message);
        if let Some(structure) = self.structure() {
            if let Ok(json) = serde_json::to_string_pretty(structure) {
                debug!("Command output:\n\n{json}\n\n");
            }
        }
    }
}

/// Opens a ledger over the configured store with the budget loaded into its cache.
async fn open(config: &Config) -> Result<Ledger> {
    let ledger = config.ledger();
    ledger.load_budget(config.budget_id()).await?;
    Ok(ledger)
}

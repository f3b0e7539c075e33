//! These structs provide the CLI interface for the ledger CLI.

use crate::model::{Amount, YearMonth};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::convert::Infallible;
use std::fmt::{Display, Formatter};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::error;
use tracing_subscriber::filter::LevelFilter;

/// ledger: A monthly budgeting ledger.
///
/// Money is tracked month by month. Each month starts with the balances the previous month ended
/// with, so an edit to an old month changes every month after it. Those later months are marked
/// stale and recalculated the next time they are opened.
#[derive(Debug, Parser, Clone)]
pub struct Args {
    #[clap(flatten)]
    common: Common,

    #[command(subcommand)]
    command: Command,
}

impl Args {
    pub fn new(common: Common, command: Command) -> Self {
        Self { common, command }
    }

    pub fn common(&self) -> &Common {
        &self.common
    }

    pub fn command(&self) -> &Command {
        &self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create the ledger home directory, its configuration and an empty budget.
    ///
    /// This is the first command you should run. By default the ledger home is $HOME/ledger; pass
    /// --ledger-home or set LEDGER_HOME to put it somewhere else.
    Init(InitArgs),
    /// Add an account, a category or a transaction.
    Insert(InsertArgs),
    /// Delete a transaction.
    Delete(DeleteArgs),
    /// Open a month: create it if needed, bring its balances up to date and show them.
    Month(MonthArgs),
    /// Lock in a month's allocations.
    Finalize(FinalizeArgs),
    /// Change one finalized allocation.
    Allocate(AllocateArgs),
    /// Recalculate the month chain.
    Recalc(RecalcArgs),
    /// Delete empty months from the end of the chain.
    Prune(PruneArgs),
}

/// Arguments common to all subcommands.
#[derive(Debug, Parser, Clone)]
pub struct Common {
    /// The logging verbosity. One of, from least to most verbose:
    /// off, error, warn, info, debug, trace
    ///
    /// This can be overridden by RUST_LOG.
    #[arg(long, default_value_t = LevelFilter::INFO)]
    log_level: LevelFilter,

    /// The directory where ledger data and configuration is held. Defaults to ~/ledger
    #[arg(long, env = "LEDGER_HOME", default_value_t = default_ledger_home())]
    ledger_home: DisplayPath,
}

impl Common {
    pub fn new(log_level: LevelFilter, ledger_home: PathBuf) -> Self {
        Self {
            log_level,
            ledger_home: ledger_home.into(),
        }
    }

    pub fn log_level(&self) -> LevelFilter {
        self.log_level
    }

    pub fn ledger_home(&self) -> &DisplayPath {
        &self.ledger_home
    }
}

/// Args for the `ledger init` command.
#[derive(Debug, Parser, Clone)]
pub struct InitArgs {
    /// The id of the budget to create.
    #[arg(long, default_value = "default")]
    budget_id: String,

    /// The id of the user who owns the budget.
    #[arg(long, default_value = "local")]
    owner: String,
}

impl InitArgs {
    pub fn new(budget_id: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            budget_id: budget_id.into(),
            owner: owner.into(),
        }
    }

    pub fn budget_id(&self) -> &str {
        &self.budget_id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

/// Args for the `ledger insert` command.
#[derive(Debug, Parser, Clone)]
pub struct InsertArgs {
    #[command(subcommand)]
    entity: InsertSubcommand,
}

impl InsertArgs {
    pub fn new(entity: InsertSubcommand) -> Self {
        Self { entity }
    }

    pub fn entity(&self) -> &InsertSubcommand {
        &self.entity
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum InsertSubcommand {
    /// Add an account. Every month is recalculated to include it.
    Account(InsertAccountArgs),
    /// Add a category. Every month is recalculated to include it.
    Category(InsertCategoryArgs),
    /// Add income to a month.
    Income(InsertIncomeArgs),
    /// Add an expense to a month.
    Expense(InsertExpenseArgs),
}

/// Args for `ledger insert account`.
#[derive(Debug, Parser, Clone)]
pub struct InsertAccountArgs {
    /// The id of the new account.
    #[arg(long)]
    pub id: String,

    /// A display name. Defaults to the id.
    #[arg(long)]
    pub name: Option<String>,

    /// The balance the account has at the start of the budget's first month.
    #[arg(long, default_value = "0")]
    pub opening_balance: Amount,
}

/// Args for `ledger insert category`.
#[derive(Debug, Parser, Clone)]
pub struct InsertCategoryArgs {
    /// The id of the new category.
    #[arg(long)]
    pub id: String,

    /// A display name. Defaults to the id.
    #[arg(long)]
    pub name: Option<String>,

    /// Propose this amount every month when allocations are finalized.
    #[arg(long, conflicts_with = "percentage")]
    pub fixed: Option<Amount>,

    /// Propose this percentage of the previous month's income when allocations are finalized.
    #[arg(long)]
    pub percentage: Option<Decimal>,
}

/// Args for `ledger insert income`.
#[derive(Debug, Parser, Clone)]
pub struct InsertIncomeArgs {
    /// The month, e.g. 2024-03.
    #[arg(long)]
    pub month: YearMonth,

    /// The account receiving the money.
    #[arg(long)]
    pub account: String,

    #[arg(long, allow_hyphen_values = true)]
    pub amount: Amount,

    #[arg(long)]
    pub description: Option<String>,
}

/// Args for `ledger insert expense`.
#[derive(Debug, Parser, Clone)]
pub struct InsertExpenseArgs {
    /// The month, e.g. 2024-03.
    #[arg(long)]
    pub month: YearMonth,

    /// The account the money is spent from.
    #[arg(long)]
    pub account: String,

    /// The category the expense is spent against.
    #[arg(long)]
    pub category: String,

    #[arg(long, allow_hyphen_values = true)]
    pub amount: Amount,

    #[arg(long)]
    pub description: Option<String>,
}

/// Args for the `ledger delete` command.
#[derive(Debug, Parser, Clone)]
pub struct DeleteArgs {
    #[command(subcommand)]
    entity: DeleteSubcommand,
}

impl DeleteArgs {
    pub fn new(entity: DeleteSubcommand) -> Self {
        Self { entity }
    }

    pub fn entity(&self) -> &DeleteSubcommand {
        &self.entity
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum DeleteSubcommand {
    /// Delete a transaction of any kind.
    Transaction(DeleteTransactionArgs),
}

/// Args for `ledger delete transaction`.
#[derive(Debug, Parser, Clone)]
pub struct DeleteTransactionArgs {
    /// The month holding the transaction, e.g. 2024-03.
    #[arg(long)]
    pub month: YearMonth,

    /// The id of the transaction.
    #[arg(long)]
    pub id: String,
}

/// Args for the `ledger month` command.
#[derive(Debug, Parser, Clone)]
pub struct MonthArgs {
    /// The month to open, e.g. 2024-03.
    pub month: YearMonth,
}

/// Args for the `ledger finalize` command.
#[derive(Debug, Parser, Clone)]
pub struct FinalizeArgs {
    /// The month whose allocations are finalized, e.g. 2024-03.
    #[arg(long)]
    pub month: YearMonth,

    /// An amount that overrides a category's allocation rule, as `category=amount`. May be given
    /// more than once.
    #[arg(long = "draft", value_parser = parse_draft)]
    pub drafts: Vec<(String, Amount)>,
}

/// Args for the `ledger allocate` command.
#[derive(Debug, Parser, Clone)]
pub struct AllocateArgs {
    /// The month, e.g. 2024-03. Its allocations must already be finalized.
    #[arg(long)]
    pub month: YearMonth,

    #[arg(long)]
    pub category: String,

    #[arg(long, allow_hyphen_values = true)]
    pub amount: Amount,
}

/// Args for the `ledger recalc` command.
#[derive(Debug, Parser, Clone)]
pub struct RecalcArgs {
    /// The first month to recalculate. Defaults to the budget's earliest month.
    #[arg(long)]
    pub from: Option<YearMonth>,
}

/// Args for the `ledger prune` command.
#[derive(Debug, Parser, Clone)]
pub struct PruneArgs {
    /// Empty months after this month are deleted, e.g. 2024-06.
    #[arg(long)]
    pub horizon: YearMonth,
}

fn parse_draft(s: &str) -> Result<(String, Amount), String> {
    let (category, amount) = s
        .split_once('=')
        .ok_or_else(|| format!("Expected category=amount, got '{s}'"))?;
    let amount = Amount::from_str(amount).map_err(|e| format!("Invalid amount in '{s}': {e}"))?;
    Ok((category.trim().to_string(), amount))
}

fn default_ledger_home() -> DisplayPath {
    DisplayPath(match dirs::home_dir() {
        Some(home) => home.join("ledger"),
        None => {
            error!(
                "There was an error when trying to get your home directory. You can get around \
                this by providing --ledger-home or LEDGER_HOME instead of relying on the default \
                ledger home directory. If you continue using the program right now, you may have \
                problems!",
            );
            PathBuf::from("ledger")
        }
    })
}

#[derive(Debug, Default, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DisplayPath(PathBuf);

impl From<PathBuf> for DisplayPath {
    fn from(value: PathBuf) -> Self {
        DisplayPath(value)
    }
}

impl Deref for DisplayPath {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<Path> for DisplayPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl Display for DisplayPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_string_lossy())
    }
}

impl FromStr for DisplayPath {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(PathBuf::from(s)))
    }
}

impl DisplayPath {
    pub fn new(path: PathBuf) -> Self {
        Self(path)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

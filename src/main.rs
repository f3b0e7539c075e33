use clap::Parser;
use monthly_ledger::args::{Args, Command, DeleteSubcommand, InsertSubcommand};
use monthly_ledger::{commands, Config, Result};
use std::process::ExitCode;
use tracing::{debug, error, trace};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let log_level = args.common().log_level();
    init_logger(log_level);
    debug!("Log level set to {}", log_level.to_string().to_lowercase());

    match main_inner(args).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Exiting with error: {e}");
            ExitCode::FAILURE
        }
    }
}

pub async fn main_inner(args: Args) -> Result<()> {
    trace!("{args:?}");
    let home = args.common().ledger_home().path();

    let _: () = match args.command() {
        Command::Init(init_args) => {
            commands::init(home, init_args.budget_id(), init_args.owner())
                .await?
                .print()
        }

        Command::Insert(insert_args) => {
            let config = Config::load(home).await?;
            match insert_args.entity() {
                InsertSubcommand::Account(args) => commands::insert_account(config, args.clone())
                    .await?
                    .print(),
                InsertSubcommand::Category(args) => commands::insert_category(config, args.clone())
                    .await?
                    .print(),
                InsertSubcommand::Income(args) => commands::insert_income(config, args.clone())
                    .await?
                    .print(),
                InsertSubcommand::Expense(args) => commands::insert_expense(config, args.clone())
                    .await?
                    .print(),
            }
        }

        Command::Delete(delete_args) => {
            let config = Config::load(home).await?;
            match delete_args.entity() {
                DeleteSubcommand::Transaction(args) => {
                    commands::delete_transaction(config, args.clone())
                        .await?
                        .print()
                }
            }
        }

        Command::Month(month_args) => {
            let config = Config::load(home).await?;
            commands::month(config, month_args.clone()).await?.print()
        }

        Command::Finalize(finalize_args) => {
            let config = Config::load(home).await?;
            commands::finalize(config, finalize_args.clone())
                .await?
                .print()
        }

        Command::Allocate(allocate_args) => {
            let config = Config::load(home).await?;
            commands::allocate(config, allocate_args.clone())
                .await?
                .print()
        }

        Command::Recalc(recalc_args) => {
            let config = Config::load(home).await?;
            commands::recalc(config, recalc_args.clone()).await?.print()
        }

        Command::Prune(prune_args) => {
            let config = Config::load(home).await?;
            commands::prune(config, prune_args.clone()).await?.print()
        }
    };
    Ok(())
}

/// Initializes the tracing subscriber.
pub fn init_logger(level: LevelFilter) {
    let filter = match std::env::var("RUST_LOG").ok() {
        Some(_) => {
            // RUST_LOG exists; use it.
            EnvFilter::from_default_env()
        }
        None => {
            // RUST_LOG does not exist; use default log level for the library and the binary only.
            EnvFilter::new(format!(
                "monthly_ledger={},{}={}",
                level,
                env!("CARGO_BIN_NAME"),
                level
            ))
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

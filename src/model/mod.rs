//! Types that represent the core data model, such as `Budget` and `Month`.
mod amount;
mod budget;
mod month;
mod recalc_status;
mod year_month;

pub use amount::{Amount, AmountError, CURRENCY_DP};
pub use budget::{Account, AllocationRule, Budget, Category, Group, MonthMapEntry};
pub use month::{
    AccountMonthBalance, Adjustment, CategoryMonthBalance, Expense, Income, Month, Transfer,
    TransactionKind,
};
pub use recalc_status::{RecalcStatus, StaleChannel};
pub use year_month::YearMonth;

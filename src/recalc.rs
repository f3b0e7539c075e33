//! Recalculates a chain of stale months.
//!
//! A run starts at a month (normally the earliest stale one) and walks forward to the budget's
//! latest month. It moves through these phases, published on a `watch` channel per budget:
//!
//! `ReadingBudget -> FetchingMonths -> Recalculating -> Saving -> Complete`
//!
//! Every month of the chain is computed before anything is written. Months are then saved in
//! ascending order, each one only if the stored document has not changed since it was fetched. A
//! month's staleness is cleared only by the write that persists its new balances, so a run that
//! stops partway leaves every month it did not save stale, and the error is
//! `ErrorType::RecalculationAborted`.
//!
//! Only one run per budget is in flight at a time. A trigger that arrives during a run awaits that
//! run's outcome instead of starting another. Runs execute on their own task so dropping a trigger
//! never cancels a run halfway through its writes.

use crate::cache::LocalCache;
use crate::calc::{compute_month_balances, verify_month, PreviousBalances, SkippedRecord};
use crate::error::{Error, ErrorType, IntoResult};
use crate::model::{Amount, Budget, Month, RecalcStatus, YearMonth};
use crate::months::MonthRepository;
use crate::store::is_precondition_failed;
use crate::Result;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How often a run re-checks the budget when it changes while the run is clearing its flags.
const MAX_FINISH_ATTEMPTS: usize = 3;

/// The phase of a recalculation run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecalcPhase {
    /// No run has happened yet.
    #[default]
    Idle,
    ReadingBudget,
    FetchingMonths,
    Recalculating,
    Saving,
    Complete,
    /// The run was aborted. Months it did not save are still stale.
    Failed,
}

serde_plain::derive_display_from_serialize!(RecalcPhase);
serde_plain::derive_fromstr_from_deserialize!(RecalcPhase);

/// Progress of the latest run for a budget.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RecalcProgress {
    pub phase: RecalcPhase,
    /// Months in the chain being recalculated.
    pub total: usize,
    /// Months processed in the current phase.
    pub processed: usize,
    pub current: Option<YearMonth>,
}

/// The result of a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecalcOutcome {
    pub budget_id: String,
    /// The first month of the chain.
    pub from: Option<YearMonth>,
    /// Every month that was computed, ascending.
    pub recalculated: Vec<YearMonth>,
    /// The months whose documents were written, ascending. Months whose balances were already
    /// right are not written.
    pub saved: Vec<YearMonth>,
    /// Malformed records that were treated as zero.
    pub skipped: Vec<SkippedRecord>,
    /// True if the budget's cached account and category balances were rewritten.
    pub resynced_balances: bool,
}

/// The detail of an `ErrorType::RecalculationAborted` error.
#[derive(Debug, Clone)]
pub struct RecalculationAborted {
    pub budget_id: String,
    /// The month being processed when the run stopped, if it got that far.
    pub failed_at: Option<YearMonth>,
    /// Months that were saved before the run stopped. They are fresh.
    pub saved: Vec<YearMonth>,
    pub cause: Error,
}

impl Display for RecalculationAborted {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.failed_at {
            Some(ym) => write!(
                f,
                "Recalculation of budget '{}' aborted at {ym}: {}",
                self.budget_id, self.cause
            ),
            None => write!(
                f,
                "Recalculation of budget '{}' aborted: {}",
                self.budget_id, self.cause
            ),
        }
    }
}

impl std::error::Error for RecalculationAborted {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

type SharedRun = Shared<BoxFuture<'static, Result<RecalcOutcome>>>;

struct InFlight {
    generation: u64,
    from: YearMonth,
    run: SharedRun,
}

/// Runs chain recalculations, at most one per budget at a time.
#[derive(Clone)]
pub struct Recalculator {
    repo: MonthRepository,
    in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
    progress: Arc<Mutex<HashMap<String, Arc<watch::Sender<RecalcProgress>>>>>,
    generation: Arc<AtomicU64>,
}

impl Recalculator {
    pub fn new(repo: MonthRepository) -> Self {
        Self {
            repo,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            progress: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribes to the progress of runs for `budget_id`.
    pub fn subscribe(&self, budget_id: &str) -> watch::Receiver<RecalcProgress> {
        self.progress_sender(budget_id).subscribe()
    }

    /// The latest published progress for `budget_id`.
    pub fn progress(&self, budget_id: &str) -> RecalcProgress {
        self.progress_sender(budget_id).borrow().clone()
    }

    /// True if a run for `budget_id` is in flight.
    pub fn is_running(&self, budget_id: &str) -> bool {
        lock(&self.in_flight).contains_key(budget_id)
    }

    /// Recalculates every month from `from` (or from the earliest stale month, if that is earlier)
    /// to the budget's latest month.
    pub async fn recalculate(&self, budget_id: &str, from: YearMonth) -> Result<RecalcOutcome> {
        loop {
            let (run, joined_from) = self.join_or_start(budget_id, from);
            let outcome = run.await;
            match joined_from {
                // The run we joined started later than we need, so start another once it is done.
                Some(in_flight_from) if in_flight_from > from => {
                    debug!(
                        "The joined run for '{budget_id}' started at {in_flight_from}, \
                         recalculating again from {from}"
                    );
                }
                _ => return outcome,
            }
        }
    }

    /// Recalculates the chain if `ym`, or any month before it, is stale. Returns `Ok(None)` if
    /// there was nothing to do.
    pub async fn recalculate_if_stale(
        &self,
        budget_id: &str,
        ym: YearMonth,
    ) -> Result<Option<RecalcOutcome>> {
        let budget = match self.repo.cache().budget(budget_id) {
            Some(budget) => budget,
            None => self.repo.read_budget(budget_id).await?,
        };
        let mut trigger = budget.earliest_stale().filter(|stale| *stale <= ym);
        if trigger.is_none() {
            let month = match self.repo.cache().month(budget_id, ym) {
                Some(month) => Some(month),
                None => self.repo.read_month(budget_id, ym).await?,
            };
            if month.is_some_and(|m| m.status.needs_recalculation()) {
                trigger = Some(ym);
            }
        }
        match trigger {
            Some(from) => self.recalculate(budget_id, from).await.map(Some),
            None => Ok(None),
        }
    }

    fn join_or_start(&self, budget_id: &str, from: YearMonth) -> (SharedRun, Option<YearMonth>) {
        let mut in_flight = lock(&self.in_flight);
        if let Some(existing) = in_flight.get(budget_id) {
            debug!("Joining the in-flight recalculation of '{budget_id}'");
            return (existing.run.clone(), Some(existing.from));
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let this = self.clone();
        let id = budget_id.to_string();
        let handle = tokio::spawn(async move {
            let outcome = this.run(&id, from).await;
            this.finish(&id, generation);
            outcome
        });
        let run = async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(Error::msg(
                    ErrorType::Internal,
                    format!("The recalculation task failed: {e}"),
                )),
            }
        }
        .boxed()
        .shared();

        in_flight.insert(
            budget_id.to_string(),
            InFlight {
                generation,
                from,
                run: run.clone(),
            },
        );
        (run, None)
    }

    fn finish(&self, budget_id: &str, generation: u64) {
        let mut in_flight = lock(&self.in_flight);
        if in_flight
            .get(budget_id)
            .is_some_and(|run| run.generation == generation)
        {
            in_flight.remove(budget_id);
        }
    }

    fn progress_sender(&self, budget_id: &str) -> Arc<watch::Sender<RecalcProgress>> {
        lock(&self.progress)
            .entry(budget_id.to_string())
            .or_insert_with(|| Arc::new(watch::Sender::new(RecalcProgress::default())))
            .clone()
    }

    async fn run(&self, budget_id: &str, from: YearMonth) -> Result<RecalcOutcome> {
        let mut run = Run {
            budget_id: budget_id.to_string(),
            progress: self.progress_sender(budget_id),
            total: 0,
            current: None,
            saved: Vec::new(),
        };
        match self.run_chain(&mut run, from).await {
            Ok(outcome) => {
                run.publish(RecalcPhase::Complete, outcome.recalculated.len());
                info!(
                    "Recalculated {} months of '{budget_id}', saved {}",
                    outcome.recalculated.len(),
                    outcome.saved.len()
                );
                Ok(outcome)
            }
            Err(cause) => {
                run.publish(RecalcPhase::Failed, run.saved.len());
                warn!("Recalculation of '{budget_id}' failed: {cause}");
                Err(Error::new(
                    ErrorType::RecalculationAborted,
                    anyhow::Error::new(RecalculationAborted {
                        budget_id: budget_id.to_string(),
                        failed_at: run.current,
                        saved: run.saved,
                        cause,
                    }),
                ))
            }
        }
    }

    async fn run_chain(&self, run: &mut Run, from: YearMonth) -> Result<RecalcOutcome> {
        let budget_id = run.budget_id.clone();

        run.publish(RecalcPhase::ReadingBudget, 0);
        let budget = self.repo.read_budget(&budget_id).await?;
        let start = match budget.earliest_stale() {
            Some(stale) if stale < from => stale,
            _ => from,
        };
        let mut chain = budget.months_from(start);
        let Some(mut first) = chain.first().copied() else {
            debug!("Budget '{budget_id}' has no months from {start}, nothing to recalculate");
            return Ok(RecalcOutcome {
                budget_id,
                from: None,
                recalculated: Vec::new(),
                saved: Vec::new(),
                skipped: Vec::new(),
                resynced_balances: false,
            });
        };

        // The chain starts after the last month whose stored balances are fresh, even when the
        // month_map does not flag the months before `first`.
        let mut predecessor = None;
        while !budget.is_first_month(first) {
            let prev = self
                .repo
                .read_month(&budget_id, first.prev())
                .await?
                .ok_or_else(|| missing_month(&budget_id, first.prev()))?;
            if !prev.status.needs_recalculation() {
                predecessor = Some(prev);
                break;
            }
            debug!(
                "Month {} of '{budget_id}' is stale, extending the chain back from {first}",
                prev.year_month()
            );
            first = prev.year_month();
        }
        if chain.first() != Some(&first) {
            chain = budget.months_from(first);
        }
        run.total = chain.len();

        run.publish(RecalcPhase::FetchingMonths, 0);
        let mut fetched: BTreeMap<YearMonth, Month> = self
            .repo
            .fetch_months_from(&budget_id, first)
            .await?
            .into_iter()
            .map(|m| (m.year_month(), m))
            .collect();
        let mut previous = predecessor
            .as_ref()
            .map(PreviousBalances::from_month)
            .transpose()?;

        // Compute everything before writing anything.
        let mut staged: Vec<(Month, Month)> = Vec::with_capacity(chain.len());
        let mut skipped = Vec::new();
        for (i, ym) in chain.iter().enumerate() {
            run.current = Some(*ym);
            run.publish(RecalcPhase::Recalculating, i);
            let original = fetched
                .remove(ym)
                .ok_or_else(|| missing_month(&budget_id, *ym))?;
            let mut month = original.clone();
            let balances = compute_month_balances(&month, previous.as_ref(), &budget)?;
            month.account_balances = balances.accounts;
            month.category_balances = balances.categories;
            if let Some(previous) = &previous {
                month.previous_month_income = previous.total_income;
            }
            month.status = RecalcStatus::Fresh;
            verify_month(&month)?;
            skipped.extend(balances.skipped);
            previous = Some(PreviousBalances::from_month(&month)?);
            staged.push((original, month));
        }

        run.publish(RecalcPhase::Saving, 0);
        let mut persisted = Vec::new();
        for (i, (original, month)) in staged.iter().enumerate() {
            let ym = month.year_month();
            run.current = Some(ym);
            if original != month {
                if let Err(e) = self
                    .repo
                    .save_month_expecting(month, original.updated_at)
                    .await
                {
                    let error_type = if is_precondition_failed(&e) {
                        ErrorType::RecalculationAborted
                    } else {
                        ErrorType::StoreWrite
                    };
                    // Months already saved are fresh; record that before giving up.
                    if let Err(map_err) = self.finish_budget(&budget_id, &persisted, None).await {
                        warn!("Unable to clear the month_map of '{budget_id}': {map_err}");
                    }
                    return Err(Error::new(error_type, e));
                }
                run.saved.push(ym);
            }
            persisted.push(ym);
            run.publish(RecalcPhase::Saving, i + 1);
        }
        run.current = None;

        let latest = staged.last().map(|(_, month)| month);
        let resynced_balances = self.finish_budget(&budget_id, &persisted, latest).await?;

        Ok(RecalcOutcome {
            budget_id,
            from: Some(first),
            recalculated: chain,
            saved: run.saved.clone(),
            skipped,
            resynced_balances,
        })
    }

    /// Clears the `month_map` flags of the months in `persisted` and, if `latest` is still the
    /// budget's latest month and still fresh, rewrites the cached balance of every account and
    /// category from its end balance in `latest`. Returns true if the entity balances were
    /// rewritten.
    ///
    /// A flag is only cleared if the month's stored document is fresh when the budget is read, so a
    /// month that another device marked stale after it was saved keeps its flag. The budget
    /// write is guarded by the `updated_at` it was read with and re-checked if the budget changed.
    async fn finish_budget(
        &self,
        budget_id: &str,
        persisted: &[YearMonth],
        latest: Option<&Month>,
    ) -> Result<bool> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let budget = self.repo.read_budget(budget_id).await?;
            let fresh = self.fresh_in_store(budget_id, persisted).await?;
            let cleared: Vec<YearMonth> = fresh
                .iter()
                .copied()
                .filter(|ym| {
                    budget
                        .month_map
                        .get(&ym.key())
                        .is_some_and(|e| e.needs_recalculation)
                })
                .collect();
            let latest = latest.filter(|m| {
                budget.latest_month() == Some(m.year_month()) && fresh.contains(&m.year_month())
            });
            let patch = BudgetPatch::new(&budget, &cleared, latest);
            let Some(data) = patch.data().pub_result(ErrorType::Internal)? else {
                return Ok(false);
            };

            match self
                .repo
                .write_budget_fields_expecting(budget_id, data, budget.updated_at)
                .await
            {
                Ok(updated_at) => {
                    patch.apply_to_cache(self.repo.cache(), budget_id, updated_at);
                    return Ok(patch.resyncs());
                }
                Err(e) if is_precondition_failed(&e) && attempt < MAX_FINISH_ATTEMPTS => {
                    debug!("Budget '{budget_id}' changed while finishing a run, re-checking: {e}");
                }
                Err(e) => return Err(Error::new(ErrorType::StoreWrite, e)),
            }
        }
    }

    /// The months of `months` whose stored documents are currently fresh.
    async fn fresh_in_store(
        &self,
        budget_id: &str,
        months: &[YearMonth],
    ) -> Result<Vec<YearMonth>> {
        let Some(first) = months.iter().min().copied() else {
            return Ok(Vec::new());
        };
        let stored = self.repo.fetch_months_from(budget_id, first).await?;
        Ok(stored
            .iter()
            .filter(|m| !m.status.needs_recalculation() && months.contains(&m.year_month()))
            .map(Month::year_month)
            .collect())
    }
}

/// The changes a finished run makes to the budget document.
struct BudgetPatch {
    cleared: Vec<YearMonth>,
    accounts: BTreeMap<String, Amount>,
    categories: BTreeMap<String, Amount>,
}

impl BudgetPatch {
    fn new(budget: &Budget, cleared: &[YearMonth], latest: Option<&Month>) -> Self {
        let mut accounts = BTreeMap::new();
        let mut categories = BTreeMap::new();
        if let Some(latest) = latest {
            for (id, account) in &budget.accounts {
                let end = latest.account_end_balance(id).unwrap_or_default();
                if account.balance != end {
                    accounts.insert(id.clone(), end);
                }
            }
            for (id, category) in &budget.categories {
                let end = latest.category_end_balance(id).unwrap_or_default();
                if category.balance != end {
                    categories.insert(id.clone(), end);
                }
            }
        }
        Self {
            cleared: cleared.to_vec(),
            accounts,
            categories,
        }
    }

    fn resyncs(&self) -> bool {
        !self.accounts.is_empty() || !self.categories.is_empty()
    }

    /// The merge write for the budget document, or `None` if nothing changes.
    fn data(&self) -> anyhow::Result<Option<Value>> {
        let mut data = Map::new();
        if !self.cleared.is_empty() {
            let map: Map<String, Value> = self
                .cleared
                .iter()
                .map(|ym| (ym.key(), json!({ "needs_recalculation": false })))
                .collect();
            data.insert("month_map".to_string(), Value::Object(map));
        }
        if !self.accounts.is_empty() {
            data.insert("accounts".to_string(), balance_patch(&self.accounts)?);
        }
        if !self.categories.is_empty() {
            data.insert("categories".to_string(), balance_patch(&self.categories)?);
        }
        Ok((!data.is_empty()).then_some(Value::Object(data)))
    }

    fn apply_to_cache(&self, cache: &LocalCache, budget_id: &str, updated_at: DateTime<Utc>) {
        cache.update_budget(budget_id, |cached| {
            for ym in &self.cleared {
                cached.set_needs_recalculation(*ym, false);
            }
            for (id, balance) in &self.accounts {
                if let Some(account) = cached.accounts.get_mut(id) {
                    account.balance = *balance;
                }
            }
            for (id, balance) in &self.categories {
                if let Some(category) = cached.categories.get_mut(id) {
                    category.balance = *balance;
                }
            }
            cached.updated_at = Some(updated_at);
        });
    }
}

/// The state of one run, for progress reporting and abort details.
struct Run {
    budget_id: String,
    progress: Arc<watch::Sender<RecalcProgress>>,
    total: usize,
    current: Option<YearMonth>,
    saved: Vec<YearMonth>,
}

impl Run {
    fn publish(&self, phase: RecalcPhase, processed: usize) {
        debug!(
            "Recalculation of '{}': {phase} ({processed}/{})",
            self.budget_id, self.total
        );
        self.progress.send_replace(RecalcProgress {
            phase,
            total: self.total,
            processed,
            current: self.current,
        });
    }
}

/// `{ id: { "balance": amount } }`, for a merge write into `accounts` or `categories`.
fn balance_patch(balances: &BTreeMap<String, Amount>) -> anyhow::Result<Value> {
    let mut patch = Map::new();
    for (id, balance) in balances {
        patch.insert(id.clone(), json!({ "balance": serde_json::to_value(balance)? }));
    }
    Ok(Value::Object(patch))
}

fn missing_month(budget_id: &str, ym: YearMonth) -> Error {
    Error::msg(
        ErrorType::NotFound,
        format!("Month {ym} is in the month_map of '{budget_id}' but has no document"),
    )
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

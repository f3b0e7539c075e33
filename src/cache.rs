//! The local cache of budget and month documents.
//!
//! `LocalCache` is a cheap, cloneable handle. It is read synchronously and updated either
//! optimistically (by the mutation gateway, before the store write) or authoritatively (after a
//! store read or write). Entries are immutable `Arc`s that are replaced whole on every update, so a
//! snapshot taken before an optimistic update can be put back exactly, or only for the entries the
//! update changed.
//!
//! Each entry also counts pending changes: local edits whose store write has not completed. The
//! sync monitor uses the count to decide between adopting a newer remote document and reporting a
//! conflict.

use crate::model::{Budget, Month, YearMonth};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Identifies one cached document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheKey {
    Budget { budget_id: String },
    Month { budget_id: String, year_month: YearMonth },
}

impl CacheKey {
    pub fn budget(budget_id: impl Into<String>) -> Self {
        CacheKey::Budget {
            budget_id: budget_id.into(),
        }
    }

    pub fn month(budget_id: impl Into<String>, year_month: YearMonth) -> Self {
        CacheKey::Month {
            budget_id: budget_id.into(),
            year_month,
        }
    }

    pub fn budget_id(&self) -> &str {
        match self {
            CacheKey::Budget { budget_id } | CacheKey::Month { budget_id, .. } => budget_id,
        }
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheKey::Budget { budget_id } => write!(f, "budgets/{budget_id}"),
            CacheKey::Month {
                budget_id,
                year_month,
            } => write!(f, "months/{}", Month::document_id(budget_id, *year_month)),
        }
    }
}

/// A cached document and the number of local changes to it that are still being written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<T> {
    pub value: T,
    pub pending: u32,
}

impl<T> Entry<T> {
    fn new(value: T) -> Self {
        Self { value, pending: 0 }
    }
}

/// Every cached entry of one budget at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSnapshot {
    budget_id: String,
    budget: Option<Arc<Entry<Budget>>>,
    months: BTreeMap<YearMonth, Arc<Entry<Month>>>,
    loaded: bool,
}

impl CacheSnapshot {
    pub fn budget_id(&self) -> &str {
        &self.budget_id
    }
}

#[derive(Debug, Default)]
struct CacheState {
    budgets: HashMap<String, Arc<Entry<Budget>>>,
    months: HashMap<String, BTreeMap<YearMonth, Arc<Entry<Month>>>>,
    loaded: HashSet<String>,
}

/// The local cache. Clones share the same underlying entries.
#[derive(Debug, Clone, Default)]
pub struct LocalCache {
    state: Arc<RwLock<CacheState>>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        // A panic while holding the lock cannot leave an entry half-written because entries are
        // replaced whole.
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn budget(&self, budget_id: &str) -> Option<Budget> {
        self.read()
            .budgets
            .get(budget_id)
            .map(|entry| entry.value.clone())
    }

    pub fn month(&self, budget_id: &str, ym: YearMonth) -> Option<Month> {
        self.read()
            .months
            .get(budget_id)
            .and_then(|months| months.get(&ym))
            .map(|entry| entry.value.clone())
    }

    /// All cached months of a budget in ascending order.
    pub fn months(&self, budget_id: &str) -> Vec<Month> {
        self.read()
            .months
            .get(budget_id)
            .map(|months| months.values().map(|e| e.value.clone()).collect())
            .unwrap_or_default()
    }

    /// Every cached key of a budget, the budget itself first.
    pub fn keys(&self, budget_id: &str) -> Vec<CacheKey> {
        let state = self.read();
        let mut keys = Vec::new();
        if state.budgets.contains_key(budget_id) {
            keys.push(CacheKey::budget(budget_id));
        }
        if let Some(months) = state.months.get(budget_id) {
            keys.extend(months.keys().map(|ym| CacheKey::month(budget_id, *ym)));
        }
        keys
    }

    /// Authoritatively sets a budget, keeping its pending count.
    pub fn put_budget(&self, budget: Budget) {
        let mut state = self.write();
        let pending = state.budgets.get(&budget.id).map_or(0, |e| e.pending);
        state
            .budgets
            .insert(budget.id.clone(), Arc::new(Entry { value: budget, pending }));
    }

    /// Authoritatively sets a month, keeping its pending count.
    pub fn put_month(&self, month: Month) {
        let mut state = self.write();
        let months = state.months.entry(month.budget_id.clone()).or_default();
        let ym = month.year_month();
        let pending = months.get(&ym).map_or(0, |e| e.pending);
        months.insert(ym, Arc::new(Entry { value: month, pending }));
    }

    pub fn remove_month(&self, budget_id: &str, ym: YearMonth) {
        if let Some(months) = self.write().months.get_mut(budget_id) {
            months.remove(&ym);
        }
    }

    /// Replaces the cached budget with `f` applied to a copy of it. Returns false if the budget is
    /// not cached.
    pub fn update_budget<F>(&self, budget_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Budget),
    {
        let mut state = self.write();
        let Some(entry) = state.budgets.get(budget_id) else {
            return false;
        };
        let mut next = Entry::clone(entry);
        f(&mut next.value);
        state.budgets.insert(budget_id.to_string(), Arc::new(next));
        true
    }

    /// Replaces the cached month with `f` applied to a copy of it. Returns false if the month is
    /// not cached.
    pub fn update_month<F>(&self, budget_id: &str, ym: YearMonth, f: F) -> bool
    where
        F: FnOnce(&mut Month),
    {
        let mut state = self.write();
        let Some(months) = state.months.get_mut(budget_id) else {
            return false;
        };
        let Some(entry) = months.get(&ym) else {
            return false;
        };
        let mut next = Entry::clone(entry);
        f(&mut next.value);
        months.insert(ym, Arc::new(next));
        true
    }

    /// Applies `f` to every cached month of the budget for which `select` is true, replacing only
    /// the entries that `f` reports as changed. Returns how many entries were replaced.
    pub fn update_months<S, F>(&self, budget_id: &str, select: S, mut f: F) -> usize
    where
        S: Fn(&Month) -> bool,
        F: FnMut(&mut Month) -> bool,
    {
        let mut state = self.write();
        let Some(months) = state.months.get_mut(budget_id) else {
            return 0;
        };
        let mut changed = 0;
        for entry in months.values_mut() {
            if !select(&entry.value) {
                continue;
            }
            let mut next = Entry::clone(entry);
            if f(&mut next.value) {
                *entry = Arc::new(next);
                changed += 1;
            }
        }
        changed
    }

    /// Records that a local change to `key` is being written to the store.
    pub fn begin_pending(&self, key: &CacheKey) {
        self.adjust_pending(key, |p| p.saturating_add(1));
    }

    /// Records that a write of a local change to `key` has finished, successfully or not.
    pub fn end_pending(&self, key: &CacheKey) {
        self.adjust_pending(key, |p| p.saturating_sub(1));
    }

    /// Clears every pending marker of `key`.
    pub fn clear_pending(&self, key: &CacheKey) {
        self.adjust_pending(key, |_| 0);
    }

    /// The number of local changes to `key` still being written. Zero if it is not cached.
    pub fn pending(&self, key: &CacheKey) -> u32 {
        let state = self.read();
        match key {
            CacheKey::Budget { budget_id } => state.budgets.get(budget_id).map_or(0, |e| e.pending),
            CacheKey::Month {
                budget_id,
                year_month,
            } => state
                .months
                .get(budget_id)
                .and_then(|m| m.get(year_month))
                .map_or(0, |e| e.pending),
        }
    }

    fn adjust_pending<F>(&self, key: &CacheKey, f: F)
    where
        F: FnOnce(u32) -> u32,
    {
        let mut state = self.write();
        match key {
            CacheKey::Budget { budget_id } => {
                if let Some(entry) = state.budgets.get_mut(budget_id) {
                    let mut next = Entry::clone(entry);
                    next.pending = f(next.pending);
                    *entry = Arc::new(next);
                }
            }
            CacheKey::Month {
                budget_id,
                year_month,
            } => {
                if let Some(entry) = state
                    .months
                    .get_mut(budget_id)
                    .and_then(|m| m.get_mut(year_month))
                {
                    let mut next = Entry::clone(entry);
                    next.pending = f(next.pending);
                    *entry = Arc::new(next);
                }
            }
        }
    }

    /// Marks the initial load of a budget as complete.
    pub fn mark_loaded(&self, budget_id: &str) {
        self.write().loaded.insert(budget_id.to_string());
    }

    pub fn is_loaded(&self, budget_id: &str) -> bool {
        self.read().loaded.contains(budget_id)
    }

    /// Captures every entry of a budget.
    pub fn snapshot(&self, budget_id: &str) -> CacheSnapshot {
        let state = self.read();
        CacheSnapshot {
            budget_id: budget_id.to_string(),
            budget: state.budgets.get(budget_id).cloned(),
            months: state.months.get(budget_id).cloned().unwrap_or_default(),
            loaded: state.loaded.contains(budget_id),
        }
    }

    /// Undoes an optimistic update of a budget's entries. `before` is the snapshot taken before the
    /// update and `applied` the one taken right after it. Only the entries the update changed get
    /// their `before` value back, keeping their pending counts; every other entry keeps whatever
    /// it holds now. Returns the keys of restored entries that were replaced again after `applied`
    /// was taken, whose stored documents are newer than the restored values.
    pub fn rollback(&self, before: CacheSnapshot, applied: &CacheSnapshot) -> Vec<CacheKey> {
        let CacheSnapshot {
            budget_id,
            budget,
            mut months,
            ..
        } = before;
        let mut replaced = Vec::new();
        let mut state = self.write();

        if !same_value(budget.as_ref(), applied.budget.as_ref()) {
            let current = state.budgets.get(&budget_id).cloned();
            if !same_value(current.as_ref(), applied.budget.as_ref()) {
                replaced.push(CacheKey::budget(&budget_id));
            }
            match restored(budget, current.as_ref()) {
                Some(entry) => {
                    state.budgets.insert(budget_id.clone(), entry);
                }
                None => {
                    state.budgets.remove(&budget_id);
                }
            }
        }

        let touched: BTreeSet<YearMonth> = months
            .keys()
            .chain(applied.months.keys())
            .copied()
            .collect();
        let cached = state.months.entry(budget_id.clone()).or_default();
        for ym in touched {
            let original = months.remove(&ym);
            let optimistic = applied.months.get(&ym);
            if same_value(original.as_ref(), optimistic) {
                continue;
            }
            let current = cached.get(&ym).cloned();
            if !same_value(current.as_ref(), optimistic) {
                replaced.push(CacheKey::month(&budget_id, ym));
            }
            match restored(original, current.as_ref()) {
                Some(entry) => {
                    cached.insert(ym, entry);
                }
                None => {
                    cached.remove(&ym);
                }
            }
        }
        if cached.is_empty() {
            state.months.remove(&budget_id);
        }
        replaced
    }

    /// Puts back exactly the entries captured by `snapshot`, discarding any entry of the budget
    /// that was added since.
    pub fn restore(&self, snapshot: CacheSnapshot) {
        let mut state = self.write();
        let CacheSnapshot {
            budget_id,
            budget,
            months,
            loaded,
        } = snapshot;
        match budget {
            Some(budget) => {
                state.budgets.insert(budget_id.clone(), budget);
            }
            None => {
                state.budgets.remove(&budget_id);
            }
        }
        if months.is_empty() {
            state.months.remove(&budget_id);
        } else {
            state.months.insert(budget_id.clone(), months);
        }
        if loaded {
            state.loaded.insert(budget_id);
        } else {
            state.loaded.remove(&budget_id);
        }
    }
}

fn same_value<T: PartialEq>(a: Option<&Arc<Entry<T>>>, b: Option<&Arc<Entry<T>>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.value == b.value,
        (None, None) => true,
        _ => false,
    }
}

/// `before`'s value with `current`'s pending count.
fn restored<T: Clone>(
    before: Option<Arc<Entry<T>>>,
    current: Option<&Arc<Entry<T>>>,
) -> Option<Arc<Entry<T>>> {
    match (before, current) {
        (Some(before), Some(current)) => Some(Arc::new(Entry {
            value: before.value.clone(),
            pending: current.pending,
        })),
        (before, _) => before,
    }
}

//! `YearMonth` identifies one monthly period of a budget.

use anyhow::{bail, Context};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// A calendar month. Ordering is chronological, and `ordinal()` (`year * 100 + month`) is the
/// sortable key used in documents and in the budget's `month_map`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    /// Creates a `YearMonth`. `month` is 1-based.
    pub fn new(year: i32, month: u32) -> anyhow::Result<Self> {
        if !(1..=12).contains(&month) {
            bail!("Month must be between 1 and 12, got {month}");
        }
        if !(1..=9999).contains(&year) {
            bail!("Year must be between 1 and 9999, got {year}");
        }
        Ok(Self { year, month })
    }

    /// For values that were validated elsewhere, e.g. a month document checked on read.
    pub(crate) const fn new_unchecked(year: i32, month: u32) -> Self {
        Self { year, month }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// `year * 100 + month`, e.g. `202403`.
    pub fn ordinal(&self) -> i64 {
        i64::from(self.year) * 100 + i64::from(self.month)
    }

    /// Parses an ordinal such as `202403`.
    pub fn from_ordinal(ordinal: i64) -> anyhow::Result<Self> {
        let year = i32::try_from(ordinal / 100)
            .with_context(|| format!("Ordinal {ordinal} is out of range"))?;
        let month = u32::try_from(ordinal % 100)
            .with_context(|| format!("Ordinal {ordinal} has an invalid month"))?;
        Self::new(year, month)
    }

    /// The zero-padded `YYYYMM` string used as the `month_map` key.
    pub fn key(&self) -> String {
        format!("{:04}{:02}", self.year, self.month)
    }

    /// Parses a `month_map` key.
    pub fn from_key(key: &str) -> anyhow::Result<Self> {
        if key.len() != 6 || !key.chars().all(|c| c.is_ascii_digit()) {
            bail!("Invalid month key '{key}', expected YYYYMM");
        }
        let ordinal: i64 = key
            .parse()
            .with_context(|| format!("Invalid month key '{key}'"))?;
        Self::from_ordinal(ordinal)
    }

    /// The month after this one.
    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// The month before this one.
    pub fn prev(&self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    /// Moves forward (or backward for negative `months`) by a number of months.
    pub fn add_months(&self, months: i64) -> Self {
        let index = i64::from(self.year) * 12 + i64::from(self.month - 1) + months;
        Self {
            year: index.div_euclid(12) as i32,
            month: (index.rem_euclid(12) + 1) as u32,
        }
    }
}

impl Display for YearMonth {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Accepts `2024-03`, `2024/03` and `202403`.
impl FromStr for YearMonth {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some((y, m)) = s.split_once(['-', '/']) {
            let year: i32 = y.parse().with_context(|| format!("Invalid year in '{s}'"))?;
            let month: u32 = m.parse().with_context(|| format!("Invalid month in '{s}'"))?;
            return Self::new(year, month);
        }
        Self::from_key(s)
    }
}

impl Serialize for YearMonth {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.key())
    }
}

impl<'de> Deserialize<'de> for YearMonth {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        YearMonth::from_key(&s).map_err(serde::de::Error::custom)
    }
}

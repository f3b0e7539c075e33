//! Staleness of a month's persisted balances.

use serde::{Deserialize, Serialize};

/// Which of a month's derived balances may no longer reflect their inputs.
///
/// In documents this is stored as the two independent booleans `category_balances_stale` and
/// `account_balances_stale`; in code it is a single value so that every combination is handled
/// explicitly.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "StaleFlags", into = "StaleFlags")]
pub enum RecalcStatus {
    #[default]
    Fresh,
    StaleCategories,
    StaleAccounts,
    StaleBoth,
}

/// One of the two independently tracked staleness channels, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleChannel {
    /// Category balances only, e.g. after an allocation edit.
    Categories,
    /// Account balances only, e.g. after a transfer between accounts.
    Accounts,
    /// Both, e.g. after an expense is recorded.
    Both,
}

serde_plain::derive_display_from_serialize!(StaleChannel);
serde_plain::derive_fromstr_from_deserialize!(StaleChannel);

impl StaleChannel {
    fn bits(self) -> (bool, bool) {
        match self {
            StaleChannel::Categories => (true, false),
            StaleChannel::Accounts => (false, true),
            StaleChannel::Both => (true, true),
        }
    }
}

impl RecalcStatus {
    fn from_bits(categories: bool, accounts: bool) -> Self {
        match (categories, accounts) {
            (false, false) => RecalcStatus::Fresh,
            (true, false) => RecalcStatus::StaleCategories,
            (false, true) => RecalcStatus::StaleAccounts,
            (true, true) => RecalcStatus::StaleBoth,
        }
    }

    pub fn categories_stale(self) -> bool {
        matches!(self, RecalcStatus::StaleCategories | RecalcStatus::StaleBoth)
    }

    pub fn accounts_stale(self) -> bool {
        matches!(self, RecalcStatus::StaleAccounts | RecalcStatus::StaleBoth)
    }

    /// True unless `Fresh`.
    pub fn needs_recalculation(self) -> bool {
        self != RecalcStatus::Fresh
    }

    /// Returns the status with `channel` additionally marked stale.
    pub fn mark(self, channel: StaleChannel) -> Self {
        let (c, a) = channel.bits();
        Self::from_bits(self.categories_stale() || c, self.accounts_stale() || a)
    }

    /// Returns the status with `channel` cleared.
    pub fn clear(self, channel: StaleChannel) -> Self {
        let (c, a) = channel.bits();
        Self::from_bits(self.categories_stale() && !c, self.accounts_stale() && !a)
    }

    /// True if every part of `channel` is already stale, i.e. marking it would change nothing.
    pub fn covers(self, channel: StaleChannel) -> bool {
        self.mark(channel) == self
    }
}

/// The persisted representation of `RecalcStatus`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct StaleFlags {
    #[serde(default)]
    category_balances_stale: bool,
    #[serde(default)]
    account_balances_stale: bool,
}

impl From<StaleFlags> for RecalcStatus {
    fn from(flags: StaleFlags) -> Self {
        RecalcStatus::from_bits(flags.category_balances_stale, flags.account_balances_stale)
    }
}

impl From<RecalcStatus> for StaleFlags {
    fn from(status: RecalcStatus) -> Self {
        StaleFlags {
            category_balances_stale: status.categories_stale(),
            account_balances_stale: status.accounts_stale(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [RecalcStatus; 4] = [
        RecalcStatus::Fresh,
        RecalcStatus::StaleCategories,
        RecalcStatus::StaleAccounts,
        RecalcStatus::StaleBoth,
    ];
    const CHANNELS: [StaleChannel; 3] = [
        StaleChannel::Categories,
        StaleChannel::Accounts,
        StaleChannel::Both,
    ];

    #[test]
    fn mark_is_idempotent_for_every_state() {
        for status in ALL {
            for channel in CHANNELS {
                let once = status.mark(channel);
                assert_eq!(once.mark(channel), once, "{status:?} + {channel:?}");
                assert!(once.covers(channel));
            }
        }
    }

    #[test]
    fn channels_clear_independently() {
        let both = RecalcStatus::Fresh.mark(StaleChannel::Both);
        assert_eq!(both, RecalcStatus::StaleBoth);
        assert_eq!(
            both.clear(StaleChannel::Categories),
            RecalcStatus::StaleAccounts
        );
        assert_eq!(
            both.clear(StaleChannel::Accounts),
            RecalcStatus::StaleCategories
        );
        assert_eq!(both.clear(StaleChannel::Both), RecalcStatus::Fresh);
        assert_eq!(
            RecalcStatus::StaleCategories.mark(StaleChannel::Accounts),
            RecalcStatus::StaleBoth
        );
    }

    #[test]
    fn persisted_as_two_booleans() {
        let json = serde_json::to_value(RecalcStatus::StaleAccounts).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"category_balances_stale": false, "account_balances_stale": true})
        );
        let status: RecalcStatus = serde_json::from_value(serde_json::json!({
            "category_balances_stale": true
        }))
        .unwrap();
        assert_eq!(status, RecalcStatus::StaleCategories);
    }
}

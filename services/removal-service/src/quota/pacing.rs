use chrono::{Datelike, NaiveDate};

use super::stats::{days_in_month, UsageStats};

pub const DEFAULT_PACING_FLOOR: u64 = 5;

/// Spreads the monthly api allowance over the remaining days of the month,
/// holding back at least `floor` calls for the end of the period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingPolicy {
    floor: u64,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            floor: DEFAULT_PACING_FLOOR,
        }
    }
}

impl PacingPolicy {
    pub fn new(floor: u64) -> Self {
        Self { floor }
    }

    pub fn floor(&self) -> u64 {
        self.floor
    }

    /// Returns true when this call should prefer the metered provider.
    pub fn decide(&self, usage: &UsageStats, today: NaiveDate, force_remote: bool) -> bool {
        if force_remote && usage.can_use_api() {
            return true;
        }

        let remaining = usage.api_calls_remaining();
        remaining > days_remaining(today).max(self.floor)
    }
}

pub fn days_remaining(today: NaiveDate) -> u64 {
    u64::from(days_in_month(today).saturating_sub(today.day()))
}

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Usage counters for one quota period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    pub api_calls_used: u64,
    pub api_calls_limit: u64,
    pub local_processed: u64,
    pub total_processed: u64,
    pub period_key: String,
}

impl UsageStats {
    pub fn new(api_calls_limit: u64, period_key: impl Into<String>) -> Self {
        Self {
            api_calls_used: 0,
            api_calls_limit,
            local_processed: 0,
            total_processed: 0,
            period_key: period_key.into(),
        }
    }

    pub fn api_calls_remaining(&self) -> u64 {
        self.api_calls_limit.saturating_sub(self.api_calls_used)
    }

    pub fn can_use_api(&self) -> bool {
        self.api_calls_used < self.api_calls_limit
    }

    pub fn api_percentage(&self) -> f64 {
        if self.api_calls_limit == 0 {
            return 0.0;
        }
        (self.api_calls_used as f64 / self.api_calls_limit as f64) * 100.0
    }

    pub fn is_stale(&self, current_period: &str) -> bool {
        self.period_key != current_period
    }
}

/// Read-only view handed to reporting callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub local_processed: u64,
    pub total_processed: u64,
    pub usage_percent: f64,
    pub period: String,
    pub reset_date: NaiveDate,
}

impl UsageReport {
    pub fn from_stats(stats: &UsageStats, now: DateTime<Utc>) -> Self {
        let today = now.date_naive();
        let reset_date = first_of_next_month(today).unwrap_or(today);

        Self {
            used: stats.api_calls_used,
            limit: stats.api_calls_limit,
            remaining: stats.api_calls_remaining(),
            local_processed: stats.local_processed,
            total_processed: stats.total_processed,
            usage_percent: stats.api_percentage(),
            period: stats.period_key.clone(),
            reset_date,
        }
    }
}

pub fn period_key(now: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", now.year(), now.month())
}

pub fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
}

pub fn days_in_month(date: NaiveDate) -> u32 {
    first_of_next_month(date)
        .and_then(|next| next.pred_opt())
        .map(|last| last.day())
        .unwrap_or(31)
}

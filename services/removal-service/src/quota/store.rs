use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::storage::{UsageBackend, UsageHistoryRecord};

use super::clock::Clock;
use super::error::QuotaError;
use super::stats::{period_key, UsageReport, UsageStats};

struct QuotaState {
    stats: UsageStats,
    /// Remote calls that hold a reservation but have not settled yet.
    in_flight: u64,
}

/// Sole owner of the monthly usage counters.
///
/// Every mutation runs under one mutex and is written through to the backend
/// before the lock is released.
pub struct QuotaStore {
    state: Mutex<QuotaState>,
    backend: Arc<dyn UsageBackend>,
    clock: Arc<dyn Clock>,
    api_calls_limit: u64,
}

impl QuotaStore {
    /// Restores the persisted counters, resetting them if they belong to an
    /// earlier month.
    pub fn open(
        backend: Arc<dyn UsageBackend>,
        clock: Arc<dyn Clock>,
        api_calls_limit: u64,
    ) -> Result<Self, QuotaError> {
        let current_period = period_key(clock.now());
        let (stats, dirty) = match backend.load()? {
            Some(stored) => {
                // A limit below what the period already spent takes effect at
                // the next rollover; until then the period is simply exhausted.
                let effective_limit = if stored.is_stale(&current_period) {
                    api_calls_limit
                } else {
                    api_calls_limit.max(stored.api_calls_used)
                };
                if effective_limit != api_calls_limit {
                    warn!(
                        api_calls_limit,
                        api_calls_used = stored.api_calls_used,
                        "configured api call limit is below current usage; holding period at its usage"
                    );
                }
                let limit_changed = stored.api_calls_limit != effective_limit;
                let stored = UsageStats {
                    api_calls_limit: effective_limit,
                    ..stored
                };
                if limit_changed {
                    info!(api_calls_limit = effective_limit, "applying configured api call limit");
                }
                (stored, limit_changed)
            }
            None => {
                info!(period = %current_period, api_calls_limit, "initializing usage counters");
                (UsageStats::new(api_calls_limit, current_period.clone()), true)
            }
        };

        let store = Self {
            state: Mutex::new(QuotaState { stats, in_flight: 0 }),
            backend,
            clock,
            api_calls_limit,
        };

        {
            let mut state = store.lock();
            let rolled = store.roll_period(&mut state);
            if dirty && !rolled {
                store.backend.save(&state.stats)?;
            }
        }

        Ok(store)
    }

    /// Current-period counters, persisting a reset if the month has turned.
    pub fn load(&self) -> Result<UsageStats, QuotaError> {
        let mut state = self.lock();
        self.roll_period(&mut state);
        Ok(state.stats.clone())
    }

    pub fn record_local_use(&self) -> Result<UsageStats, QuotaError> {
        let mut state = self.lock();
        self.roll_period(&mut state);

        state.stats.local_processed += 1;
        state.stats.total_processed += 1;

        self.backend.save(&state.stats)?;
        debug!(
            local_processed = state.stats.local_processed,
            total_processed = state.stats.total_processed,
            "recorded local removal"
        );
        Ok(state.stats.clone())
    }

    /// Counts one remote call that was made without a reservation.
    ///
    /// Outstanding reservations count against the limit so they can still
    /// commit.
    pub fn record_api_use(&self) -> Result<UsageStats, QuotaError> {
        let mut state = self.lock();
        self.roll_period(&mut state);

        let committed_or_held = state.stats.api_calls_used + state.in_flight;
        if committed_or_held >= state.stats.api_calls_limit {
            return Err(self.overrun(&state.stats));
        }

        self.increment_api(&mut state)
    }

    /// Takes one remote call out of the allowance ahead of the provider call.
    ///
    /// The availability check and the hold happen under the same lock that
    /// guards the increments, so concurrent requests cannot oversubscribe.
    pub fn try_reserve_api(&self) -> Result<ApiReservation<'_>, QuotaError> {
        let mut state = self.lock();
        self.roll_period(&mut state);

        let used = state.stats.api_calls_used;
        let limit = state.stats.api_calls_limit;
        if used + state.in_flight >= limit {
            return Err(QuotaError::Exhausted { used, limit });
        }

        state.in_flight += 1;
        debug!(used, limit, in_flight = state.in_flight, "reserved api call");
        Ok(ApiReservation {
            store: self,
            settled: false,
        })
    }

    /// Read-only copy of the counters. A stale period is reported as already
    /// reset, but nothing is written.
    pub fn snapshot(&self) -> UsageStats {
        let state = self.lock();
        let current_period = period_key(self.clock.now());
        if state.stats.is_stale(&current_period) {
            UsageStats::new(self.api_calls_limit, current_period)
        } else {
            state.stats.clone()
        }
    }

    pub fn usage_report(&self) -> UsageReport {
        UsageReport::from_stats(&self.snapshot(), self.clock.now())
    }

    pub fn history(&self) -> Result<Vec<UsageHistoryRecord>, QuotaError> {
        Ok(self.backend.history()?)
    }

    pub fn in_flight(&self) -> u64 {
        self.lock().in_flight
    }

    pub fn api_calls_limit(&self) -> u64 {
        self.api_calls_limit
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn commit_reserved(&self) -> Result<UsageStats, QuotaError> {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        self.roll_period(&mut state);

        if state.stats.api_calls_used >= state.stats.api_calls_limit {
            return Err(self.overrun(&state.stats));
        }

        self.increment_api(&mut state)
    }

    fn release_reserved(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        debug!(in_flight = state.in_flight, "released api reservation");
    }

    fn increment_api(&self, state: &mut QuotaState) -> Result<UsageStats, QuotaError> {
        state.stats.api_calls_used += 1;
        state.stats.total_processed += 1;

        self.backend.save(&state.stats)?;
        debug!(
            api_calls_used = state.stats.api_calls_used,
            api_calls_limit = state.stats.api_calls_limit,
            "recorded api removal"
        );
        Ok(state.stats.clone())
    }

    fn overrun(&self, stats: &UsageStats) -> QuotaError {
        error!(
            used = stats.api_calls_used,
            limit = stats.api_calls_limit,
            "api quota would be exceeded; refusing increment"
        );
        QuotaError::Overrun {
            used: stats.api_calls_used,
            limit: stats.api_calls_limit,
        }
    }

    /// Resets the counters when the calendar month no longer matches.
    /// Returns whether a reset happened.
    fn roll_period(&self, state: &mut QuotaState) -> bool {
        let current_period = period_key(self.clock.now());
        if !state.stats.is_stale(&current_period) {
            return false;
        }

        if let Err(err) = self.backend.archive(&state.stats) {
            warn!(
                period = %state.stats.period_key,
                error = %err,
                "failed to archive usage of closed period"
            );
        }

        info!(
            previous_period = %state.stats.period_key,
            period = %current_period,
            api_calls_used = state.stats.api_calls_used,
            local_processed = state.stats.local_processed,
            "quota period rolled over"
        );

        state.stats = UsageStats::new(self.api_calls_limit, current_period);
        if let Err(err) = self.backend.save(&state.stats) {
            error!(error = %err, "failed to persist period reset");
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, QuotaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One remote call held against the allowance.
///
/// Dropping an unsettled reservation gives the call back.
#[must_use = "an unused reservation is released immediately"]
pub struct ApiReservation<'a> {
    store: &'a QuotaStore,
    settled: bool,
}

impl ApiReservation<'_> {
    /// Turns the hold into a counted api call.
    pub fn commit(mut self) -> Result<UsageStats, QuotaError> {
        self.settled = true;
        self.store.commit_reserved()
    }
}

impl Drop for ApiReservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.store.release_reserved();
        }
    }
}

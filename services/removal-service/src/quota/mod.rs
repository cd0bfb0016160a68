pub mod clock;
pub mod error;
pub mod pacing;
pub mod stats;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::QuotaError;
pub use pacing::{PacingPolicy, DEFAULT_PACING_FLOOR};
pub use stats::{period_key, UsageReport, UsageStats};
pub use store::{ApiReservation, QuotaStore};

pub const DEFAULT_API_MONTHLY_LIMIT: u64 = 50;

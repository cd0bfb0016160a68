pub mod api;
pub mod config;
pub mod dispatch;
pub mod providers;
pub mod quota;
pub mod storage;

pub use api::{create_router, ApiState, ErrorResponse, RoutingMode, StatusResponse};
pub use config::RemovalServiceConfig;
pub use dispatch::{
    ApiUsage, Dispatcher, RemovalFailure, RemovalMethod, RemovalOptions, RemovalResult,
};
pub use providers::{BackgroundRemover, LocalRemover, ProviderError, ProviderErrorKind, RemoteRemover};
pub use quota::{
    Clock, ManualClock, PacingPolicy, QuotaError, QuotaStore, SystemClock, UsageReport, UsageStats,
};
pub use storage::{MemoryUsageBackend, StorageError, UsageBackend, UsageDatabase, UsageHistoryRecord};

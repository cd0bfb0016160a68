use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

pub use backdrop_removal_service;

use backdrop_removal_service::{
    BackgroundRemover, Clock, Dispatcher, ManualClock, MemoryUsageBackend, PacingPolicy,
    ProviderError, QuotaStore, UsageBackend, UsageDatabase,
};

/// Remover that answers immediately, so benchmarks measure routing and
/// quota bookkeeping only.
pub struct InstantRemover {
    name: &'static str,
    fail: bool,
}

impl InstantRemover {
    pub fn succeeding(name: &'static str) -> Arc<Self> {
        Arc::new(Self { name, fail: false })
    }

    pub fn failing(name: &'static str) -> Arc<Self> {
        Arc::new(Self { name, fail: true })
    }
}

#[async_trait]
impl BackgroundRemover for InstantRemover {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn process(&self, image: Bytes) -> Result<Bytes, ProviderError> {
        if self.fail {
            Err(ProviderError::generic("bench provider failure"))
        } else {
            Ok(image)
        }
    }
}

pub struct DispatchBenchFixture {
    pub dispatcher: Dispatcher,
    pub image: Bytes,
    // Keeps the SQLite file alive for the fixture's lifetime.
    pub temp_dir: Option<TempDir>,
}

impl DispatchBenchFixture {
    /// In-memory counters; `local_ok` picks whether every request falls back.
    pub fn in_memory(local_ok: bool, api_calls_limit: u64) -> Self {
        let backend: Arc<dyn UsageBackend> = Arc::new(MemoryUsageBackend::new());
        Self::build(backend, local_ok, api_calls_limit, None)
    }

    /// Counters written through to a SQLite file in a temp directory.
    pub fn sqlite(local_ok: bool, api_calls_limit: u64) -> Self {
        let temp_dir = TempDir::new().expect("tempdir");
        let database =
            UsageDatabase::new(temp_dir.path().to_path_buf()).expect("usage database opens");
        let backend: Arc<dyn UsageBackend> = Arc::new(database);
        Self::build(backend, local_ok, api_calls_limit, Some(temp_dir))
    }

    fn build(
        backend: Arc<dyn UsageBackend>,
        local_ok: bool,
        api_calls_limit: u64,
        temp_dir: Option<TempDir>,
    ) -> Self {
        let now = Utc
            .with_ymd_and_hms(2025, 4, 1, 9, 0, 0)
            .single()
            .expect("valid bench timestamp");
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(now));
        let quota = QuotaStore::open(backend, clock, api_calls_limit).expect("quota store opens");

        let local: Arc<dyn BackgroundRemover> = if local_ok {
            InstantRemover::succeeding("bench-local")
        } else {
            InstantRemover::failing("bench-local")
        };
        let remote: Arc<dyn BackgroundRemover> = InstantRemover::succeeding("bench-remote");

        Self {
            dispatcher: Dispatcher::new(Arc::new(quota), PacingPolicy::default(), local, remote),
            image: Bytes::from(vec![0u8; 64 * 1024]),
            temp_dir,
        }
    }
}

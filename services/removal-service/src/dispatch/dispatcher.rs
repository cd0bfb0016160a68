use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::FutureExt;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::providers::{BackgroundRemover, ProviderError};
use crate::quota::{ApiReservation, PacingPolicy, QuotaError, QuotaStore, UsageReport};

use super::result::{ApiUsage, RemovalFailure, RemovalMethod, RemovalResult};

/// Caller flags for one removal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovalOptions {
    /// Skip the local provider and spend an api call if one is left.
    pub force_remote: bool,
    /// Try the local provider first. When false only the remote provider runs.
    pub use_local: bool,
}

impl Default for RemovalOptions {
    fn default() -> Self {
        Self {
            force_remote: false,
            use_local: true,
        }
    }
}

/// Routes removal requests between the local and the metered provider.
///
/// Each request makes at most one fallback and changes the quota at most once,
/// and only when it succeeds.
#[derive(Clone)]
pub struct Dispatcher {
    quota: Arc<QuotaStore>,
    pacing: PacingPolicy,
    local: Arc<dyn BackgroundRemover>,
    remote: Arc<dyn BackgroundRemover>,
}

enum RemoteOutcome {
    Done(RemovalResult),
    Failed(ProviderError),
    Unavailable { used: u64, limit: u64 },
}

impl Dispatcher {
    pub fn new(
        quota: Arc<QuotaStore>,
        pacing: PacingPolicy,
        local: Arc<dyn BackgroundRemover>,
        remote: Arc<dyn BackgroundRemover>,
    ) -> Self {
        Self {
            quota,
            pacing,
            local,
            remote,
        }
    }

    pub fn quota(&self) -> &Arc<QuotaStore> {
        &self.quota
    }

    pub fn pacing(&self) -> PacingPolicy {
        self.pacing
    }

    pub fn usage_stats(&self) -> UsageReport {
        self.quota.usage_report()
    }

    /// Local first, then a single fallback to the remote provider.
    pub async fn remove_background(&self, image: Bytes, options: RemovalOptions) -> RemovalResult {
        let dispatcher = self.clone();
        self.run_detached(async move { dispatcher.dispatch(image, options).await })
            .await
    }

    /// Lets the pacing policy pick the first provider: the remote one while
    /// the allowance is ahead of the calendar, the local one otherwise.
    pub async fn remove_background_paced(&self, image: Bytes, force_remote: bool) -> RemovalResult {
        let dispatcher = self.clone();
        self.run_detached(async move { dispatcher.dispatch_paced(image, force_remote).await })
            .await
    }

    /// Runs the request on its own task so a dropped caller cannot cut a
    /// provider call or a quota update short.
    async fn run_detached<F>(&self, request: F) -> RemovalResult
    where
        F: Future<Output = RemovalResult> + Send + 'static,
    {
        let span = info_span!("removal", request_id = %Uuid::new_v4());
        match tokio::spawn(request.instrument(span)).await {
            Ok(result) => result,
            Err(err) => {
                error!(error = %err, "background removal task aborted");
                RemovalResult::failed(
                    RemovalFailure::Internal {
                        message: err.to_string(),
                    },
                    None,
                )
            }
        }
    }

    async fn dispatch(&self, image: Bytes, options: RemovalOptions) -> RemovalResult {
        let mut local_failure = None;

        if options.use_local && !options.force_remote {
            match self.try_local(image.clone()).await {
                Ok(result) => return result,
                Err(err) => local_failure = Some(err.message),
            }
        }

        match self.try_remote(image).await {
            RemoteOutcome::Done(result) => result,
            RemoteOutcome::Unavailable { used, limit } => {
                let method = local_failure.as_ref().map(|_| RemovalMethod::Local);
                RemovalResult::failed(
                    RemovalFailure::QuotaExhausted {
                        used,
                        limit,
                        local: local_failure,
                    },
                    method,
                )
            }
            RemoteOutcome::Failed(err) => {
                let failure = match local_failure {
                    Some(local) => RemovalFailure::Combined {
                        local,
                        remote_kind: err.kind,
                        remote: err.message,
                    },
                    None => RemovalFailure::Remote {
                        kind: err.kind,
                        message: err.message,
                    },
                };
                RemovalResult::failed(failure, Some(RemovalMethod::Remote))
            }
        }
    }

    async fn dispatch_paced(&self, image: Bytes, force_remote: bool) -> RemovalResult {
        let usage = self.quota.snapshot();
        let today = self.quota.now().date_naive();

        if !self.pacing.decide(&usage, today, force_remote) {
            debug!(
                used = usage.api_calls_used,
                limit = usage.api_calls_limit,
                "pacing keeps api calls in reserve"
            );
            let options = RemovalOptions {
                force_remote,
                use_local: true,
            };
            return self.dispatch(image, options).await;
        }

        debug!(
            used = usage.api_calls_used,
            limit = usage.api_calls_limit,
            "pacing prefers remote provider"
        );
        let remote_failure = match self.try_remote(image.clone()).await {
            RemoteOutcome::Done(result) => return result,
            RemoteOutcome::Failed(err) => err,
            RemoteOutcome::Unavailable { used, limit } => {
                if force_remote {
                    return RemovalResult::failed(
                        RemovalFailure::QuotaExhausted {
                            used,
                            limit,
                            local: None,
                        },
                        None,
                    );
                }
                return match self.try_local(image).await {
                    Ok(result) => result,
                    Err(err) => RemovalResult::failed(
                        RemovalFailure::QuotaExhausted {
                            used,
                            limit,
                            local: Some(err.message),
                        },
                        Some(RemovalMethod::Local),
                    ),
                };
            }
        };

        if force_remote {
            return RemovalResult::failed(
                RemovalFailure::Remote {
                    kind: remote_failure.kind,
                    message: remote_failure.message,
                },
                Some(RemovalMethod::Remote),
            );
        }

        match self.try_local(image).await {
            Ok(result) => result,
            Err(err) => RemovalResult::failed(
                RemovalFailure::Combined {
                    local: err.message,
                    remote_kind: remote_failure.kind,
                    remote: remote_failure.message,
                },
                Some(RemovalMethod::Local),
            ),
        }
    }

    async fn try_local(&self, image: Bytes) -> Result<RemovalResult, ProviderError> {
        debug!(provider = self.local.name(), "attempting local background removal");

        match guarded_process(self.local.as_ref(), image).await {
            Ok(processed) => {
                if let Err(err) = self.quota.record_local_use() {
                    error!(error = %err, "failed to record local removal");
                }
                info!(method = "local", bytes = processed.len(), "background removed");
                Ok(RemovalResult::local_success(processed))
            }
            Err(err) => {
                warn!(kind = %err.kind, error = %err, "local background removal failed");
                Err(err)
            }
        }
    }

    async fn try_remote(&self, image: Bytes) -> RemoteOutcome {
        let reservation = match self.quota.try_reserve_api() {
            Ok(reservation) => reservation,
            Err(QuotaError::Exhausted { used, limit }) => {
                info!(used, limit, "api quota exhausted; remote provider skipped");
                return RemoteOutcome::Unavailable { used, limit };
            }
            Err(err) => {
                error!(error = %err, "unable to reserve api call");
                let stats = self.quota.snapshot();
                return RemoteOutcome::Unavailable {
                    used: stats.api_calls_used,
                    limit: stats.api_calls_limit,
                };
            }
        };

        debug!(provider = self.remote.name(), "attempting remote background removal");
        match guarded_process(self.remote.as_ref(), image).await {
            Ok(processed) => {
                let api_usage = self.commit_remote(reservation);
                info!(
                    method = "remote",
                    bytes = processed.len(),
                    remaining = api_usage.remaining,
                    total = api_usage.total,
                    "background removed"
                );
                RemoteOutcome::Done(RemovalResult::remote_success(processed, api_usage))
            }
            Err(err) => {
                drop(reservation);
                warn!(kind = %err.kind, error = %err, "remote background removal failed");
                RemoteOutcome::Failed(err)
            }
        }
    }

    fn commit_remote(&self, reservation: ApiReservation<'_>) -> ApiUsage {
        match reservation.commit() {
            Ok(stats) => ApiUsage::from_stats(&stats),
            Err(err) => {
                error!(error = %err, "failed to record remote removal");
                ApiUsage::from_stats(&self.quota.snapshot())
            }
        }
    }
}

/// Runs one provider call, turning a panic inside it into a generic provider
/// failure so the fallback chain keeps going.
async fn guarded_process(
    provider: &dyn BackgroundRemover,
    image: Bytes,
) -> Result<Bytes, ProviderError> {
    match AssertUnwindSafe(provider.process(image)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(provider = provider.name(), panic = %message, "provider panicked");
            Err(ProviderError::generic(format!(
                "{} provider panicked: {message}",
                provider.name()
            )))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::providers::ProviderErrorKind;
use crate::quota::UsageStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalMethod {
    Local,
    Remote,
}

impl RemovalMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemovalMethod::Local => "local",
            RemovalMethod::Remote => "remote",
        }
    }
}

impl fmt::Display for RemovalMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Api allowance left after the call that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiUsage {
    pub remaining: u64,
    pub total: u64,
}

impl ApiUsage {
    pub fn from_stats(stats: &UsageStats) -> Self {
        Self {
            remaining: stats.api_calls_remaining(),
            total: stats.api_calls_limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemovalFailure {
    #[error("Local processing failed: {message}")]
    Local { message: String },
    #[error("Remote processing failed: {message}")]
    Remote {
        kind: ProviderErrorKind,
        message: String,
    },
    #[error("{}API limit exceeded ({used}/{limit})", local_prefix(.local))]
    QuotaExhausted {
        used: u64,
        limit: u64,
        local: Option<String>,
    },
    #[error("Both local and API processing failed: local: {local}; remote: {remote}")]
    Combined {
        local: String,
        remote_kind: ProviderErrorKind,
        remote: String,
    },
    #[error("Background removal aborted: {message}")]
    Internal { message: String },
}

impl RemovalFailure {
    /// Kind reported by the remote provider, when it was the one that failed.
    pub fn remote_kind(&self) -> Option<ProviderErrorKind> {
        match self {
            RemovalFailure::Remote { kind, .. } => Some(*kind),
            RemovalFailure::Combined { remote_kind, .. } => Some(*remote_kind),
            _ => None,
        }
    }
}

fn local_prefix(local: &Option<String>) -> String {
    match local {
        Some(message) => format!("Local processing failed ({message}) and "),
        None => String::new(),
    }
}

/// Outcome of one background removal request.
#[derive(Debug, Clone, Serialize)]
pub struct RemovalResult {
    pub success: bool,
    #[serde(skip)]
    pub processed_image: Option<Bytes>,
    pub error: Option<String>,
    /// Last provider attempted; `None` when no provider ran.
    pub method: Option<RemovalMethod>,
    pub api_usage: Option<ApiUsage>,
    pub failure: Option<RemovalFailure>,
}

impl RemovalResult {
    pub fn local_success(image: Bytes) -> Self {
        Self {
            success: true,
            processed_image: Some(image),
            error: None,
            method: Some(RemovalMethod::Local),
            api_usage: None,
            failure: None,
        }
    }

    pub fn remote_success(image: Bytes, api_usage: ApiUsage) -> Self {
        Self {
            success: true,
            processed_image: Some(image),
            error: None,
            method: Some(RemovalMethod::Remote),
            api_usage: Some(api_usage),
            failure: None,
        }
    }

    pub fn failed(failure: RemovalFailure, method: Option<RemovalMethod>) -> Self {
        Self {
            success: false,
            processed_image: None,
            error: Some(failure.to_string()),
            method,
            api_usage: None,
            failure: Some(failure),
        }
    }
}

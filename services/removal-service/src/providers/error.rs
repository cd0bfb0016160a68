use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderErrorKind {
    Auth,
    Quota,
    RateLimit,
    Timeout,
    Generic,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderErrorKind::Auth => "AUTH",
            ProviderErrorKind::Quota => "QUOTA",
            ProviderErrorKind::RateLimit => "RATE_LIMIT",
            ProviderErrorKind::Timeout => "TIMEOUT",
            ProviderErrorKind::Generic => "GENERIC",
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Auth, message)
    }

    pub fn quota(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Quota, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::RateLimit, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Generic, message)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::timeout("background removal request timed out")
        } else if err.is_connect() {
            ProviderError::generic(format!("background removal service unreachable: {err}"))
        } else {
            ProviderError::generic(format!("background removal request failed: {err}"))
        }
    }
}

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::quota::UsageReport;

/// How the upload asked to be routed between providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    #[default]
    LocalFirst,
    RemoteOnly,
    Paced,
}

impl FromStr for RoutingMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "local_first" | "local-first" => Ok(RoutingMode::LocalFirst),
            "remote_only" | "remote-only" => Ok(RoutingMode::RemoteOnly),
            "paced" | "auto" => Ok(RoutingMode::Paced),
            other => Err(format!("unknown routing mode {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub local: String,
    pub remote: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub timestamp: String,
    pub services: ProviderStatus,
    pub usage: UsageReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    pub details: Option<serde_json::Value>,
}

//! Row types for the persistent tables.
//!
//! Timestamps are RFC 3339 / `datetime('now')` TEXT columns. JSON columns
//! (`settings`, `policy_overrides`, `features`, `metadata`) are stored as
//! serialized TEXT and surfaced as `serde_json::Value`.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::state::JobStatus;

/// A subscription plan. Owned by the external billing subsystem; the core
/// only reads it. Not a multi-tenant table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: i64,
    pub name: String,
    pub display_name: String,
    pub price_usd: f64,
    pub billing_interval: String,
    pub max_repos: i64,
    pub max_prs_per_month: i64,
    pub max_tokens_per_month: i64,
    pub max_llm_calls_per_month: i64,
    pub features: serde_json::Value,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Lifecycle status of a platform installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallationStatus {
    Pending,
    Active,
    Suspended,
}

impl InstallationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Suspended => "suspended",
        }
    }
}

impl std::fmt::Display for InstallationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstallationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            _ => Err(format!("Invalid installation status: {}", s)),
        }
    }
}

/// One external-platform installation; the isolation boundary for all
/// multi-tenant data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub github_installation_id: i64,
    pub github_account_login: String,
    pub github_account_type: String,
    pub installed_at: String,
    pub uninstalled_at: Option<String>,
    pub settings: serde_json::Value,
    pub installation_status: InstallationStatus,
    pub plan_id: i64,
    pub plan_changed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields required to register a tenant on a platform-install webhook.
/// Created through the raw client: the tenant row is the boundary itself,
/// so no scope exists yet when it is written.
#[derive(Debug, Clone)]
pub struct NewTenant {
    pub github_installation_id: i64,
    pub github_account_login: String,
    pub github_account_type: String,
    pub plan_id: i64,
    pub settings: serde_json::Value,
}

/// A monitored repository, scoped to exactly one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub tenant_id: String,
    pub github_repo_id: i64,
    pub owner: String,
    pub name: String,
    pub full_name: String,
    pub enabled: bool,
    pub policy_overrides: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields for inserting a repository through the tenant-aware client.
///
/// `tenant_id` is deliberately absent: the store stamps the current scope's
/// tenant onto every inserted row and ignores anything the caller might try
/// to smuggle in through the generic layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRepository {
    pub github_repo_id: i64,
    pub owner: String,
    pub name: String,
    pub full_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub policy_overrides: serde_json::Value,
}

/// The unit of orchestration: one issue becomes one job.
///
/// `metadata` accumulates the issue reference plus each stage's result
/// (`plan`, `code`, `review`, `pr`) and, on failure, `error_details` and
/// `failed_at`, so a finished row is a self-contained audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub tenant_id: String,
    pub repository_id: String,
    pub status: JobStatus,
    pub metadata: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
}

/// One recorded move through the state machine, appended by the transition
/// engine inside the same transaction that writes the new status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTransition {
    pub id: i64,
    pub job_id: String,
    pub from_status: JobStatus,
    pub to_status: JobStatus,
    pub event: String,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_installation_status_roundtrip() {
        for s in &["pending", "active", "suspended"] {
            let parsed: InstallationStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<InstallationStatus>().is_err());
    }

    #[test]
    fn test_installation_status_serde_lowercase() {
        assert_eq!(
            serde_json::to_string(&InstallationStatus::Suspended).unwrap(),
            "\"suspended\""
        );
        assert_eq!(
            serde_json::from_str::<InstallationStatus>("\"active\"").unwrap(),
            InstallationStatus::Active
        );
    }

    #[test]
    fn test_new_repository_serializes_without_tenant_id() {
        let new = NewRepository {
            github_repo_id: 1001,
            owner: "acme".into(),
            name: "widgets".into(),
            full_name: "acme/widgets".into(),
            enabled: true,
            policy_overrides: serde_json::json!({}),
        };
        let value = serde_json::to_value(&new).unwrap();
        assert!(value.get("tenant_id").is_none());
        assert_eq!(value["github_repo_id"], 1001);
    }
}

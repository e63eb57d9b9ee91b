//! Library configuration.
//!
//! Every field has a default so an empty table (or no table at all) yields a
//! working configuration for the public Azure cloud. Front ends usually load
//! this from a file and environment overrides and hand it to
//! [`CredentialResolver`](crate::auth::CredentialResolver).

use crate::error::{IdentityError, IdentityResult};
use serde::Deserialize;
use std::time::Duration;

/// First-party application id used for interactive device code logins.
pub const APPLICATION_ID: &str = "579a7132-0e58-4d80-b1e1-7a1e2d337859";
pub const DEFAULT_TENANT_ID: &str = "common";
pub const DEFAULT_ACTIVE_DIRECTORY_ENDPOINT: &str = "https://login.microsoftonline.com";
pub const STORAGE_SCOPE: &str = "https://storage.azure.com/.default";
pub const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";
pub const DEFAULT_MANAGEMENT_ENDPOINT: &str = "https://management.azure.com/";
pub const DEFAULT_IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
pub const DEFAULT_ENV_VAR_NAME: &str = "AZOAUTH_OAUTH_TOKEN_INFO";

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_tenant_id")]
    pub tenant_id: String,
    #[serde(default = "default_active_directory_endpoint")]
    pub active_directory_endpoint: String,
    #[serde(default = "default_application_id")]
    pub application_id: String,
    /// Scope requested when a login entry point validates a new credential.
    #[serde(default = "default_probe_scope")]
    pub probe_scope: String,
    #[serde(default = "default_management_endpoint")]
    pub management_endpoint: String,
    #[serde(default = "default_management_scope")]
    pub management_scope: String,
    #[serde(default = "default_imds_endpoint")]
    pub imds_endpoint: String,
    #[serde(default = "default_env_var_name")]
    pub env_var_name: String,
    #[serde(default = "default_azure_cli_path")]
    pub azure_cli_path: String,
    #[serde(default = "default_powershell_path")]
    pub powershell_path: String,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default)]
    pub polling: PollingConfig,
}

fn default_tenant_id() -> String {
    DEFAULT_TENANT_ID.to_string()
}

fn default_active_directory_endpoint() -> String {
    DEFAULT_ACTIVE_DIRECTORY_ENDPOINT.to_string()
}

fn default_application_id() -> String {
    APPLICATION_ID.to_string()
}

fn default_probe_scope() -> String {
    STORAGE_SCOPE.to_string()
}

fn default_management_endpoint() -> String {
    DEFAULT_MANAGEMENT_ENDPOINT.to_string()
}

fn default_management_scope() -> String {
    MANAGEMENT_SCOPE.to_string()
}

fn default_imds_endpoint() -> String {
    DEFAULT_IMDS_ENDPOINT.to_string()
}

fn default_env_var_name() -> String {
    DEFAULT_ENV_VAR_NAME.to_string()
}

fn default_azure_cli_path() -> String {
    "az".to_string()
}

fn default_powershell_path() -> String {
    "pwsh".to_string()
}

fn default_http_timeout_secs() -> u64 {
    30
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            tenant_id: default_tenant_id(),
            active_directory_endpoint: default_active_directory_endpoint(),
            application_id: default_application_id(),
            probe_scope: default_probe_scope(),
            management_endpoint: default_management_endpoint(),
            management_scope: default_management_scope(),
            imds_endpoint: default_imds_endpoint(),
            env_var_name: default_env_var_name(),
            azure_cli_path: default_azure_cli_path(),
            powershell_path: default_powershell_path(),
            http_timeout_secs: default_http_timeout_secs(),
            polling: PollingConfig::default(),
        }
    }
}

impl IdentityConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Builds the HTTP client shared by every credential and management request.
    pub fn build_http_client(&self) -> IdentityResult<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.http_timeout())
            .build()
            .map_err(|e| {
                IdentityError::Configuration(format!("HTTP client creation failed: {e}"))
            })
    }
}

/// Backoff settings for long-running operation polling.
#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Consecutive transient failures tolerated while polling. `None` retries
    /// until the caller cancels.
    #[serde(default)]
    pub max_transient_failures: Option<u32>,
}

fn default_initial_interval_ms() -> u64 {
    1_000
}

fn default_max_interval_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            multiplier: default_multiplier(),
            max_transient_failures: None,
        }
    }
}

impl PollingConfig {
    /// First wait, never longer than `max_interval`.
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms).min(self.max_interval())
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    /// Next wait after `current`, capped at `max_interval`.
    pub fn next_interval(&self, current: Duration) -> Duration {
        let multiplier = if self.multiplier.is_finite() && self.multiplier >= 1.0 {
            self.multiplier
        } else {
            1.0
        };
        let max = self.max_interval();
        Duration::try_from_secs_f64(current.as_secs_f64() * multiplier)
            .unwrap_or(max)
            .min(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: IdentityConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.tenant_id, DEFAULT_TENANT_ID);
        assert_eq!(config.env_var_name, DEFAULT_ENV_VAR_NAME);
        assert_eq!(config.probe_scope, STORAGE_SCOPE);
        assert_eq!(config.polling.initial_interval(), Duration::from_secs(1));
        assert_eq!(config.polling.max_transient_failures, None);
    }

    #[test]
    fn backoff_is_capped() {
        let polling = PollingConfig {
            initial_interval_ms: 100,
            max_interval_ms: 350,
            multiplier: 2.0,
            max_transient_failures: None,
        };
        let mut interval = polling.initial_interval();
        interval = polling.next_interval(interval);
        assert_eq!(interval, Duration::from_millis(200));
        interval = polling.next_interval(interval);
        assert_eq!(interval, Duration::from_millis(350));
        interval = polling.next_interval(interval);
        assert_eq!(interval, Duration::from_millis(350));
    }

    #[test]
    fn oversized_settings_saturate_at_max_interval() {
        let polling = PollingConfig {
            initial_interval_ms: u64::MAX,
            max_interval_ms: 5_000,
            multiplier: f64::MAX,
            max_transient_failures: None,
        };
        assert_eq!(polling.initial_interval(), Duration::from_secs(5));
        assert_eq!(polling.next_interval(Duration::MAX), Duration::from_secs(5));
        assert_eq!(
            polling.next_interval(Duration::from_millis(10)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn invalid_multiplier_keeps_interval_fixed() {
        let polling = PollingConfig {
            multiplier: 0.5,
            ..PollingConfig::default()
        };
        assert_eq!(
            polling.next_interval(Duration::from_secs(2)),
            Duration::from_secs(2)
        );
    }
}

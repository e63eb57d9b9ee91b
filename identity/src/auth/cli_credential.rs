//! Credentials delegated to an already signed-in developer tool.

use super::credential::{TokenCredential, resource_from_scopes, scope_key};
use super::token_cache::TokenSlot;
use super::types::{AccessToken, CredentialKind};
use crate::error::{IdentityError, IdentityResult};
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use std::process::Output;
use tokio::process::Command;

/// Rejects values that could escape the quoted arguments passed to the tools.
fn check_argument(name: &str, value: &str) -> IdentityResult<()> {
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | ':' | '/'));
    if valid {
        Ok(())
    } else {
        Err(IdentityError::Configuration(format!(
            "{name} contains unsupported characters: {value}"
        )))
    }
}

async fn run(program: &str, args: &[String], operation: &str) -> IdentityResult<Vec<u8>> {
    let Output {
        status,
        stdout,
        stderr,
    } = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            IdentityError::Configuration(format!("failed to execute {program} for {operation}: {e}"))
        })?;

    if !status.success() {
        return Err(IdentityError::Authentication(format!(
            "{operation} failed: {}",
            String::from_utf8_lossy(&stderr).trim()
        )));
    }
    Ok(stdout)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzureCliToken {
    access_token: String,
    #[serde(default, rename = "expires_on")]
    expires_on_epoch: Option<i64>,
    #[serde(default)]
    expires_on: Option<String>,
}

impl AzureCliToken {
    fn expires(&self) -> IdentityResult<DateTime<Utc>> {
        if let Some(epoch) = self.expires_on_epoch {
            return DateTime::from_timestamp(epoch, 0).ok_or_else(|| {
                IdentityError::Serialization(format!("invalid expires_on value {epoch}"))
            });
        }
        let raw = self.expires_on.as_deref().ok_or_else(|| {
            IdentityError::Serialization("Azure CLI token has no expiry".to_string())
        })?;
        let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f").map_err(|e| {
            IdentityError::Serialization(format!("invalid expiresOn value {raw}: {e}"))
        })?;
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|local| local.with_timezone(&Utc))
            .ok_or_else(|| IdentityError::Serialization(format!("invalid local time {raw}")))
    }
}

/// Token from `az account get-access-token`.
pub struct AzureCliCredential {
    program: String,
    tenant: String,
    cache: TokenSlot,
}

impl AzureCliCredential {
    pub fn new(program: impl Into<String>, tenant: impl Into<String>) -> IdentityResult<Self> {
        let tenant = tenant.into();
        if !tenant.is_empty() {
            check_argument("tenant", &tenant)?;
        }
        Ok(Self {
            program: program.into(),
            tenant,
            cache: TokenSlot::new(),
        })
    }

    fn arguments(&self, resource: &str) -> Vec<String> {
        let mut args: Vec<String> = ["account", "get-access-token", "--output", "json", "--resource"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.push(resource.to_string());
        if !self.tenant.is_empty() {
            args.push("--tenant".to_string());
            args.push(self.tenant.clone());
        }
        args
    }

    async fn acquire(&self, scopes: &[&str]) -> IdentityResult<AccessToken> {
        let resource = resource_from_scopes(scopes)?;
        check_argument("resource", &resource)?;
        let stdout = run(&self.program, &self.arguments(&resource), "Azure CLI token request").await?;
        let token: AzureCliToken = serde_json::from_slice(&stdout)?;
        let expires_on = token.expires()?;
        Ok(AccessToken::new(token.access_token, expires_on))
    }
}

#[async_trait]
impl TokenCredential for AzureCliCredential {
    async fn get_token(&self, scopes: &[&str]) -> IdentityResult<AccessToken> {
        self.cache
            .get_or_refresh(&scope_key(scopes), || self.acquire(scopes))
            .await
    }

    fn kind(&self) -> CredentialKind {
        CredentialKind::AzureCli
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PowerShellToken {
    token: String,
    expires_on: serde_json::Value,
}

impl PowerShellToken {
    fn expires(&self) -> IdentityResult<DateTime<Utc>> {
        let invalid =
            || IdentityError::Serialization(format!("invalid ExpiresOn value {}", self.expires_on));
        match &self.expires_on {
            serde_json::Value::String(raw) => {
                // Windows PowerShell serialises dates as "/Date(<millis>)/".
                if let Some(millis) = raw
                    .strip_prefix("/Date(")
                    .and_then(|rest| rest.strip_suffix(")/"))
                {
                    let millis: i64 = millis.parse().map_err(|_| invalid())?;
                    return DateTime::from_timestamp_millis(millis).ok_or_else(invalid);
                }
                DateTime::parse_from_rfc3339(raw)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|_| invalid())
            }
            serde_json::Value::Object(map) => map
                .get("UtcDateTime")
                .or_else(|| map.get("DateTime"))
                .and_then(|v| v.as_str())
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(invalid),
            _ => Err(invalid()),
        }
    }
}

/// Token from `Get-AzAccessToken` in the signed-in PowerShell context.
pub struct PowerShellCredential {
    program: String,
    tenant: String,
    cache: TokenSlot,
}

impl PowerShellCredential {
    pub fn new(program: impl Into<String>, tenant: impl Into<String>) -> IdentityResult<Self> {
        let tenant = tenant.into();
        if !tenant.is_empty() {
            check_argument("tenant", &tenant)?;
        }
        Ok(Self {
            program: program.into(),
            tenant,
            cache: TokenSlot::new(),
        })
    }

    fn arguments(&self, resource: &str) -> Vec<String> {
        let mut script = format!("Get-AzAccessToken -ResourceUrl '{resource}'");
        if !self.tenant.is_empty() {
            script.push_str(&format!(" -TenantId '{}'", self.tenant));
        }
        script.push_str(" | ConvertTo-Json");
        vec![
            "-NoProfile".to_string(),
            "-NonInteractive".to_string(),
            "-Command".to_string(),
            script,
        ]
    }

    async fn acquire(&self, scopes: &[&str]) -> IdentityResult<AccessToken> {
        let resource = resource_from_scopes(scopes)?;
        check_argument("resource", &resource)?;
        let stdout = run(&self.program, &self.arguments(&resource), "PowerShell token request").await?;
        let token: PowerShellToken = serde_json::from_slice(&stdout)?;
        let expires_on = token.expires()?;
        Ok(AccessToken::new(token.token, expires_on))
    }
}

#[async_trait]
impl TokenCredential for PowerShellCredential {
    async fn get_token(&self, scopes: &[&str]) -> IdentityResult<AccessToken> {
        self.cache
            .get_or_refresh(&scope_key(scopes), || self.acquire(scopes))
            .await
    }

    fn kind(&self) -> CredentialKind {
        CredentialKind::PowerShellContext
    }
}

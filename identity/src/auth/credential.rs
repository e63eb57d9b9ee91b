use super::types::{AccessToken, CredentialKind, DeviceCodeInfo};
use crate::error::{IdentityError, IdentityResult};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use std::sync::Arc;

/// Source of bearer tokens for a set of scopes.
///
/// Every authentication strategy implements this trait. Implementations are
/// expected to cache internally and only go to the network when the cached
/// token is inside the refresh window.
///
/// # Examples
///
/// ```no_run
/// use identity::auth::{AccessToken, CredentialKind, TokenCredential};
/// use identity::error::IdentityResult;
/// use async_trait::async_trait;
///
/// struct Fixed(AccessToken);
///
/// #[async_trait]
/// impl TokenCredential for Fixed {
///     async fn get_token(&self, _scopes: &[&str]) -> IdentityResult<AccessToken> {
///         Ok(self.0.clone())
///     }
///
///     fn kind(&self) -> CredentialKind {
///         CredentialKind::TokenStore
///     }
/// }
/// ```
#[async_trait]
pub trait TokenCredential: Send + Sync {
    /// Returns a token valid for `scopes`.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] if the provider rejects the request, the
    /// network is unreachable, or the credential is misconfigured.
    async fn get_token(&self, scopes: &[&str]) -> IdentityResult<AccessToken>;

    fn kind(&self) -> CredentialKind;
}

/// Callback invoked with the user code and verification URL of a device flow.
pub type DeviceCodePrompt = Arc<dyn Fn(&DeviceCodeInfo) + Send + Sync>;

/// Prompt that writes the provider's instructions to the log.
pub fn log_device_code_prompt() -> DeviceCodePrompt {
    Arc::new(|info: &DeviceCodeInfo| {
        log::info!("{}", info.message);
    })
}

/// Converts OAuth2 scopes to the v1 resource form used by IMDS and the CLIs.
pub fn resource_from_scopes(scopes: &[&str]) -> IdentityResult<String> {
    let [scope] = scopes else {
        return Err(IdentityError::Configuration(format!(
            "exactly one scope is required, got {}",
            scopes.len()
        )));
    };
    let resource = scope.strip_suffix("/.default").unwrap_or(scope);
    if resource.is_empty() {
        return Err(IdentityError::Configuration("scope is empty".to_string()));
    }
    Ok(resource.to_string())
}

/// Cache key for a scope set.
pub(crate) fn scope_key(scopes: &[&str]) -> String {
    scopes.join(" ")
}

pub(crate) fn authority_url(active_directory_endpoint: &str, tenant: &str) -> String {
    format!("{}/{}", active_directory_endpoint.trim_end_matches('/'), tenant)
}

pub(crate) fn token_url(active_directory_endpoint: &str, tenant: &str) -> String {
    format!(
        "{}/oauth2/v2.0/token",
        authority_url(active_directory_endpoint, tenant)
    )
}

pub(crate) fn device_code_url(active_directory_endpoint: &str, tenant: &str) -> String {
    format!(
        "{}/oauth2/v2.0/devicecode",
        authority_url(active_directory_endpoint, tenant)
    )
}

/// Successful body of the v2 token endpoint.
#[derive(Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[allow(dead_code)]
    #[serde(default)]
    pub token_type: String,
    pub expires_in: u64,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl TokenResponse {
    pub fn into_access_token(self) -> IdentityResult<(AccessToken, Option<String>)> {
        let seconds = i64::try_from(self.expires_in).map_err(|_| invalid_expiry(self.expires_in))?;
        let expires_on = expiry_after(seconds)?;
        Ok((
            AccessToken::new(self.access_token, expires_on),
            self.refresh_token,
        ))
    }
}

/// Absolute expiry `seconds` from now.
pub(crate) fn expiry_after(seconds: i64) -> IdentityResult<DateTime<Utc>> {
    TimeDelta::try_seconds(seconds)
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .ok_or_else(|| invalid_expiry(seconds))
}

fn invalid_expiry(seconds: impl std::fmt::Display) -> IdentityError {
    IdentityError::Serialization(format!("invalid expires_in value {seconds}"))
}

#[derive(Deserialize)]
pub(crate) struct ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl ErrorResponse {
    pub fn into_error(self) -> IdentityError {
        let description = self.error_description.as_deref().unwrap_or("");
        IdentityError::Authentication(format!("{} - {description}", self.error))
    }
}

/// Result of a token endpoint call that reached the provider.
pub(crate) enum TokenOutcome {
    Issued(TokenResponse),
    Rejected(ErrorResponse),
}

/// Posts a form to the token endpoint. OAuth2 error bodies come back as
/// [`TokenOutcome::Rejected`]; throttling and server errors as
/// [`IdentityError::Api`].
pub(crate) async fn post_token_form(
    http: &reqwest::Client,
    url: &str,
    params: &[(&str, &str)],
) -> IdentityResult<TokenOutcome> {
    let response = http
        .post(url)
        .form(params)
        .send()
        .await
        .map_err(|e| IdentityError::transport("token request", e))?;

    let status = response.status();
    if status.is_success() {
        let token = response.json::<TokenResponse>().await.map_err(|e| {
            IdentityError::Authentication(format!("Failed to parse token response: {e}"))
        })?;
        return Ok(TokenOutcome::Issued(token));
    }

    if status.is_server_error() || status.as_u16() == 429 {
        return Err(IdentityError::from_response(response, "token request").await);
    }

    let body = response
        .text()
        .await
        .map_err(|e| IdentityError::transport("token request", e))?;
    match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(error) => Ok(TokenOutcome::Rejected(error)),
        Err(_) => Err(IdentityError::Api {
            operation: "token request".to_string(),
            status: status.as_u16(),
            body,
        }),
    }
}

pub(crate) async fn request_token(
    http: &reqwest::Client,
    url: &str,
    params: &[(&str, &str)],
) -> IdentityResult<TokenResponse> {
    match post_token_form(http, url, params).await? {
        TokenOutcome::Issued(token) => Ok(token),
        TokenOutcome::Rejected(error) => Err(error.into_error()),
    }
}

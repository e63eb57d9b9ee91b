use super::credential::{
    DeviceCodePrompt, ErrorResponse, TokenCredential, TokenOutcome, device_code_url,
    post_token_form, request_token, scope_key, token_url,
};
use super::token_cache::TokenSlot;
use super::types::{AccessToken, CredentialKind, DeviceCodeInfo};
use crate::error::{IdentityError, IdentityResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use zeroize::Zeroizing;

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

#[derive(Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    expires_in: u64,
    #[serde(default = "default_poll_interval")]
    interval: u64,
    #[serde(default)]
    message: String,
}

fn default_poll_interval() -> u64 {
    5
}

/// Interactive device authorization flow for a public client.
///
/// The refresh token from the first login is kept and used for later
/// refreshes, so the user is only prompted again once it stops working.
pub struct DeviceCodeCredential {
    http: reqwest::Client,
    active_directory_endpoint: String,
    tenant: String,
    application_id: String,
    prompt: DeviceCodePrompt,
    refresh_token: Mutex<Option<Zeroizing<String>>>,
    cache: TokenSlot,
}

impl DeviceCodeCredential {
    pub fn new(
        http: reqwest::Client,
        active_directory_endpoint: impl Into<String>,
        tenant: impl Into<String>,
        application_id: impl Into<String>,
        prompt: DeviceCodePrompt,
    ) -> Self {
        Self {
            http,
            active_directory_endpoint: active_directory_endpoint.into(),
            tenant: tenant.into(),
            application_id: application_id.into(),
            prompt,
            refresh_token: Mutex::new(None),
            cache: TokenSlot::new(),
        }
    }

    fn requested_scope(scopes: &[&str]) -> String {
        let mut scope = scopes.join(" ");
        scope.push_str(" offline_access");
        scope
    }

    async fn acquire(&self, scopes: &[&str]) -> IdentityResult<AccessToken> {
        let stored = self.refresh_token.lock().await.clone();
        if let Some(refresh_token) = stored {
            match self.redeem_refresh_token(scopes, &refresh_token).await {
                Ok(token) => return Ok(token),
                Err(e) => {
                    log::warn!("Refresh token rejected, starting a new device code flow: {e}");
                }
            }
        }

        let info = self.start_device_code_flow(scopes).await?;
        (self.prompt)(&DeviceCodeInfo {
            user_code: info.user_code.clone(),
            verification_uri: info.verification_uri.clone(),
            message: info.message.clone(),
            expires_in: info.expires_in,
            interval: info.interval,
        });
        log::info!("Device code authentication initiated - awaiting user action");
        self.poll_device_code_token(&info).await
    }

    async fn redeem_refresh_token(
        &self,
        scopes: &[&str],
        refresh_token: &str,
    ) -> IdentityResult<AccessToken> {
        let scope = Self::requested_scope(scopes);
        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", self.application_id.as_str()),
            ("refresh_token", refresh_token),
            ("scope", scope.as_str()),
        ];
        let response = request_token(
            &self.http,
            &token_url(&self.active_directory_endpoint, &self.tenant),
            &params,
        )
        .await?;
        let (token, rotated) = response.into_access_token()?;
        if let Some(rotated) = rotated {
            *self.refresh_token.lock().await = Some(Zeroizing::new(rotated));
        }
        Ok(token)
    }

    async fn start_device_code_flow(&self, scopes: &[&str]) -> IdentityResult<DeviceCodeResponse> {
        let scope = Self::requested_scope(scopes);
        let params = [
            ("client_id", self.application_id.as_str()),
            ("scope", scope.as_str()),
        ];

        let response = self
            .http
            .post(device_code_url(&self.active_directory_endpoint, &self.tenant))
            .form(&params)
            .send()
            .await
            .map_err(|e| IdentityError::transport("device code request", e))?;

        if !response.status().is_success() {
            let error_info = response
                .json::<ErrorResponse>()
                .await
                .unwrap_or(ErrorResponse {
                    error: "unknown_error".to_string(),
                    error_description: Some("Failed to parse error response".to_string()),
                });

            let user_friendly_message = match error_info.error.as_str() {
                "invalid_client" => {
                    "Invalid client configuration. Check the application registration and ensure public client flows are allowed."
                }
                "invalid_request" => {
                    "Invalid authentication request. Check the application ID and tenant ID."
                }
                "unauthorized_client" => {
                    "This application is not authorized for the device code flow."
                }
                _ => error_info
                    .error_description
                    .as_deref()
                    .unwrap_or(&error_info.error),
            };

            return Err(IdentityError::Authentication(user_friendly_message.to_string()));
        }

        response.json().await.map_err(|e| {
            IdentityError::Authentication(format!("Failed to parse device code response: {e}"))
        })
    }

    async fn poll_device_code_token(&self, info: &DeviceCodeResponse) -> IdentityResult<AccessToken> {
        let url = token_url(&self.active_directory_endpoint, &self.tenant);
        let mut interval = Duration::from_secs(info.interval);
        let timeout = Duration::from_secs(info.expires_in);
        let start = Instant::now();

        loop {
            if start.elapsed() > timeout {
                return Err(IdentityError::Authentication(
                    "The device code has expired. Please restart the login.".to_string(),
                ));
            }

            tokio::time::sleep(interval).await;

            let params = [
                ("grant_type", DEVICE_CODE_GRANT),
                ("client_id", self.application_id.as_str()),
                ("device_code", info.device_code.as_str()),
            ];

            let error = match post_token_form(&self.http, &url, &params).await? {
                TokenOutcome::Issued(response) => {
                    let (token, refresh_token) = response.into_access_token()?;
                    *self.refresh_token.lock().await = refresh_token.map(Zeroizing::new);
                    return Ok(token);
                }
                TokenOutcome::Rejected(error) => error,
            };

            let code = error.error.clone();
            match code.as_str() {
                "authorization_pending" => {
                    log::debug!("Waiting for user to complete authentication");
                }
                "slow_down" => {
                    log::debug!("Polling too frequently, increasing interval");
                    interval += Duration::from_secs(5);
                }
                "expired_token" => {
                    return Err(IdentityError::Authentication(
                        "The device code has expired. Please restart the login.".to_string(),
                    ));
                }
                "access_denied" => {
                    return Err(IdentityError::Authentication(
                        "Access was denied by the user.".to_string(),
                    ));
                }
                _ => return Err(error.into_error()),
            }
        }
    }
}

#[async_trait]
impl TokenCredential for DeviceCodeCredential {
    async fn get_token(&self, scopes: &[&str]) -> IdentityResult<AccessToken> {
        self.cache
            .get_or_refresh(&scope_key(scopes), || self.acquire(scopes))
            .await
    }

    fn kind(&self) -> CredentialKind {
        CredentialKind::DeviceCode
    }
}

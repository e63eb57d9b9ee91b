use super::credential::{TokenCredential, expiry_after, resource_from_scopes, scope_key};
use super::token_cache::TokenSlot;
use super::types::{AccessToken, CredentialKind, IdentityInfo};
use crate::error::{IdentityError, IdentityResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use url::Url;

const IMDS_API_VERSION: &str = "2018-02-01";

#[derive(Deserialize)]
struct ImdsTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_on: Option<serde_json::Value>,
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

fn as_seconds(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl ImdsTokenResponse {
    fn expires(&self) -> IdentityResult<DateTime<Utc>> {
        if let Some(expires_on) = self.expires_on.as_ref().and_then(as_seconds) {
            return DateTime::from_timestamp(expires_on, 0).ok_or_else(|| {
                IdentityError::Serialization(format!("invalid expires_on value {expires_on}"))
            });
        }
        if let Some(expires_in) = self.expires_in.as_ref().and_then(as_seconds) {
            return expiry_after(expires_in);
        }
        Err(IdentityError::Serialization(
            "IMDS token response has no expiry".to_string(),
        ))
    }
}

/// Token from the instance metadata service of the hosting VM or service.
pub struct ManagedIdentityCredential {
    http: reqwest::Client,
    endpoint: Url,
    identity: IdentityInfo,
    cache: TokenSlot,
}

impl ManagedIdentityCredential {
    pub fn new(
        http: reqwest::Client,
        imds_endpoint: &str,
        identity: IdentityInfo,
    ) -> IdentityResult<Self> {
        identity.validate()?;
        if !identity.object_id.is_empty() {
            return Err(IdentityError::Configuration(
                "object ID is deprecated and no longer supported for managed identity. Please use client ID or resource ID instead".to_string(),
            ));
        }
        Ok(Self {
            http,
            endpoint: Url::parse(imds_endpoint)?,
            identity,
            cache: TokenSlot::new(),
        })
    }

    fn token_url(&self, resource: &str) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("api-version", IMDS_API_VERSION);
            query.append_pair("resource", resource);
            if !self.identity.client_id.is_empty() {
                query.append_pair("client_id", &self.identity.client_id);
            } else if !self.identity.msi_res_id.is_empty() {
                query.append_pair("msi_res_id", &self.identity.msi_res_id);
            }
        }
        url
    }

    async fn acquire(&self, scopes: &[&str]) -> IdentityResult<AccessToken> {
        let resource = resource_from_scopes(scopes)?;
        let response = self
            .http
            .get(self.token_url(&resource))
            .header("Metadata", "true")
            .send()
            .await
            .map_err(|e| IdentityError::transport("managed identity token request", e))?;

        if !response.status().is_success() {
            return Err(IdentityError::from_response(response, "managed identity token request").await);
        }

        let body: ImdsTokenResponse = response
            .json()
            .await
            .map_err(|e| IdentityError::Serialization(format!("invalid IMDS token response: {e}")))?;
        let expires_on = body.expires()?;
        Ok(AccessToken::new(body.access_token, expires_on))
    }
}

#[async_trait]
impl TokenCredential for ManagedIdentityCredential {
    async fn get_token(&self, scopes: &[&str]) -> IdentityResult<AccessToken> {
        self.cache
            .get_or_refresh(&scope_key(scopes), || self.acquire(scopes))
            .await
    }

    fn kind(&self) -> CredentialKind {
        CredentialKind::ManagedIdentity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IMDS: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

    #[test]
    fn object_id_is_rejected() {
        let err = ManagedIdentityCredential::new(
            reqwest::Client::new(),
            IMDS,
            IdentityInfo::with_object_id("oid"),
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("object ID is deprecated"));
    }

    #[test]
    fn selector_is_added_to_the_query() {
        let credential = ManagedIdentityCredential::new(
            reqwest::Client::new(),
            IMDS,
            IdentityInfo::with_resource_id("/subscriptions/s/identities/id"),
        )
        .unwrap();
        let url = credential.token_url("https://storage.azure.com");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("api-version".to_string(), "2018-02-01".to_string())));
        assert!(pairs.contains(&(
            "msi_res_id".to_string(),
            "/subscriptions/s/identities/id".to_string()
        )));
        assert!(!pairs.iter().any(|(k, _)| k == "client_id"));
    }

    #[test]
    fn expiry_accepts_string_epoch() {
        let body: ImdsTokenResponse =
            serde_json::from_str(r#"{"access_token":"t","expires_on":"1700000000"}"#).unwrap();
        assert_eq!(body.expires().unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn huge_expires_in_is_rejected() {
        let body: ImdsTokenResponse = serde_json::from_str(&format!(
            r#"{{"access_token":"t","expires_in":"{}"}}"#,
            i64::MAX
        ))
        .unwrap();
        assert!(matches!(body.expires(), Err(IdentityError::Serialization(_))));
    }
}

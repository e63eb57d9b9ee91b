//! Service principal credentials: client secret and client certificate.

use super::credential::{TokenCredential, request_token, scope_key, token_url};
use super::token_cache::TokenSlot;
use super::types::{AccessToken, CredentialKind};
use crate::error::{IdentityError, IdentityResult};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use pkcs8::LineEnding;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use zeroize::Zeroizing;

const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 600;

pub struct ClientSecretCredential {
    http: reqwest::Client,
    active_directory_endpoint: String,
    tenant: String,
    application_id: String,
    secret: Zeroizing<String>,
    cache: TokenSlot,
}

impl ClientSecretCredential {
    pub fn new(
        http: reqwest::Client,
        active_directory_endpoint: impl Into<String>,
        tenant: impl Into<String>,
        application_id: impl Into<String>,
        secret: Zeroizing<String>,
    ) -> IdentityResult<Self> {
        let application_id = application_id.into();
        if application_id.is_empty() {
            return Err(IdentityError::Configuration(
                "application ID is required for service principal login".to_string(),
            ));
        }
        Ok(Self {
            http,
            active_directory_endpoint: active_directory_endpoint.into(),
            tenant: tenant.into(),
            application_id,
            secret,
            cache: TokenSlot::new(),
        })
    }

    async fn acquire(&self, scopes: &[&str]) -> IdentityResult<AccessToken> {
        let scope = scopes.join(" ");
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.application_id.as_str()),
            ("client_secret", self.secret.as_str()),
            ("scope", scope.as_str()),
        ];
        let url = token_url(&self.active_directory_endpoint, &self.tenant);
        let (token, _) = request_token(&self.http, &url, &params)
            .await?
            .into_access_token()?;
        log::debug!("Acquired client secret token for {}", self.application_id);
        Ok(token)
    }
}

impl fmt::Debug for ClientSecretCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSecretCredential")
            .field("tenant", &self.tenant)
            .field("application_id", &self.application_id)
            .field("secret", &"[redacted]")
            .finish()
    }
}

#[async_trait]
impl TokenCredential for ClientSecretCredential {
    async fn get_token(&self, scopes: &[&str]) -> IdentityResult<AccessToken> {
        self.cache
            .get_or_refresh(&scope_key(scopes), || self.acquire(scopes))
            .await
    }

    fn kind(&self) -> CredentialKind {
        CredentialKind::ClientSecret
    }
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    aud: &'a str,
    exp: i64,
    iat: i64,
    iss: &'a str,
    jti: String,
    nbf: i64,
    sub: &'a str,
}

/// Signing material read from a PEM bundle.
struct CertificateKey {
    key: EncodingKey,
    thumbprint: String,
}

impl CertificateKey {
    fn from_pem(contents: &str, password: &str) -> IdentityResult<Self> {
        let blocks = pem::parse_many(contents)
            .map_err(|e| IdentityError::Configuration(format!("failed to parse certificate: {e}")))?;

        let certificate = blocks
            .iter()
            .find(|block| block.tag() == "CERTIFICATE")
            .ok_or_else(|| {
                IdentityError::Configuration("no certificate found in PEM file".to_string())
            })?;
        let thumbprint = URL_SAFE_NO_PAD.encode(Sha256::digest(certificate.contents()));

        let private_key = blocks
            .iter()
            .find(|block| block.tag().ends_with("PRIVATE KEY"))
            .ok_or_else(|| {
                IdentityError::Configuration("no private key found in PEM file".to_string())
            })?;

        let key = match private_key.tag() {
            "RSA PRIVATE KEY" | "PRIVATE KEY" => {
                EncodingKey::from_rsa_pem(pem::encode(private_key).as_bytes())
            }
            "ENCRYPTED PRIVATE KEY" => {
                let decrypted = decrypt_private_key(private_key.contents(), password)?;
                EncodingKey::from_rsa_pem(decrypted.as_bytes())
            }
            other => {
                return Err(IdentityError::Configuration(format!(
                    "unsupported private key type {other}"
                )));
            }
        }
        .map_err(|e| IdentityError::Configuration(format!("failed to parse private key: {e}")))?;

        Ok(Self { key, thumbprint })
    }
}

fn decrypt_private_key(der: &[u8], password: &str) -> IdentityResult<Zeroizing<String>> {
    if password.is_empty() {
        return Err(IdentityError::Configuration(
            "private key is encrypted but no certificate password was provided".to_string(),
        ));
    }
    let encrypted = pkcs8::EncryptedPrivateKeyInfo::try_from(der).map_err(|e| {
        IdentityError::Configuration(format!("failed to parse encrypted private key: {e}"))
    })?;
    let document = encrypted.decrypt(password.as_bytes()).map_err(|e| {
        IdentityError::Configuration(format!("failed to decrypt private key: {e}"))
    })?;
    document
        .to_pem("PRIVATE KEY", LineEnding::LF)
        .map_err(|e| IdentityError::Configuration(format!("failed to encode private key: {e}")))
}

/// Client credentials grant authenticated with an RS256 JWT assertion
/// signed by the service principal's certificate.
pub struct ClientCertificateCredential {
    http: reqwest::Client,
    active_directory_endpoint: String,
    tenant: String,
    application_id: String,
    certificate: CertificateKey,
    cache: TokenSlot,
}

impl ClientCertificateCredential {
    /// Loads and parses the PEM bundle at `cert_path`. `password` decrypts
    /// an encrypted PKCS#8 key and is ignored otherwise.
    pub fn from_file(
        http: reqwest::Client,
        active_directory_endpoint: impl Into<String>,
        tenant: impl Into<String>,
        application_id: impl Into<String>,
        cert_path: impl AsRef<Path>,
        password: &str,
    ) -> IdentityResult<Self> {
        let cert_path = cert_path.as_ref();
        let contents = std::fs::read_to_string(cert_path).map_err(|e| {
            IdentityError::Configuration(format!(
                "failed to read certificate file {}: {e}",
                cert_path.display()
            ))
        })?;
        Self::from_pem(
            http,
            active_directory_endpoint,
            tenant,
            application_id,
            &contents,
            password,
        )
    }

    pub fn from_pem(
        http: reqwest::Client,
        active_directory_endpoint: impl Into<String>,
        tenant: impl Into<String>,
        application_id: impl Into<String>,
        contents: &str,
        password: &str,
    ) -> IdentityResult<Self> {
        let application_id = application_id.into();
        if application_id.is_empty() {
            return Err(IdentityError::Configuration(
                "application ID is required for service principal login".to_string(),
            ));
        }
        let certificate = CertificateKey::from_pem(contents, password)?;
        Ok(Self {
            http,
            active_directory_endpoint: active_directory_endpoint.into(),
            tenant: tenant.into(),
            application_id,
            certificate,
            cache: TokenSlot::new(),
        })
    }

    pub fn thumbprint(&self) -> &str {
        &self.certificate.thumbprint
    }

    fn create_assertion(&self, audience: &str) -> IdentityResult<String> {
        let mut header = Header::new(Algorithm::RS256);
        header.x5t_s256 = Some(self.certificate.thumbprint.clone());

        let now = Utc::now().timestamp();
        let claims = AssertionClaims {
            aud: audience,
            exp: now + ASSERTION_LIFETIME_SECS,
            iat: now,
            iss: &self.application_id,
            jti: uuid::Uuid::new_v4().to_string(),
            nbf: now,
            sub: &self.application_id,
        };

        encode(&header, &claims, &self.certificate.key).map_err(|e| {
            IdentityError::Configuration(format!("failed to sign client assertion: {e}"))
        })
    }

    async fn acquire(&self, scopes: &[&str]) -> IdentityResult<AccessToken> {
        let url = token_url(&self.active_directory_endpoint, &self.tenant);
        let assertion = self.create_assertion(&url)?;
        let scope = scopes.join(" ");
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.application_id.as_str()),
            ("client_assertion_type", CLIENT_ASSERTION_TYPE),
            ("client_assertion", assertion.as_str()),
            ("scope", scope.as_str()),
        ];
        let (token, _) = request_token(&self.http, &url, &params)
            .await?
            .into_access_token()?;
        log::debug!("Acquired client certificate token for {}", self.application_id);
        Ok(token)
    }
}

impl fmt::Debug for ClientCertificateCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCertificateCredential")
            .field("tenant", &self.tenant)
            .field("application_id", &self.application_id)
            .field("thumbprint", &self.certificate.thumbprint)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenCredential for ClientCertificateCredential {
    async fn get_token(&self, scopes: &[&str]) -> IdentityResult<AccessToken> {
        self.cache
            .get_or_refresh(&scope_key(scopes), || self.acquire(scopes))
            .await
    }

    fn kind(&self) -> CredentialKind {
        CredentialKind::ClientCertificate
    }
}

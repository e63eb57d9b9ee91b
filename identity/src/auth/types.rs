use super::credential::TokenCredential;
use crate::error::{IdentityError, IdentityResult};
use chrono::{DateTime, TimeDelta, Utc};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Tokens closer than this to expiry are refreshed instead of served.
pub const MINIMUM_TOKEN_VALID_DURATION: TimeDelta = TimeDelta::minutes(5);

/// Refresh source marking a token supplied out-of-band by a parent integration.
pub const TOKEN_REFRESH_SOURCE_TOKEN_STORE: &str = "tokenstore";

/// A bearer token together with its absolute expiry.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_on: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_on,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_on
    }

    /// True once the token is inside the five minute refresh window.
    pub fn needs_refresh(&self) -> bool {
        self.expires_on - Utc::now() <= MINIMUM_TOKEN_VALID_DURATION
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"[redacted]")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// Which concrete credential a descriptor resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    TokenStore,
    ManagedIdentity,
    ClientCertificate,
    ClientSecret,
    AzureCli,
    PowerShellContext,
    DeviceCode,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CredentialKind::TokenStore => "token store",
            CredentialKind::ManagedIdentity => "managed identity",
            CredentialKind::ClientCertificate => "client certificate",
            CredentialKind::ClientSecret => "client secret",
            CredentialKind::AzureCli => "Azure CLI",
            CredentialKind::PowerShellContext => "PowerShell context",
            CredentialKind::DeviceCode => "device code",
        };
        f.write_str(name)
    }
}

/// Managed identity selector. At most one field may be set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityInfo {
    #[serde(rename = "_identity_client_id", default)]
    pub client_id: String,
    /// No longer accepted by the provider; rejected when resolving.
    #[serde(rename = "_identity_object_id", default)]
    pub object_id: String,
    #[serde(rename = "_identity_msi_res_id", default)]
    pub msi_res_id: String,
}

impl IdentityInfo {
    pub fn with_client_id(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    pub fn with_resource_id(msi_res_id: impl Into<String>) -> Self {
        Self {
            msi_res_id: msi_res_id.into(),
            ..Self::default()
        }
    }

    pub fn with_object_id(object_id: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> IdentityResult<()> {
        let selected = [&self.client_id, &self.object_id, &self.msi_res_id]
            .iter()
            .filter(|value| !value.is_empty())
            .count();
        if selected > 1 {
            return Err(IdentityError::Configuration(
                "client ID, object ID and MSI resource ID are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Service principal secrets. `secret` doubles as the certificate passphrase
/// when `cert_path` is set.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SpnInfo {
    #[serde(rename = "_spn_secret", default)]
    pub secret: String,
    #[serde(rename = "_spn_cert_path", default)]
    pub cert_path: String,
}

impl fmt::Debug for SpnInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpnInfo")
            .field("secret", &"[redacted]")
            .field("cert_path", &self.cert_path)
            .finish()
    }
}

/// Serialised credential description, as carried by the environment-injected
/// payload.
///
/// The flag fields select a strategy through [`TokenInfo::descriptor`]. Once a
/// credential has been built for this value it is memoised, so resolving the
/// same `TokenInfo` twice yields the same credential instance.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct TokenInfo {
    #[serde(default)]
    pub access_token: String,
    #[serde(
        default,
        serialize_with = "serialize_expires_on",
        deserialize_with = "deserialize_expires_on",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_on: Option<i64>,
    #[serde(rename = "_tenant", default)]
    pub tenant: String,
    #[serde(rename = "_ad_endpoint", default)]
    pub active_directory_endpoint: String,
    #[serde(rename = "_token_refresh_source", default)]
    pub token_refresh_source: String,
    #[serde(rename = "_application_id", default)]
    pub application_id: String,
    #[serde(rename = "_identity", default)]
    pub identity: bool,
    #[serde(rename = "IdentityInfo", default)]
    pub identity_info: IdentityInfo,
    #[serde(rename = "_spn", default)]
    pub service_principal_name: bool,
    #[serde(rename = "SPNInfo", default)]
    pub spn_info: SpnInfo,
    #[serde(rename = "AzCLICred", default)]
    pub azure_cli_cred: bool,
    #[serde(rename = "PSCred", default)]
    pub powershell_cred: bool,
    #[serde(rename = "_client_id", default)]
    pub client_id: String,
    #[serde(skip)]
    pub(crate) credential: OnceCell<Arc<dyn TokenCredential>>,
}

fn serialize_expires_on<S: Serializer>(value: &Option<i64>, s: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(secs) => s.serialize_i64(*secs),
        None => s.serialize_none(),
    }
}

/// Accepts a JSON number or a numeric string. Anything unparseable is treated
/// as missing, which [`TokenInfo::expires`] maps to an already expired time.
fn deserialize_expires_on<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(d)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Some(serde_json::Value::String(s)) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f.trunc() as i64))
        }
        _ => None,
    })
}

impl TokenInfo {
    pub fn from_json(raw: &str) -> IdentityResult<Self> {
        serde_json::from_str(raw).map_err(Into::into)
    }

    pub fn to_json(&self) -> IdentityResult<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// Absolute expiry. A missing or malformed value counts as one hour ago.
    pub fn expires(&self) -> DateTime<Utc> {
        let secs = self.expires_on.unwrap_or(-3600);
        DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
    }

    pub fn is_token_store(&self) -> bool {
        self.token_refresh_source == TOKEN_REFRESH_SOURCE_TOKEN_STORE
    }

    /// Picks exactly one strategy, in fixed priority order.
    pub fn descriptor(&self) -> CredentialDescriptor {
        if self.is_token_store() {
            return CredentialDescriptor::TokenStore {
                access_token: Zeroizing::new(self.access_token.clone()),
                expires_on: self.expires(),
            };
        }

        if self.identity {
            return CredentialDescriptor::ManagedIdentity(self.identity_info.clone());
        }

        if self.service_principal_name {
            if !self.spn_info.cert_path.is_empty() {
                return CredentialDescriptor::ServicePrincipalCertificate {
                    tenant: self.tenant.clone(),
                    authority: self.active_directory_endpoint.clone(),
                    application_id: self.application_id.clone(),
                    cert_path: self.spn_info.cert_path.clone(),
                    cert_password: Zeroizing::new(self.spn_info.secret.clone()),
                };
            }
            return CredentialDescriptor::ServicePrincipalSecret {
                tenant: self.tenant.clone(),
                authority: self.active_directory_endpoint.clone(),
                application_id: self.application_id.clone(),
                secret: Zeroizing::new(self.spn_info.secret.clone()),
            };
        }

        if self.azure_cli_cred {
            return CredentialDescriptor::AzureCli {
                tenant: self.tenant.clone(),
            };
        }

        if self.powershell_cred {
            return CredentialDescriptor::PowerShellContext {
                tenant: self.tenant.clone(),
            };
        }

        CredentialDescriptor::DeviceCode {
            tenant: self.tenant.clone(),
            authority: self.active_directory_endpoint.clone(),
            application_id: self.application_id.clone(),
        }
    }

    /// The credential memoised on this value, if it was resolved before.
    pub fn cached_credential(&self) -> Option<Arc<dyn TokenCredential>> {
        self.credential.get().cloned()
    }
}

impl PartialEq for TokenInfo {
    fn eq(&self, other: &Self) -> bool {
        self.access_token == other.access_token
            && self.expires_on == other.expires_on
            && self.tenant == other.tenant
            && self.active_directory_endpoint == other.active_directory_endpoint
            && self.token_refresh_source == other.token_refresh_source
            && self.application_id == other.application_id
            && self.identity == other.identity
            && self.identity_info == other.identity_info
            && self.service_principal_name == other.service_principal_name
            && self.spn_info == other.spn_info
            && self.azure_cli_cred == other.azure_cli_cred
            && self.powershell_cred == other.powershell_cred
            && self.client_id == other.client_id
    }
}

impl fmt::Debug for TokenInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenInfo")
            .field("access_token", &"[redacted]")
            .field("expires_on", &self.expires_on)
            .field("tenant", &self.tenant)
            .field("active_directory_endpoint", &self.active_directory_endpoint)
            .field("token_refresh_source", &self.token_refresh_source)
            .field("application_id", &self.application_id)
            .field("identity", &self.identity)
            .field("identity_info", &self.identity_info)
            .field("service_principal_name", &self.service_principal_name)
            .field("spn_info", &self.spn_info)
            .field("azure_cli_cred", &self.azure_cli_cred)
            .field("powershell_cred", &self.powershell_cred)
            .field("client_id", &self.client_id)
            .field("resolved", &self.credential.get().is_some())
            .finish()
    }
}

/// One authentication strategy and the parameters it needs.
#[derive(Clone)]
pub enum CredentialDescriptor {
    TokenStore {
        access_token: Zeroizing<String>,
        expires_on: DateTime<Utc>,
    },
    ManagedIdentity(IdentityInfo),
    ServicePrincipalCertificate {
        tenant: String,
        authority: String,
        application_id: String,
        cert_path: String,
        cert_password: Zeroizing<String>,
    },
    ServicePrincipalSecret {
        tenant: String,
        authority: String,
        application_id: String,
        secret: Zeroizing<String>,
    },
    AzureCli {
        tenant: String,
    },
    PowerShellContext {
        tenant: String,
    },
    DeviceCode {
        tenant: String,
        authority: String,
        application_id: String,
    },
}

impl CredentialDescriptor {
    pub fn kind(&self) -> CredentialKind {
        match self {
            CredentialDescriptor::TokenStore { .. } => CredentialKind::TokenStore,
            CredentialDescriptor::ManagedIdentity(_) => CredentialKind::ManagedIdentity,
            CredentialDescriptor::ServicePrincipalCertificate { .. } => {
                CredentialKind::ClientCertificate
            }
            CredentialDescriptor::ServicePrincipalSecret { .. } => CredentialKind::ClientSecret,
            CredentialDescriptor::AzureCli { .. } => CredentialKind::AzureCli,
            CredentialDescriptor::PowerShellContext { .. } => CredentialKind::PowerShellContext,
            CredentialDescriptor::DeviceCode { .. } => CredentialKind::DeviceCode,
        }
    }
}

impl fmt::Debug for CredentialDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialDescriptor::TokenStore { expires_on, .. } => f
                .debug_struct("TokenStore")
                .field("expires_on", expires_on)
                .finish_non_exhaustive(),
            CredentialDescriptor::ManagedIdentity(info) => {
                f.debug_tuple("ManagedIdentity").field(info).finish()
            }
            CredentialDescriptor::ServicePrincipalCertificate {
                tenant,
                application_id,
                cert_path,
                ..
            } => f
                .debug_struct("ServicePrincipalCertificate")
                .field("tenant", tenant)
                .field("application_id", application_id)
                .field("cert_path", cert_path)
                .finish_non_exhaustive(),
            CredentialDescriptor::ServicePrincipalSecret {
                tenant,
                application_id,
                ..
            } => f
                .debug_struct("ServicePrincipalSecret")
                .field("tenant", tenant)
                .field("application_id", application_id)
                .finish_non_exhaustive(),
            CredentialDescriptor::AzureCli { tenant } => {
                f.debug_struct("AzureCli").field("tenant", tenant).finish()
            }
            CredentialDescriptor::PowerShellContext { tenant } => f
                .debug_struct("PowerShellContext")
                .field("tenant", tenant)
                .finish(),
            CredentialDescriptor::DeviceCode {
                tenant,
                application_id,
                ..
            } => f
                .debug_struct("DeviceCode")
                .field("tenant", tenant)
                .field("application_id", application_id)
                .finish_non_exhaustive(),
        }
    }
}

/// Information the user needs to complete a device code login.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceCodeInfo {
    /// The user code to be entered on the verification page
    pub user_code: String,
    /// The URL where the user should enter the code
    pub verification_uri: String,
    /// Human-readable message with authentication instructions
    pub message: String,
    pub expires_in: u64,
    pub interval: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn refresh_window_is_five_minutes() {
        let fresh = AccessToken::new("t", Utc::now() + TimeDelta::minutes(30));
        assert!(!fresh.needs_refresh());
        assert!(!fresh.is_expired());

        let stale = AccessToken::new("t", Utc::now() + TimeDelta::minutes(4));
        assert!(stale.needs_refresh());
        assert!(!stale.is_expired());

        let expired = AccessToken::new("t", Utc::now() - TimeDelta::seconds(1));
        assert!(expired.needs_refresh());
        assert!(expired.is_expired());
    }

    #[test]
    fn debug_output_never_contains_secrets() {
        let info = TokenInfo {
            access_token: "super-secret-token".to_string(),
            spn_info: SpnInfo {
                secret: "hunter2".to_string(),
                cert_path: String::new(),
            },
            ..TokenInfo::default()
        };
        let rendered = format!("{info:?} {:?}", info.descriptor());
        assert!(!rendered.contains("super-secret-token"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn expires_on_accepts_numbers_and_strings() {
        let numeric = TokenInfo::from_json(r#"{"expires_on": 1700000000}"#).unwrap();
        assert_eq!(numeric.expires_on, Some(1_700_000_000));

        let string = TokenInfo::from_json(r#"{"expires_on": "1700000000"}"#).unwrap();
        assert_eq!(string.expires_on, Some(1_700_000_000));

        let float = TokenInfo::from_json(r#"{"expires_on": 1700000000.75}"#).unwrap();
        assert_eq!(float.expires_on, Some(1_700_000_000));
    }

    #[test]
    fn malformed_expiry_is_already_expired() {
        let info = TokenInfo::from_json(r#"{"expires_on": "soon"}"#).unwrap();
        assert_eq!(info.expires_on, None);
        assert!(info.expires() < Utc::now());
        assert_eq!(info.expires().timestamp(), -3600);
    }

    #[test]
    fn identity_selectors_are_mutually_exclusive() {
        assert!(IdentityInfo::default().validate().is_ok());
        assert!(IdentityInfo::with_client_id("c").validate().is_ok());
        assert!(IdentityInfo::with_resource_id("r").validate().is_ok());
        assert!(IdentityInfo::with_object_id("o").validate().is_ok());

        let both = IdentityInfo {
            client_id: "c".to_string(),
            msi_res_id: "r".to_string(),
            ..IdentityInfo::default()
        };
        let err = both.validate().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    #[test]
    fn token_store_wins_over_every_other_flag() {
        let info = TokenInfo {
            token_refresh_source: TOKEN_REFRESH_SOURCE_TOKEN_STORE.to_string(),
            identity: true,
            service_principal_name: true,
            azure_cli_cred: true,
            powershell_cred: true,
            ..TokenInfo::default()
        };
        assert_eq!(info.descriptor().kind(), CredentialKind::TokenStore);
    }

    #[test]
    fn certificate_takes_precedence_over_secret() {
        let info = TokenInfo {
            service_principal_name: true,
            spn_info: SpnInfo {
                secret: "pass".to_string(),
                cert_path: "/tmp/cert.pem".to_string(),
            },
            ..TokenInfo::default()
        };
        assert_eq!(info.descriptor().kind(), CredentialKind::ClientCertificate);

        let secret_only = TokenInfo {
            service_principal_name: true,
            spn_info: SpnInfo {
                secret: "pass".to_string(),
                cert_path: String::new(),
            },
            ..TokenInfo::default()
        };
        assert_eq!(secret_only.descriptor().kind(), CredentialKind::ClientSecret);
    }

    #[test]
    fn device_code_is_the_fallback() {
        assert_eq!(
            TokenInfo::default().descriptor().kind(),
            CredentialKind::DeviceCode
        );
    }
}

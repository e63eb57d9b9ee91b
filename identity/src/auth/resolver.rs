use super::cli_credential::{AzureCliCredential, PowerShellCredential};
use super::credential::{DeviceCodePrompt, TokenCredential, log_device_code_prompt};
use super::device_code::DeviceCodeCredential;
use super::managed_identity::ManagedIdentityCredential;
use super::service_principal::{ClientCertificateCredential, ClientSecretCredential};
use super::token_cache::SharedTokenHandle;
use super::types::{CredentialDescriptor, TokenInfo};
use crate::config::IdentityConfig;
use crate::error::IdentityResult;
use std::sync::Arc;

/// Turns a [`TokenInfo`] into a live credential.
///
/// All credentials built by one resolver share its HTTP client. The
/// token-store strategy always returns the instance owned by the resolver's
/// [`SharedTokenHandle`].
#[derive(Clone)]
pub struct CredentialResolver {
    http: reqwest::Client,
    config: IdentityConfig,
    shared: SharedTokenHandle,
    prompt: DeviceCodePrompt,
}

impl CredentialResolver {
    pub fn new(http: reqwest::Client, config: IdentityConfig, shared: SharedTokenHandle) -> Self {
        Self {
            http,
            config,
            shared,
            prompt: log_device_code_prompt(),
        }
    }

    /// Builds the HTTP client from `config` and uses a token handle without a
    /// backing store.
    pub fn from_config(config: IdentityConfig) -> IdentityResult<Self> {
        let http = config.build_http_client()?;
        Ok(Self::new(http, config, SharedTokenHandle::default()))
    }

    pub fn with_prompt(mut self, prompt: DeviceCodePrompt) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn config(&self) -> &IdentityConfig {
        &self.config
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn shared_token(&self) -> &SharedTokenHandle {
        &self.shared
    }

    /// Returns the credential memoised on `info`, building it on first use.
    pub fn resolve(&self, info: &TokenInfo) -> IdentityResult<Arc<dyn TokenCredential>> {
        info.credential
            .get_or_try_init(|| self.build(info))
            .cloned()
    }

    fn build(&self, info: &TokenInfo) -> IdentityResult<Arc<dyn TokenCredential>> {
        let descriptor = info.descriptor();
        log::debug!("Resolving {} credential", descriptor.kind());

        let credential: Arc<dyn TokenCredential> = match descriptor {
            CredentialDescriptor::TokenStore {
                access_token,
                expires_on,
            } => self.shared.get_or_init(&access_token, expires_on),
            CredentialDescriptor::ManagedIdentity(identity) => Arc::new(
                ManagedIdentityCredential::new(self.http.clone(), &self.config.imds_endpoint, identity)?,
            ),
            CredentialDescriptor::ServicePrincipalCertificate {
                tenant,
                authority,
                application_id,
                cert_path,
                cert_password,
            } => Arc::new(ClientCertificateCredential::from_file(
                self.http.clone(),
                self.or_default_authority(authority),
                self.or_default_tenant(tenant),
                application_id,
                cert_path,
                &cert_password,
            )?),
            CredentialDescriptor::ServicePrincipalSecret {
                tenant,
                authority,
                application_id,
                secret,
            } => Arc::new(ClientSecretCredential::new(
                self.http.clone(),
                self.or_default_authority(authority),
                self.or_default_tenant(tenant),
                application_id,
                secret,
            )?),
            CredentialDescriptor::AzureCli { tenant } => Arc::new(AzureCliCredential::new(
                self.config.azure_cli_path.clone(),
                tenant,
            )?),
            CredentialDescriptor::PowerShellContext { tenant } => Arc::new(
                PowerShellCredential::new(self.config.powershell_path.clone(), tenant)?,
            ),
            CredentialDescriptor::DeviceCode {
                tenant,
                authority,
                application_id,
            } => {
                let application_id = if application_id.is_empty() {
                    self.config.application_id.clone()
                } else {
                    application_id
                };
                Arc::new(DeviceCodeCredential::new(
                    self.http.clone(),
                    self.or_default_authority(authority),
                    self.or_default_tenant(tenant),
                    application_id,
                    self.prompt.clone(),
                ))
            }
        };
        Ok(credential)
    }

    fn or_default_tenant(&self, tenant: String) -> String {
        if tenant.is_empty() {
            self.config.tenant_id.clone()
        } else {
            tenant
        }
    }

    fn or_default_authority(&self, authority: String) -> String {
        if authority.is_empty() {
            self.config.active_directory_endpoint.clone()
        } else {
            authority
        }
    }
}

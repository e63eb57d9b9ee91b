use super::credential::TokenCredential;
use super::resolver::CredentialResolver;
use super::types::{IdentityInfo, SpnInfo, TOKEN_REFRESH_SOURCE_TOKEN_STORE, TokenInfo};
use crate::config::DEFAULT_TENANT_ID;
use crate::error::{IdentityError, IdentityResult};
use crate::utils::EnvUtils;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Front door for callers that need "the current credential".
///
/// A login entry point validates a credential by fetching one token and then
/// stashes the resulting [`TokenInfo`]. Without a login, the first call to
/// [`get_token_info`](Self::get_token_info) reads the payload injected through
/// the environment, or falls back to the token store.
///
/// # Examples
///
/// ```no_run
/// use identity::auth::{CredentialResolver, TokenManager};
/// use identity::config::IdentityConfig;
///
/// # async fn run() -> identity::error::IdentityResult<()> {
/// let resolver = CredentialResolver::from_config(IdentityConfig::default())?;
/// let manager = TokenManager::new(resolver);
///
/// manager.azure_cli_login("").await?;
/// let credential = manager.get_token_credential().await?;
/// let token = credential
///     .get_token(&["https://storage.azure.com/.default"])
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct TokenManager {
    resolver: CredentialResolver,
    env_var: String,
    stash: RwLock<Option<Arc<TokenInfo>>>,
    env_consumed: AtomicBool,
}

impl TokenManager {
    pub fn new(resolver: CredentialResolver) -> Self {
        let env_var = resolver.config().env_var_name.clone();
        Self {
            resolver,
            env_var,
            stash: RwLock::new(None),
            env_consumed: AtomicBool::new(false),
        }
    }

    /// Reads the injected payload from `name` instead of the configured variable.
    pub fn with_env_var(mut self, name: impl Into<String>) -> Self {
        self.env_var = name.into();
        self
    }

    pub fn resolver(&self) -> &CredentialResolver {
        &self.resolver
    }

    pub fn env_var_name(&self) -> &str {
        &self.env_var
    }

    /// Returns the active token info, loading it on first use.
    ///
    /// # Errors
    ///
    /// Returns an absence error when neither the environment nor the token
    /// store provide a token, [`IdentityError::InvariantViolation`] when the
    /// injected payload does not come from the token store, and
    /// [`IdentityError::InvalidState`] when the token found is empty.
    pub async fn get_token_info(&self) -> IdentityResult<Arc<TokenInfo>> {
        if let Some(info) = self.stash.read().await.as_ref() {
            return Ok(info.clone());
        }

        let mut stash = self.stash.write().await;
        if let Some(info) = stash.as_ref() {
            return Ok(info.clone());
        }

        let info = match self.get_token_info_from_env() {
            Ok(info) => info,
            Err(e) if e.is_absence() => {
                log::debug!("{e}, falling back to cached token");
                self.get_cached_token_info().await?
            }
            Err(e) => return Err(e),
        };

        if info.access_token.is_empty() {
            return Err(IdentityError::InvalidState(
                "token info has an empty access token".to_string(),
            ));
        }

        if info.is_token_store() {
            self.resolver.resolve(&info)?;
        }

        let info = Arc::new(info);
        *stash = Some(info.clone());
        Ok(info)
    }

    fn get_token_info_from_env(&self) -> IdentityResult<TokenInfo> {
        let raw = EnvUtils::take_var(&self.env_var)?;
        self.env_consumed.store(true, Ordering::SeqCst);
        log::debug!("Read token info from {}", self.env_var);

        let info = TokenInfo::from_json(&raw).map_err(|e| {
            IdentityError::Configuration(format!("failed to unmarshal token: {e}"))
        })?;

        if info.token_refresh_source != TOKEN_REFRESH_SOURCE_TOKEN_STORE {
            let message = format!(
                "token info from {} has refresh source {:?}, expected {TOKEN_REFRESH_SOURCE_TOKEN_STORE:?}",
                self.env_var, info.token_refresh_source
            );
            log::error!("{message}");
            return Err(IdentityError::InvariantViolation(message));
        }
        Ok(info)
    }

    async fn get_cached_token_info(&self) -> IdentityResult<TokenInfo> {
        if let Some(store) = self.resolver.shared_token().store() {
            if store.has_cached_token().await {
                return store.load_token().await;
            }
        }
        Err(IdentityError::NoCachedToken(
            "no cached token found".to_string(),
        ))
    }

    /// True if the payload variable is set, or was set and already consumed.
    pub fn env_token_info_exists(&self) -> bool {
        self.env_consumed.load(Ordering::SeqCst) || EnvUtils::has_non_empty_var(&self.env_var)
    }

    pub async fn get_token_credential(&self) -> IdentityResult<Arc<dyn TokenCredential>> {
        let info = self.get_token_info().await?;
        self.resolver.resolve(&info)
    }

    pub async fn has_cached_token(&self) -> bool {
        if self.stash.read().await.is_some() {
            return true;
        }
        match self.resolver.shared_token().store() {
            Some(store) => store.has_cached_token().await,
            None => false,
        }
    }

    pub async fn remove_cached_token(&self) {
        *self.stash.write().await = None;
        log::info!("Removed cached token info");
    }

    pub async fn device_code_login(
        &self,
        tenant: &str,
        active_directory_endpoint: &str,
    ) -> IdentityResult<Arc<TokenInfo>> {
        let info = TokenInfo {
            tenant: self.tenant_or_default(tenant),
            active_directory_endpoint: self.endpoint_or_default(active_directory_endpoint),
            application_id: self.resolver.config().application_id.clone(),
            ..TokenInfo::default()
        };
        self.login(info).await
    }

    /// Delegates to the Azure CLI. Without `tenant`, the configured tenant is
    /// passed on unless it is the `common` default, in which case the CLI's
    /// own signed-in tenant applies.
    pub async fn azure_cli_login(&self, tenant: &str) -> IdentityResult<Arc<TokenInfo>> {
        let info = TokenInfo {
            tenant: self.delegated_tenant(tenant),
            azure_cli_cred: true,
            ..TokenInfo::default()
        };
        self.login(info).await
    }

    /// Delegates to Azure PowerShell, with the same tenant rule as
    /// [`azure_cli_login`](Self::azure_cli_login).
    pub async fn powershell_login(&self, tenant: &str) -> IdentityResult<Arc<TokenInfo>> {
        let info = TokenInfo {
            tenant: self.delegated_tenant(tenant),
            powershell_cred: true,
            ..TokenInfo::default()
        };
        self.login(info).await
    }

    pub async fn managed_identity_login(
        &self,
        identity: IdentityInfo,
    ) -> IdentityResult<Arc<TokenInfo>> {
        identity.validate()?;
        let info = TokenInfo {
            tenant: self.tenant_or_default(""),
            identity: true,
            identity_info: identity,
            ..TokenInfo::default()
        };
        self.login(info).await
    }

    pub async fn secret_login(
        &self,
        tenant: &str,
        active_directory_endpoint: &str,
        secret: &str,
        application_id: &str,
    ) -> IdentityResult<Arc<TokenInfo>> {
        let info = TokenInfo {
            tenant: self.tenant_or_default(tenant),
            active_directory_endpoint: self.endpoint_or_default(active_directory_endpoint),
            application_id: application_id.to_string(),
            service_principal_name: true,
            spn_info: SpnInfo {
                secret: secret.to_string(),
                cert_path: String::new(),
            },
            ..TokenInfo::default()
        };
        self.login(info).await
    }

    pub async fn certificate_login(
        &self,
        tenant: &str,
        active_directory_endpoint: &str,
        cert_path: impl AsRef<Path>,
        cert_password: &str,
        application_id: &str,
    ) -> IdentityResult<Arc<TokenInfo>> {
        let cert_path = std::path::absolute(cert_path.as_ref()).map_err(|e| {
            IdentityError::Configuration(format!(
                "failed to resolve certificate path {}: {e}",
                cert_path.as_ref().display()
            ))
        })?;
        let info = TokenInfo {
            tenant: self.tenant_or_default(tenant),
            active_directory_endpoint: self.endpoint_or_default(active_directory_endpoint),
            application_id: application_id.to_string(),
            service_principal_name: true,
            spn_info: SpnInfo {
                secret: cert_password.to_string(),
                cert_path: cert_path.to_string_lossy().into_owned(),
            },
            ..TokenInfo::default()
        };
        self.login(info).await
    }

    /// Resolves `info`, proves it works with one token request and only then
    /// publishes it.
    async fn login(&self, info: TokenInfo) -> IdentityResult<Arc<TokenInfo>> {
        let credential = self.resolver.resolve(&info)?;
        let scope = self.resolver.config().probe_scope.as_str();
        credential.get_token(&[scope]).await?;
        log::info!("Logged in with {} credential", credential.kind());

        let info = Arc::new(info);
        *self.stash.write().await = Some(info.clone());
        Ok(info)
    }

    fn tenant_or_default(&self, tenant: &str) -> String {
        if tenant.is_empty() {
            self.resolver.config().tenant_id.clone()
        } else {
            tenant.to_string()
        }
    }

    fn delegated_tenant(&self, tenant: &str) -> String {
        let configured = &self.resolver.config().tenant_id;
        if tenant.is_empty() && configured == DEFAULT_TENANT_ID {
            String::new()
        } else {
            self.tenant_or_default(tenant)
        }
    }

    fn endpoint_or_default(&self, endpoint: &str) -> String {
        if endpoint.is_empty() {
            self.resolver.config().active_directory_endpoint.clone()
        } else {
            endpoint.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::types::CredentialKind;
    use crate::config::IdentityConfig;

    fn manager(env_var: &str) -> TokenManager {
        let resolver = CredentialResolver::from_config(IdentityConfig::default()).unwrap();
        TokenManager::new(resolver).with_env_var(env_var)
    }

    fn set(name: &str, value: &str) {
        // SAFETY: every test uses its own variable name.
        unsafe { std::env::set_var(name, value) };
    }

    #[tokio::test]
    async fn env_payload_is_consumed_once() {
        let name = "AZOAUTH_TEST_MANAGER_ENV_ONCE";
        set(
            name,
            r#"{"access_token":"env-token","expires_on":4102444800,"_token_refresh_source":"tokenstore"}"#,
        );
        let manager = manager(name);

        let info = manager.get_token_info().await.unwrap();
        assert_eq!(info.access_token, "env-token");
        assert!(std::env::var(name).is_err());
        assert!(manager.env_token_info_exists());

        let again = manager.get_token_info().await.unwrap();
        assert!(Arc::ptr_eq(&info, &again));

        let credential = manager.get_token_credential().await.unwrap();
        assert_eq!(credential.kind(), CredentialKind::TokenStore);
        assert_eq!(credential.get_token(&[]).await.unwrap().token, "env-token");
    }

    #[tokio::test]
    async fn missing_env_and_cache_is_absence() {
        let manager = manager("AZOAUTH_TEST_MANAGER_UNSET");
        let err = manager.get_token_info().await.unwrap_err();
        assert!(err.is_absence());
        assert_eq!(err.to_string(), "no cached token found");
        assert!(!manager.env_token_info_exists());
        assert!(!manager.has_cached_token().await);
    }

    #[tokio::test]
    async fn wrong_refresh_source_is_an_invariant_violation() {
        let name = "AZOAUTH_TEST_MANAGER_WRONG_SOURCE";
        set(name, r#"{"access_token":"t","_token_refresh_source":"devicecode"}"#);
        let err = manager(name).get_token_info().await.unwrap_err();
        assert!(matches!(err, IdentityError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn malformed_payload_is_a_configuration_error() {
        let name = "AZOAUTH_TEST_MANAGER_MALFORMED";
        set(name, "{not json");
        let err = manager(name).get_token_info().await.unwrap_err();
        assert!(err.to_string().contains("failed to unmarshal token"));
    }

    #[tokio::test]
    async fn empty_access_token_is_invalid_state() {
        let name = "AZOAUTH_TEST_MANAGER_EMPTY_TOKEN";
        set(name, r#"{"access_token":"","_token_refresh_source":"tokenstore"}"#);
        let err = manager(name).get_token_info().await.unwrap_err();
        assert!(matches!(err, IdentityError::InvalidState(_)));
    }

    #[test]
    fn delegated_logins_pick_up_configured_tenant() {
        let default = manager("AZOAUTH_TEST_MANAGER_TENANT_DEFAULT");
        assert_eq!(default.delegated_tenant(""), "");
        assert_eq!(default.delegated_tenant("contoso"), "contoso");
        assert_eq!(default.tenant_or_default(""), DEFAULT_TENANT_ID);

        let config = IdentityConfig {
            tenant_id: "fabrikam".to_string(),
            ..IdentityConfig::default()
        };
        let configured = TokenManager::new(CredentialResolver::from_config(config).unwrap());
        assert_eq!(configured.delegated_tenant(""), "fabrikam");
        assert_eq!(configured.delegated_tenant("contoso"), "contoso");
    }

    #[tokio::test]
    async fn failed_login_leaves_stash_untouched() {
        let manager = manager("AZOAUTH_TEST_MANAGER_FAILED_LOGIN");
        let err = manager
            .managed_identity_login(IdentityInfo {
                client_id: "a".to_string(),
                msi_res_id: "b".to_string(),
                ..IdentityInfo::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::Configuration(_)));
        assert!(!manager.has_cached_token().await);
    }
}

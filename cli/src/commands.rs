use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use identity::auth::{IdentityInfo, TokenCredential, TokenInfo, TokenManager};
use identity::error::IdentityError;
use identity::management::{ManagementClient, ManagementRequest};
use identity::utils::EnvUtils;
use reqwest::Method;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Variable holding the service principal secret for `--secret`.
pub const CLIENT_SECRET_VAR: &str = "AZOAUTH_CLIENT_SECRET";

#[derive(Parser, Debug)]
#[command(name = "azoauth")]
#[command(about = "Acquire Azure AD tokens and call Azure Resource Manager")]
pub struct Cli {
    /// Configuration file (defaults to ./azoauth.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub auth: AuthArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print an access token as JSON
    Token {
        /// Scope to request (defaults to the management scope)
        #[arg(long)]
        scope: Option<String>,
    },
    /// Send a Resource Manager request and wait for long-running operations
    Request {
        /// HTTP method, e.g. GET or PUT
        method: String,
        /// Path appended to the management endpoint
        path: String,
        /// Extra query parameter as key=value (repeatable)
        #[arg(long = "query", value_parser = parse_key_value)]
        query: Vec<(String, String)>,
        /// JSON request body
        #[arg(long)]
        body: Option<String>,
        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
}

/// Selects a login entry point. Without one, the injected or cached token is used.
#[derive(Args, Debug, Default)]
pub struct AuthArgs {
    /// Interactive device code login
    #[arg(long, global = true, group = "login")]
    pub device: bool,
    /// Delegate to the Azure CLI
    #[arg(long, global = true, group = "login")]
    pub cli: bool,
    /// Delegate to Azure PowerShell
    #[arg(long, global = true, group = "login")]
    pub powershell: bool,
    /// Managed identity
    #[arg(long, global = true, group = "login")]
    pub msi: bool,
    #[arg(long, global = true, requires = "msi")]
    pub msi_client_id: Option<String>,
    #[arg(long, global = true, requires = "msi")]
    pub msi_resource_id: Option<String>,
    #[arg(long, global = true, requires = "msi")]
    pub msi_object_id: Option<String>,
    /// Service principal secret, read from AZOAUTH_CLIENT_SECRET
    #[arg(long, global = true, group = "login")]
    pub secret: bool,
    /// Service principal certificate (PEM with certificate and key)
    #[arg(long, global = true, group = "login")]
    pub cert: Option<PathBuf>,
    #[arg(long, global = true, requires = "cert")]
    pub cert_password: Option<String>,
    #[arg(long, global = true)]
    pub tenant: Option<String>,
    #[arg(long, global = true)]
    pub application_id: Option<String>,
    #[arg(long, global = true)]
    pub ad_endpoint: Option<String>,
}

pub fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

pub fn parse_method(raw: &str) -> Result<Method> {
    Method::from_bytes(raw.to_ascii_uppercase().as_bytes())
        .map_err(|_| anyhow!("invalid HTTP method '{raw}'"))
}

impl AuthArgs {
    fn tenant(&self) -> &str {
        self.tenant.as_deref().unwrap_or_default()
    }

    fn ad_endpoint(&self) -> &str {
        self.ad_endpoint.as_deref().unwrap_or_default()
    }

    fn application_id(&self) -> Result<&str> {
        self.application_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .context("--application-id is required for service principal login")
    }

    fn identity_info(&self) -> IdentityInfo {
        IdentityInfo {
            client_id: self.msi_client_id.clone().unwrap_or_default(),
            object_id: self.msi_object_id.clone().unwrap_or_default(),
            msi_res_id: self.msi_resource_id.clone().unwrap_or_default(),
        }
    }
}

/// Runs the selected login, or falls back to the injected or cached token.
pub async fn login(manager: &TokenManager, auth: &AuthArgs) -> Result<Arc<TokenInfo>> {
    let info = if auth.device {
        manager
            .device_code_login(auth.tenant(), auth.ad_endpoint())
            .await?
    } else if auth.cli {
        manager.azure_cli_login(auth.tenant()).await?
    } else if auth.powershell {
        manager.powershell_login(auth.tenant()).await?
    } else if auth.msi {
        manager.managed_identity_login(auth.identity_info()).await?
    } else if auth.secret {
        let secret = EnvUtils::get_optional_var(CLIENT_SECRET_VAR)
            .with_context(|| format!("{CLIENT_SECRET_VAR} must be set for --secret"))?;
        manager
            .secret_login(
                auth.tenant(),
                auth.ad_endpoint(),
                &secret,
                auth.application_id()?,
            )
            .await?
    } else if let Some(cert) = &auth.cert {
        manager
            .certificate_login(
                auth.tenant(),
                auth.ad_endpoint(),
                cert,
                auth.cert_password.as_deref().unwrap_or_default(),
                auth.application_id()?,
            )
            .await?
    } else {
        manager.get_token_info().await?
    };
    Ok(info)
}

pub async fn token_command(manager: &TokenManager, scope: Option<&str>) -> Result<()> {
    let credential = manager.get_token_credential().await?;
    let scope = scope.unwrap_or(manager.resolver().config().management_scope.as_str());
    log::debug!("Requesting token for {scope} from {}", credential.kind());

    let token = credential.get_token(&[scope]).await?;
    let output = serde_json::json!({
        "accessToken": token.token,
        "expiresOn": token.expires_on.to_rfc3339(),
        "credential": credential.kind().to_string(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

pub struct RequestOptions {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub timeout: Option<Duration>,
}

pub async fn request_command(manager: &TokenManager, options: RequestOptions) -> Result<()> {
    let credential: Arc<dyn TokenCredential> = manager.get_token_credential().await?;
    let config = manager.resolver().config();
    let client = ManagementClient::new(manager.resolver().http_client().clone(), credential, config)?;
    let base: Url = client.management_uri().clone();

    let mut request = ManagementRequest::new(options.method, options.path);
    for (key, value) in options.query {
        request = request.query(key, value);
    }
    if let Some(body) = &options.body {
        request = request.json(body)?;
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, cancelling request");
            on_interrupt.cancel();
        }
    });

    let call = client.execute_and_wait::<serde_json::Value>(&base, &request, &cancel);
    let (final_status, value) = match options.timeout {
        Some(timeout) => match tokio::time::timeout(timeout, call).await {
            Ok(result) => result?,
            Err(_) => {
                cancel.cancel();
                bail!("request did not complete within {}s", timeout.as_secs());
            }
        },
        None => call.await?,
    };

    if let Some(status) = final_status {
        log::info!("Operation finished with status {}", status.status);
    }
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Hint printed when no credential source was found. `env_var_name` is the
/// variable the manager reads injected tokens from.
pub fn login_hint(err: &anyhow::Error, env_var_name: &str) -> Option<String> {
    let identity_error = err.downcast_ref::<IdentityError>()?;
    if !identity_error.is_absence() {
        return None;
    }
    Some(format!(
        "No token available. Log in with --device, --cli, --powershell, --msi, --secret or --cert, \
         or inject a token through {env_var_name}."
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};

    #[test]
    fn key_value_pairs_split_on_first_equals() {
        assert_eq!(
            assert_ok!(parse_key_value("$filter=name eq 'a=b'")),
            ("$filter".to_string(), "name eq 'a=b'".to_string())
        );
        assert_err!(parse_key_value("novalue"));
        assert_err!(parse_key_value("=value"));
    }

    #[test]
    fn methods_are_case_insensitive() {
        assert_eq!(assert_ok!(parse_method("put")), Method::PUT);
        assert_err!(parse_method("NOT A METHOD"));
    }

    #[test]
    fn login_flags_are_exclusive() {
        let parsed = Cli::try_parse_from(["azoauth", "--device", "--cli", "token"]);
        assert!(parsed.is_err());

        let parsed = assert_ok!(Cli::try_parse_from([
            "azoauth",
            "request",
            "get",
            "subscriptions/sub/resourcegroups",
            "--query",
            "api-version=2021-04-01",
            "--msi",
            "--msi-client-id",
            "abc",
        ]));
        assert!(parsed.auth.msi);
        assert_eq!(parsed.auth.identity_info(), IdentityInfo::with_client_id("abc"));
        match parsed.command {
            Commands::Request { method, query, .. } => {
                assert_eq!(method, "get");
                assert_eq!(query, vec![("api-version".to_string(), "2021-04-01".to_string())]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn absence_errors_get_a_hint() {
        let absent = anyhow::Error::new(IdentityError::NoCachedToken("no cached token found".into()));
        let hint = login_hint(&absent, "CUSTOM_TOKEN_VAR").unwrap();
        assert!(hint.contains("CUSTOM_TOKEN_VAR"));
        assert!(!hint.contains(identity::config::DEFAULT_ENV_VAR_NAME));

        let wrapped = absent.context("login failed");
        assert!(login_hint(&wrapped, "CUSTOM_TOKEN_VAR").is_some());

        let other = anyhow::Error::new(IdentityError::Configuration("bad".into()));
        assert!(login_hint(&other, "CUSTOM_TOKEN_VAR").is_none());
    }
}

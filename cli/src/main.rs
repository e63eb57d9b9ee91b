use anyhow::{Context, Result};
use azoauth::commands::{self, Cli, Commands, RequestOptions};
use azoauth::{config, logger};
use clap::Parser;
use identity::auth::{CredentialResolver, TokenManager};
use std::process::ExitCode;
use std::time::Duration;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let manager = match setup(&cli) {
        Ok(manager) => manager,
        Err(e) => return report(&e, None),
    };
    match run(cli, &manager).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report(&e, Some(manager.env_var_name())),
    }
}

fn report(e: &anyhow::Error, env_var_name: Option<&str>) -> ExitCode {
    log::error!("{e:#}");
    eprintln!("Error: {e:#}");
    if let Some(hint) = env_var_name.and_then(|name| commands::login_hint(e, name)) {
        eprintln!("{hint}");
    }
    ExitCode::FAILURE
}

fn setup(cli: &Cli) -> Result<TokenManager> {
    let app_config = config::load_config(cli.config.as_deref())?;

    if let Err(e) = logger::setup_logger(app_config.logging()) {
        eprintln!("Warning: Failed to initialize logger: {e}");
    }

    let resolver = CredentialResolver::from_config(app_config.identity().clone())?;
    Ok(TokenManager::new(resolver))
}

async fn run(cli: Cli, manager: &TokenManager) -> Result<()> {
    commands::login(manager, &cli.auth).await?;

    match cli.command {
        Commands::Token { scope } => commands::token_command(manager, scope.as_deref()).await,
        Commands::Request {
            method,
            path,
            query,
            body,
            timeout,
        } => {
            let body = body
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .context("--body is not valid JSON")?;
            let options = RequestOptions {
                method: commands::parse_method(&method)?,
                path,
                query,
                body,
                timeout: timeout.map(Duration::from_secs),
            };
            commands::request_command(manager, options).await
        }
    }
}

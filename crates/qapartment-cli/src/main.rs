//! qapt - command-line access to the Q Apartment admin API.
//!
//! Signs in against the backend, keeps the token pair in the configured
//! store and sends authenticated requests through the same client the
//! back-office uses, so an expired access token is refreshed transparently.

use std::io::{self, Write};

use anyhow::{anyhow, bail, Context, Result};
use qapartment_core::api::{ApiRequest, AuthError, AuthEvent, AuthHttpClient, LoginRequest};
use qapartment_core::ClientConfig;
use reqwest::Method;
use tokio::sync::broadcast::Receiver;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Constants
// ============================================================================

/// When set, logs are also written to `qapt.log` in this directory
const LOG_DIR_ENV: &str = "QAPT_LOG_DIR";

const LOG_FILE: &str = "qapt.log";

const EMAIL_ENV: &str = "QAPT_EMAIL";
const PASSWORD_ENV: &str = "QAPT_PASSWORD";

const USAGE: &str = "\
Usage: qapt <command> [args]

Commands:
  login [email]              Sign in and store the token pair
  logout                     Sign out and clear stored credentials
  whoami [--remote]          Show the stored (or backend) user profile
  get <path>                 GET an admin API path, e.g. /properties
  send <method> <path> [json]  Send any request to the admin API
  change-password            Change the signed-in user's password
  config                     Print the resolved configuration
";

/// Initialize the tracing subscriber for logging
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var_os(LOG_DIR_ENV) {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprint!("{}", USAGE);
        std::process::exit(2);
    };

    let config = ClientConfig::load().context("Failed to load configuration")?;
    debug!(?config, "Configuration loaded");

    if command == "config" {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let store = config.open_store().context("Failed to open token store")?;
    let client = AuthHttpClient::new(&config, store).context("Failed to build HTTP client")?;
    let mut events = client.subscribe();

    let result = match command.as_str() {
        "login" => login(&client, args.get(1).cloned()).await,
        "logout" => {
            client.logout().await;
            println!("Logged out.");
            Ok(())
        }
        "whoami" => whoami(&client, args.iter().any(|a| a == "--remote")).await,
        "get" => {
            let path = args.get(1).ok_or_else(|| anyhow!("get needs a path"))?;
            send(&client, ApiRequest::get(path.as_str())).await
        }
        "send" => {
            let (method, path) = match (args.get(1), args.get(2)) {
                (Some(method), Some(path)) => (method, path),
                _ => bail!("send needs a method and a path"),
            };
            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .with_context(|| format!("Invalid HTTP method '{}'", method))?;
            let mut request = ApiRequest::new(method, path.as_str());
            if let Some(raw) = args.get(3) {
                let body: serde_json::Value =
                    serde_json::from_str(raw).context("Request body is not valid JSON")?;
                request = request.json(&body)?;
            }
            send(&client, request).await
        }
        "change-password" => change_password(&client).await,
        "help" | "--help" | "-h" => {
            print!("{}", USAGE);
            Ok(())
        }
        other => {
            eprint!("Unknown command '{}'\n\n{}", other, USAGE);
            std::process::exit(2);
        }
    };

    report_events(&mut events);
    result
}

/// Tell the user about session changes the command caused.
fn report_events(events: &mut Receiver<AuthEvent>) {
    while let Ok(event) = events.try_recv() {
        if event == AuthEvent::SessionExpired {
            eprintln!("Session expired. Run `qapt login` to sign in again.");
        }
    }
}

async fn login(client: &AuthHttpClient, email: Option<String>) -> Result<()> {
    let email = match email.or_else(|| std::env::var(EMAIL_ENV).ok()) {
        Some(email) => email,
        None => prompt("Email: ")?,
    };
    let password = match std::env::var(PASSWORD_ENV) {
        Ok(password) => password,
        Err(_) => rpassword::prompt_password("Password: ")?,
    };

    if email.is_empty() || password.is_empty() {
        bail!("Email and password required");
    }

    match client.login(&LoginRequest::new(email, password)).await {
        Ok(session) => {
            info!(user_id = session.user_id(), "Login successful");
            println!(
                "Signed in as {} ({:?}).",
                session.user.email, session.user.role
            );
            Ok(())
        }
        Err(AuthError::InvalidCredentials(message)) => bail!("Login failed: {}", message),
        Err(e) if e.is_retryable() => {
            Err(e).context("Unable to reach the server. Check the API URL and your connection")
        }
        Err(e) => Err(e).context("Login failed"),
    }
}

async fn whoami(client: &AuthHttpClient, remote: bool) -> Result<()> {
    let Some(session) = client.restore_session().await else {
        println!("Not signed in.");
        return Ok(());
    };

    let user = if remote {
        client
            .current_user()
            .await
            .context("Failed to fetch current user")?
    } else {
        session.user
    };

    println!("{}", serde_json::to_string_pretty(&user)?);
    Ok(())
}

async fn send(client: &AuthHttpClient, request: ApiRequest) -> Result<()> {
    let response = client.send(request).await?;
    let status = response.status();
    let body = response.text().await.context("Failed to read response body")?;

    println!("{}", status);
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) if body.is_empty() => {}
        Err(_) => println!("{}", body),
    }

    if !status.is_success() {
        bail!("Request failed with status {}", status);
    }
    Ok(())
}

async fn change_password(client: &AuthHttpClient) -> Result<()> {
    if client.restore_session().await.is_none() {
        bail!("Not signed in. Run `qapt login` first.");
    }

    let current = rpassword::prompt_password("Current password: ")?;
    let new = rpassword::prompt_password("New password: ")?;
    let confirm = rpassword::prompt_password("Confirm new password: ")?;

    client
        .change_password(&current, &new, &confirm)
        .await
        .context("Failed to change password")?;
    println!("Password changed.");
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

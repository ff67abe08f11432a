//! CLI handlers for link, status, and unlink.

use std::sync::Arc;

use futures::StreamExt;

use crate::auth::{
    AuthEngine, AuthError, AuthEvent, CredentialSink, ExpiryCause, FlowKind, PairingEvent,
    PairingStatus,
};
use crate::config::PairlinkConfig;

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn engine_for(config: &PairlinkConfig) -> Result<Arc<AuthEngine>, Box<dyn std::error::Error>> {
    let transport = config.transport()?;
    Ok(Arc::new(AuthEngine::with_options(
        Arc::new(transport),
        config.engine_options(),
    )))
}

/// Cancel `kind` on Ctrl-C so the stream ends with `Cancelled`.
fn cancel_on_ctrl_c(engine: &Arc<AuthEngine>, kind: FlowKind) -> tokio::task::JoinHandle<()> {
    let engine = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            engine.cancel(kind);
        }
    })
}

/// Handle `pairlink link pair`.
pub async fn handle_pair(config: &PairlinkConfig, account: &str) -> CliResult {
    let engine = engine_for(config)?;
    let store = config.credential_store();
    let interrupt = cancel_on_ctrl_c(&engine, FlowKind::Pairing);
    let mut events = engine.begin_pairing();

    let mut outcome: CliResult = Err("pairing ended without a result".into());
    while let Some(event) = events.next().await {
        match event {
            PairingEvent::CodeIssued {
                display_code,
                expires_at,
            } => {
                println!("📱 Scan this code with the companion app:\n\n    {display_code}\n");
                if let Some(expires) = expires_at {
                    println!("   (valid until {})", expires.format("%H:%M:%S"));
                }
            }
            PairingEvent::CodeRefreshed {
                display_code,
                cause,
                ..
            } => {
                let why = match cause {
                    ExpiryCause::Server => "expired",
                    ExpiryCause::Timeout => "timed out",
                };
                println!("🔄 Previous code {why}; scan the new one:\n\n    {display_code}\n");
            }
            PairingEvent::StatusChanged {
                status: PairingStatus::Scanned,
            } => println!("👀 Scanned, confirm on your phone..."),
            PairingEvent::StatusChanged { .. } => {}
            PairingEvent::Confirmed { credential } => {
                store.save(account, &credential)?;
                println!("✅ Linked {} as '{account}'", credential.identity_id);
                outcome = Ok(());
            }
            PairingEvent::Failed { error } => outcome = Err(error.into()),
            PairingEvent::Cancelled => outcome = Err("pairing cancelled".into()),
        }
    }
    interrupt.abort();
    outcome
}

/// Handle `pairlink link device`.
pub async fn handle_device(config: &PairlinkConfig, account: &str, scopes: Vec<String>) -> CliResult {
    let engine = engine_for(config)?;
    let store = config.credential_store();
    let mut context = config.client_context();
    if !scopes.is_empty() {
        context.scopes = scopes;
    }
    let interrupt = cancel_on_ctrl_c(&engine, FlowKind::DeviceAuthorization);
    let mut events = engine.begin_device_authorization(context);

    let mut outcome: CliResult = Err("device authorization ended without a result".into());
    while let Some(event) = events.next().await {
        match event {
            AuthEvent::CodeIssued {
                user_code,
                verification_uri,
                verification_uri_complete,
                expires_at,
                ..
            } => {
                match verification_uri_complete {
                    Some(uri) => println!("🔗 Visit: {uri}"),
                    None => println!("🔗 Visit: {verification_uri}"),
                }
                println!("📋 Enter code: {user_code}");
                println!("⏳ Waiting for authorization (until {})...", expires_at.format("%H:%M:%S"));
            }
            AuthEvent::IntervalIncreased { interval } => {
                tracing::debug!(interval_ms = interval.as_millis() as u64, "server asked to slow down");
            }
            AuthEvent::Authorized { credential } => {
                store.save(account, &credential)?;
                println!("✅ Linked {} as '{account}'", credential.identity_id);
                outcome = Ok(());
            }
            AuthEvent::Expired {
                cause: ExpiryCause::Server,
            } => outcome = Err(AuthError::Expired.into()),
            AuthEvent::Expired {
                cause: ExpiryCause::Timeout,
            } => {
                outcome = Err(AuthError::Timeout {
                    attempts: config.device_poll().max_attempts(),
                }
                .into())
            }
            AuthEvent::Denied => outcome = Err(AuthError::Denied.into()),
            AuthEvent::Failed { error } => outcome = Err(error.into()),
            AuthEvent::Cancelled => outcome = Err("device authorization cancelled".into()),
        }
    }
    interrupt.abort();
    outcome
}

/// Handle `pairlink status`.
pub async fn handle_status(config: &PairlinkConfig) -> CliResult {
    let store = config.credential_store();

    println!("🔐 Linked accounts\n");
    let accounts = store.accounts()?;
    if accounts.is_empty() {
        println!("  ❌ None");
    }
    for account in accounts {
        match store.load(&account) {
            Ok(Some(credential)) => {
                let status = match credential.expires_at {
                    Some(expires) if credential.is_expired() => {
                        format!("⚠️  expired {}", expires.format("%Y-%m-%d %H:%M"))
                    }
                    Some(expires) => format!("✅ valid until {}", expires.format("%Y-%m-%d %H:%M")),
                    None => "✅ linked".to_string(),
                };
                println!("  {account}: {} {status}", credential.identity_id);
            }
            Ok(None) => {}
            Err(e) => println!("  {account}: ⚠️  Error: {e}"),
        }
    }

    println!("\n📌 Service: {}", config.base_url().unwrap_or("(not configured)"));
    Ok(())
}

/// Handle `pairlink unlink`.
pub async fn handle_unlink(config: &PairlinkConfig, account: &str) -> CliResult {
    let store = config.credential_store();
    if store.load(account)?.is_none() {
        println!("Nothing linked as '{account}'");
        return Ok(());
    }
    store.clear(account)?;
    println!("✅ Unlinked '{account}'");
    Ok(())
}

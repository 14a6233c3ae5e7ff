use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use feedwatch_connector::{ContentSource, TokenStatus, XApiClient};
use feedwatch_core::{Config, TrackedAccount};
use feedwatch_engine::{Scope, SubscriptionError, SubscriptionFiles};

use crate::app::{self, App};
use crate::cli::SubsAction;

/// Wait for SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                error!(error = %e, "cannot register SIGTERM handler, waiting for ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// Token cancelled on the first shutdown signal.
fn cancel_on_signal() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        trigger.cancel();
    });
    cancel
}

pub async fn run(config: &Config) -> Result<()> {
    let App {
        dispatcher,
        mut engine,
    } = App::build(config)?;

    dispatcher.start().await;
    let cancel = cancel_on_signal();
    let loop_cancel = cancel.clone();
    let detection = tokio::spawn(async move { engine.run_periodic(loop_cancel).await });

    cancel.cancelled().await;
    detection.await.context("detection loop task failed")?;
    dispatcher.stop().await;

    info!("feedwatch exited cleanly");
    Ok(())
}

pub async fn once(config: &Config) -> Result<()> {
    let App {
        dispatcher,
        mut engine,
    } = App::build(config)?;

    dispatcher.start().await;
    let cancel = cancel_on_signal();
    let result = engine.run_once(&cancel).await;
    dispatcher.stop().await;

    let report = result.context("run-once pass failed")?;
    info!(
        checked = report.accounts_checked,
        skipped = report.accounts_skipped,
        delivered = report.items_enqueued,
        interrupted = report.cancelled,
        "run-once pass finished"
    );
    Ok(())
}

pub async fn subs(config: &Config, action: SubsAction) -> Result<()> {
    let files = SubscriptionFiles::from_paths(&config.paths);

    match action {
        SubsAction::List { scope } => {
            let scope = scope.scope();
            let accounts = files.list(&scope)?;
            println!("{scope} list: {} account(s)", accounts.len());
            for a in accounts {
                let tags = if a.tags.is_empty() {
                    String::new()
                } else {
                    format!(" [{}]", a.tags.join(", "))
                };
                println!("  @{:<20} {:<6} count={}{}", a.username, a.priority, a.count, tags);
            }
        }
        SubsAction::Add {
            scope,
            username,
            no_lookup,
        } => {
            let scope = scope.scope();
            let entry = if no_lookup {
                let entry = TrackedAccount::bare(&username);
                files.add(&scope, entry.clone())?;
                entry
            } else {
                let source = app::source(config)?;
                match files.add_resolved(&scope, &username, &*source).await {
                    Ok(entry) => entry,
                    Err(SubscriptionError::Source(e)) => {
                        bail!("cannot add @{username}: account lookup failed: {e}")
                    }
                    Err(e) => return Err(e.into()),
                }
            };
            println!("added @{} to {scope} list (priority {})", entry.username, entry.priority);
        }
        SubsAction::Remove { scope, username } => {
            let scope = scope.scope();
            if files.remove(&scope, &username)? {
                println!("removed @{} from {scope} list", username.trim_start_matches('@'));
            } else {
                bail!("@{} is not in the {scope} list", username.trim_start_matches('@'));
            }
        }
        SubsAction::Sync { file, fetch } => {
            let path: PathBuf = file.unwrap_or_else(|| config.paths.config_dir.join("users.txt"));
            if !path.exists() {
                bail!("text list not found: {}", path.display());
            }
            let source = if fetch { Some(app::source(config)?) } else { None };
            let source_ref = source.as_deref().map(|s| s as &dyn ContentSource);
            let report = files.sync_from_text(&path, source_ref).await?;
            println!(
                "synced: {} kept, {} added, {} removed",
                report.kept,
                report.added.len(),
                report.removed.len()
            );
        }
        SubsAction::Observers => {
            for id in files.observers()? {
                let count = files.list(&Scope::Observer(id.clone()))?.len();
                println!("<@{id}>: {count} subscription(s)");
            }
        }
    }
    Ok(())
}

fn mask(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

pub async fn check_token(config: &Config, probe: &str) -> Result<()> {
    let tokens = &config.source.bearer_tokens;
    if tokens.is_empty() {
        bail!("no bearer tokens configured (set FEEDWATCH_BEARER_TOKENS)");
    }
    let client = XApiClient::from_config(&config.source)?;

    let mut valid = 0;
    for (i, token) in tokens.iter().enumerate() {
        let status = client.check_token(token, probe).await;
        let line = match &status {
            TokenStatus::Valid(info) => format!("ok (@{} resolved, id {})", info.username, info.id),
            TokenStatus::Unauthorized(code) => format!("rejected (HTTP {code})"),
            TokenStatus::RateLimited { retry_after_secs } => {
                format!("valid but rate limited (resets in {retry_after_secs}s)")
            }
            TokenStatus::Failed(reason) => format!("error: {reason}"),
        };
        if status.is_valid() || matches!(status, TokenStatus::RateLimited { .. }) {
            valid += 1;
        }
        println!("token #{} {}: {line}", i + 1, mask(token));
    }

    println!("{valid}/{} token(s) usable", tokens.len());
    if valid == 0 {
        bail!("no usable bearer token");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_hides_middle() {
        assert_eq!(mask("AAAAbbbbbbbbZZZZ"), "AAAA…ZZZZ");
        assert_eq!(mask("short"), "*****");
    }
}

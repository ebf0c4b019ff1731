use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use subscription_backend::chain::AlloyConnector;
use subscription_backend::config::{Cli, Command};
use subscription_backend::renewal::TickOutcome;
use subscription_backend::status::ReadOptions;
use subscription_backend::store::postgres::get_db_pool;
use subscription_backend::store::{PgUserStore, UserStore};
use subscription_backend::SubscriptionService;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to encode output")?;
    println!("{json}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; the environment may already be set.
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let settings = cli.settings.service_settings()?;
    info!(chain = ?settings.chain, "Loaded settings");

    let pool = get_db_pool(&cli.settings.database_url, cli.settings.db_max_connections).await?;
    println!("✅ Successfully connected to database!");

    let connector = Arc::new(AlloyConnector::new(
        cli.settings.rpc_timeout(),
        cli.settings.renewal_confirm_timeout(),
    ));
    let store = Arc::new(PgUserStore::new(pool));
    let service = SubscriptionService::new(settings, connector, store.clone());

    match cli.command {
        Command::Run => {
            let worker = service.worker();
            let initial_delay = cli.settings.renewal_initial_delay();
            let interval = cli.settings.renewal_interval();
            println!("🔁 Renewal worker running, Ctrl-C to stop");
            tokio::select! {
                _ = worker.run(initial_delay, interval) => {
                    warn!("Renewal worker exited");
                }
                result = tokio::signal::ctrl_c() => {
                    result.context("Failed to listen for Ctrl-C")?;
                    info!("Shutting down");
                }
            }
        }
        Command::Status { wallet, fresh } => {
            let options = if fresh {
                ReadOptions::fresh()
            } else {
                ReadOptions::default()
            };
            let snapshot = service
                .get_status(&wallet, options)
                .await
                .with_context(|| format!("Failed to read status for {wallet}"))?;
            print_json(&snapshot)?;
        }
        Command::Sync { user_id } => {
            let user = store
                .find_user(user_id)
                .await?
                .with_context(|| format!("User {user_id} not found"))?;
            let wallet = user
                .wallet_address
                .with_context(|| format!("User {user_id} has no linked wallet"))?;
            let result = service
                .sync_user(user_id, &wallet.to_checksum(None))
                .await
                .with_context(|| format!("Failed to sync user {user_id}"))?;
            if result.synced {
                println!("✅ User {user_id} synced");
            } else {
                println!("⚠️  On-chain status unavailable, user {user_id} left unchanged");
            }
            print_json(&result)?;
        }
        Command::LinkWallet { user_id, wallet } => {
            let linked = service
                .link_wallet(user_id, &wallet)
                .await
                .with_context(|| format!("Failed to link wallet for user {user_id}"))?;
            println!("✅ Linked {} to user {user_id}", linked.to_checksum(None));
        }
        Command::Renew => match service.run_renewal_tick().await {
            TickOutcome::Completed(report) => {
                println!(
                    "✅ Renewal tick done: {} renewed, {} past due, {} unsaved",
                    report.renewed.len(),
                    report.past_due.len(),
                    report.unsaved.len()
                );
                print_json(&report)?;
            }
            TickOutcome::Aborted(err) => {
                eprintln!("❌ Renewal tick aborted: {err}");
                return Err(err.into());
            }
            TickOutcome::Skipped => println!("⏭️  Renewal tick already running"),
        },
        Command::Plan => {
            let terms = service
                .plan_terms()
                .await
                .context("Failed to read plan terms")?;
            print_json(&terms)?;
        }
        Command::State => {
            let state = service.probe().await;
            print_json(&state)?;
        }
    }

    Ok(())
}

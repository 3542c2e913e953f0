//! Bitloops events tail: prints topic events as they arrive.

mod args;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use bitloops_auth::{MemoryStore, StoredUser};
use bitloops_events::SubscriptionManager;

use args::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,bitloops=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.client_config()?;
    info!(server = %config.base_url(), workspace = %config.workspace_id, "starting");

    let store = Arc::new(MemoryStore::new());
    if let Some(token) = &cli.access_token {
        store.save_user(StoredUser {
            uid: cli.uid.clone(),
            access_token: token.clone(),
            ..Default::default()
        });
    }

    let manager =
        SubscriptionManager::new(config, store).context("failed to create HTTP client")?;

    if let Some(mut events) = manager.take_events().await {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                debug!(?event, "subscription event");
            }
        });
    }

    let mut subscriptions = Vec::with_capacity(cli.topics.len());
    for topic in &cli.topics {
        let name = topic.clone();
        let pretty = cli.pretty;
        let subscription = manager
            .try_subscribe(topic.as_str(), move |payload: serde_json::Value| {
                println!("{name}\t{}", render(&payload, pretty));
            })
            .await
            .with_context(|| format!("failed to subscribe to {topic}"))?;
        subscriptions.push(subscription);
    }

    info!(topics = subscriptions.len(), "listening, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    for subscription in subscriptions {
        subscription.unsubscribe().await;
    }
    manager.shutdown();
    Ok(())
}

fn render(payload: &serde_json::Value, pretty: bool) -> String {
    if pretty {
        serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string())
    } else {
        payload.to_string()
    }
}

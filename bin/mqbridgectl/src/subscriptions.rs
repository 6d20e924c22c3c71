//! ---
//! mqb_section: "06-cli"
//! mqb_subsection: "binary"
//! mqb_type: "source"
//! mqb_scope: "code"
//! mqb_description: "Control CLI for operators inspecting mqbridge state."
//! mqb_version: "v0.1.0"
//! mqb_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use mqbridge_durable::{FileSubscriptionStore, SubscriptionStore, SubscriptionSummary};
use mqbridge_logging::{log_lifecycle_event, LifecycleOutcome};
use mqbridge_transport::{ClientId, SubscriptionKey};
use serde::Serialize;

#[derive(Debug, Subcommand)]
pub enum SubscriptionsCommand {
    /// List every durable subscription recorded in the store.
    List(ListArgs),
    /// Show one subscription and the message ids it has acknowledged.
    Show(SubscriptionArgs),
}

#[derive(Debug, Args)]
pub struct ListArgs {
    /// Directory of the file subscription store.
    #[arg(long, value_name = "DIR", env = "MQBRIDGE_STORE")]
    store: PathBuf,

    /// Print JSON instead of a table.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct SubscriptionArgs {
    /// Directory of the file subscription store.
    #[arg(long, value_name = "DIR", env = "MQBRIDGE_STORE")]
    store: PathBuf,

    /// Client identity owning the subscription.
    #[arg(long = "client-id", value_name = "ID")]
    client_id: String,

    /// Subscription name.
    #[arg(long, value_name = "NAME")]
    name: String,
}

impl SubscriptionArgs {
    fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(ClientId::new(self.client_id.clone()), self.name.clone())
    }
}

#[derive(Debug, Serialize)]
struct SubscriptionRow {
    client_id: String,
    name: String,
    topic: String,
    selector: Option<String>,
    no_local: bool,
    created_at: String,
    acknowledged: usize,
}

impl From<&SubscriptionSummary> for SubscriptionRow {
    fn from(summary: &SubscriptionSummary) -> Self {
        Self {
            client_id: summary.key.client_id.to_string(),
            name: summary.key.name.clone(),
            topic: summary.info.topic.to_string(),
            selector: summary.info.selector.clone(),
            no_local: summary.info.no_local,
            created_at: summary.info.created_at.to_rfc3339(),
            acknowledged: summary.acknowledged,
        }
    }
}

pub fn run(command: SubscriptionsCommand) -> Result<()> {
    match command {
        SubscriptionsCommand::List(args) => list(&args),
        SubscriptionsCommand::Show(args) => show(&args),
    }
}

fn open_store(directory: &Path) -> Result<FileSubscriptionStore> {
    FileSubscriptionStore::open(directory)
        .with_context(|| format!("unable to open subscription store {}", directory.display()))
}

fn list(args: &ListArgs) -> Result<()> {
    let store = open_store(&args.store)?;
    let rows: Vec<SubscriptionRow> = store
        .subscriptions()?
        .iter()
        .map(SubscriptionRow::from)
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("No durable subscriptions recorded");
        return Ok(());
    }
    for row in rows {
        println!(
            "{}/{}\t{}\tacknowledged={}",
            row.client_id, row.name, row.topic, row.acknowledged
        );
    }
    Ok(())
}

fn show(args: &SubscriptionArgs) -> Result<()> {
    let store = open_store(&args.store)?;
    let key = args.key();
    let Some(info) = store.subscription(&key)? else {
        bail!("durable subscription {key} does not exist");
    };
    let acknowledged = store.acknowledged_ids(&key)?;

    println!("Subscription: {key}");
    println!("Topic: {}", info.topic);
    println!("Selector: {}", info.selector.as_deref().unwrap_or("-"));
    println!("NoLocal: {}", info.no_local);
    println!("Created: {}", info.created_at.to_rfc3339());
    println!("Acknowledged: {}", acknowledged.len());
    for id in acknowledged {
        println!("  {id}");
    }
    Ok(())
}

pub fn unsubscribe(args: &SubscriptionArgs) -> Result<()> {
    let store = open_store(&args.store)?;
    let key = args.key();
    if !store.unsubscribe(&key)? {
        bail!("durable subscription {key} does not exist");
    }
    log_lifecycle_event(
        None,
        "subscription.remove",
        &format!("removed durable subscription {key}"),
        LifecycleOutcome::Success,
    );
    println!("Removed {key}");
    Ok(())
}

//! ---
//! mqb_section: "06-cli"
//! mqb_subsection: "binary"
//! mqb_type: "source"
//! mqb_scope: "code"
//! mqb_description: "Control CLI for operators inspecting mqbridge state."
//! mqb_version: "v0.1.0"
//! mqb_owner: "tbd"
//! ---
use anyhow::Result;
use clap::{Parser, Subcommand};

mod demo;
mod subscriptions;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "mqbridge administrative control utility",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(subcommand, about = "Inspect durable subscriptions in a file store")]
    Subscriptions(subscriptions::SubscriptionsCommand),
    #[command(about = "Remove a durable subscription and its acknowledged ids")]
    Unsubscribe(subscriptions::SubscriptionArgs),
    #[command(about = "Publish and consume messages through an in-process bridge")]
    Demo(demo::DemoCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Subscriptions(cmd) => {
            mqbridge_logging::init();
            subscriptions::run(cmd)?
        }
        Commands::Unsubscribe(args) => {
            mqbridge_logging::init();
            subscriptions::unsubscribe(&args)?
        }
        Commands::Demo(cmd) => cmd.execute()?,
    }
    Ok(())
}

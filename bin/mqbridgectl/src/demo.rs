//! ---
//! mqb_section: "06-cli"
//! mqb_subsection: "binary"
//! mqb_type: "source"
//! mqb_scope: "code"
//! mqb_description: "Control CLI for operators inspecting mqbridge state."
//! mqb_version: "v0.1.0"
//! mqb_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Args;
use mqbridge_common::{init_tracing, BridgeConfig};
use mqbridge_session::{AcknowledgeMode, Connection, Message};
use mqbridge_transport::{Destination, TransportRegistry};
use tracing::info;

const DEMO_CLIENT_ID: &str = "mqbridgectl-demo";

#[derive(Debug, Args)]
pub struct DemoCommand {
    /// Bridge configuration file. Built-in defaults are used when omitted.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of messages to publish.
    #[arg(long, value_name = "N", default_value_t = 3)]
    messages: usize,

    /// Acknowledgement mode of the consuming session.
    #[arg(long = "ack-mode", value_name = "MODE", default_value_t = AcknowledgeMode::Auto)]
    ack_mode: AcknowledgeMode,

    /// Topic the demo publishes to.
    #[arg(long, value_name = "NAME", default_value = "mqbridge.demo")]
    topic: String,
}

impl DemoCommand {
    pub fn execute(self) -> Result<()> {
        let config = match &self.config {
            Some(path) => {
                let config = BridgeConfig::from_path(path)?;
                init_tracing("mqbridgectl", &config.logging)?;
                config
            }
            None => {
                mqbridge_logging::init();
                BridgeConfig::default()
            }
        };
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| DEMO_CLIENT_ID.to_owned());

        let transports = TransportRegistry::with_defaults(config.transport.history_depth);
        let connection = Connection::from_config(
            &BridgeConfig {
                client_id: Some(client_id),
                ..config.clone()
            },
            &transports,
        )
        .context("unable to open bridge connection")?;

        let outcome = self.round_trip(&connection, &config);
        connection.close();
        let received = outcome?;

        println!("Acknowledge mode: {}", self.ack_mode);
        println!("Published: {}", self.messages);
        println!("Received: {received}");
        if let Some(metrics) = connection.metrics() {
            let acknowledged = metrics
                .registry()
                .gather()
                .into_iter()
                .find(|family| family.get_name() == "mqbridge_messages_acknowledged_total")
                .and_then(|family| {
                    family
                        .get_metric()
                        .first()
                        .map(|metric| metric.get_counter().get_value())
                })
                .unwrap_or_default();
            println!("Acknowledged: {acknowledged}");
        }
        if received != self.messages {
            return Err(anyhow!(
                "expected {} messages, received {received}",
                self.messages
            ));
        }
        Ok(())
    }

    fn round_trip(&self, connection: &Connection, config: &BridgeConfig) -> Result<usize> {
        let topic = Destination::topic(self.topic.clone());
        let consuming = connection.create_session(self.ack_mode)?;
        let consumer = consuming.create_durable_consumer(&topic, "demo")?;

        let publishing = connection.create_session(AcknowledgeMode::Auto)?;
        let producer = publishing.create_producer(Some(&topic))?;
        for n in 0..self.messages {
            let message = Message::text(format!("demo message {n}"))
                .with_property("seq", i64::try_from(n).unwrap_or(i64::MAX));
            let id = producer.send(&message)?;
            info!(message_id = %id, "published demo message");
        }

        let mut received = 0;
        let mut last = None;
        while received < self.messages {
            let Some(message) = consumer.receive_timeout(config.session.receive_timeout)? else {
                break;
            };
            println!(
                "  {} {}",
                message.id().map(ToString::to_string).unwrap_or_default(),
                message.text_body().unwrap_or_default()
            );
            received += 1;
            last = Some(message);
        }
        if let Some(message) = last {
            message.acknowledge()?;
        }

        consumer.close();
        consuming.unsubscribe("demo")?;
        Ok(received)
    }
}

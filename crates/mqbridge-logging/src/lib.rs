//! ---
//! mqb_section: "05-observability"
//! mqb_subsection: "module"
//! mqb_type: "source"
//! mqb_scope: "code"
//! mqb_description: "Structured logging adapters and sinks."
//! mqb_version: "v0.1.0"
//! mqb_owner: "tbd"
//! ---
#![warn(missing_docs)]

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

/// Initialize a baseline tracing subscriber suitable for development.
///
/// Events go to stderr so command output on stdout stays parseable.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Session identifier associated with the log event.
    pub session: Option<&'a str>,
    /// Consumer identifier associated with the log event.
    pub consumer: Option<&'a str>,
    /// Destination the event concerns.
    pub destination: Option<&'a str>,
    /// Durable subscription identity, when one is involved.
    pub subscription: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a session identifier.
    pub fn with_session(mut self, session: &'a str) -> Self {
        self.session = Some(session);
        self
    }

    /// Attach a consumer identifier.
    pub fn with_consumer(mut self, consumer: &'a str) -> Self {
        self.consumer = Some(consumer);
        self
    }

    /// Attach a destination.
    pub fn with_destination(mut self, destination: &'a str) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Attach a durable subscription identity.
    pub fn with_subscription(mut self, subscription: &'a str) -> Self {
        self.subscription = Some(subscription);
        self
    }
}

/// High-level outcome used when emitting lifecycle log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutcome {
    /// The operation completed successfully.
    Success,
    /// The operation failed or was aborted.
    Fault,
}

impl LifecycleOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            LifecycleOutcome::Success => "success",
            LifecycleOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized lifecycle event (open, close, unsubscribe, ...).
pub fn log_lifecycle_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: LifecycleOutcome,
) {
    let ctx = context.cloned().unwrap_or_default();
    // `tracing::event!` needs a constant level, hence the two arms.
    match outcome {
        LifecycleOutcome::Success => tracing::event!(
            Level::INFO,
            event,
            outcome = outcome.as_str(),
            session = ctx.session.unwrap_or(""),
            consumer = ctx.consumer.unwrap_or(""),
            destination = ctx.destination.unwrap_or(""),
            subscription = ctx.subscription.unwrap_or(""),
            message = %message
        ),
        LifecycleOutcome::Fault => tracing::event!(
            Level::ERROR,
            event,
            outcome = outcome.as_str(),
            session = ctx.session.unwrap_or(""),
            consumer = ctx.consumer.unwrap_or(""),
            destination = ctx.destination.unwrap_or(""),
            subscription = ctx.subscription.unwrap_or(""),
            message = %message
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macros_emit_without_panic() {
        init();
        let ctx = LogContext::new()
            .with_session("session-1")
            .with_destination("topic://prices");
        bridge_info!(context = ctx.clone(), "consumer attached");
        bridge_debug!("debug message");
        bridge_warn!(context = ctx.clone(), "slow store: {}ms", 250);
        bridge_error!(context = ctx, "persist failed: {}", "disk full");
    }

    #[test]
    fn lifecycle_helper_emits() {
        init();
        let ctx = LogContext::new()
            .with_consumer("consumer-1")
            .with_subscription("client-a/orders");
        log_lifecycle_event(
            Some(&ctx),
            "consumer.close",
            "consumer closed",
            LifecycleOutcome::Success,
        );
        log_lifecycle_event(
            None,
            "session.acknowledge",
            "acknowledge failed",
            LifecycleOutcome::Fault,
        );
    }
}

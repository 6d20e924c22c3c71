//! ---
//! mqb_section: "05-observability"
//! mqb_subsection: "module"
//! mqb_type: "source"
//! mqb_scope: "code"
//! mqb_description: "Structured logging adapters and sinks."
//! mqb_version: "v0.1.0"
//! mqb_owner: "tbd"
//! ---
/// Emit an informational log enriched with bridge context.
#[macro_export]
macro_rules! bridge_info {
    (context = $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            tracing::Level::INFO,
            session = ctx.session.unwrap_or(""),
            consumer = ctx.consumer.unwrap_or(""),
            destination = ctx.destination.unwrap_or(""),
            subscription = ctx.subscription.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
    ($($arg:tt)+) => {{
        let ctx = &$crate::LogContext::default();
        tracing::event!(
            tracing::Level::INFO,
            session = ctx.session.unwrap_or(""),
            consumer = ctx.consumer.unwrap_or(""),
            destination = ctx.destination.unwrap_or(""),
            subscription = ctx.subscription.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit a debug log enriched with bridge context.
#[macro_export]
macro_rules! bridge_debug {
    (context = $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            tracing::Level::DEBUG,
            session = ctx.session.unwrap_or(""),
            consumer = ctx.consumer.unwrap_or(""),
            destination = ctx.destination.unwrap_or(""),
            subscription = ctx.subscription.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
    ($($arg:tt)+) => {{
        let ctx = &$crate::LogContext::default();
        tracing::event!(
            tracing::Level::DEBUG,
            session = ctx.session.unwrap_or(""),
            consumer = ctx.consumer.unwrap_or(""),
            destination = ctx.destination.unwrap_or(""),
            subscription = ctx.subscription.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit a warning log enriched with bridge context.
#[macro_export]
macro_rules! bridge_warn {
    (context = $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            tracing::Level::WARN,
            session = ctx.session.unwrap_or(""),
            consumer = ctx.consumer.unwrap_or(""),
            destination = ctx.destination.unwrap_or(""),
            subscription = ctx.subscription.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
    ($($arg:tt)+) => {{
        let ctx = &$crate::LogContext::default();
        tracing::event!(
            tracing::Level::WARN,
            session = ctx.session.unwrap_or(""),
            consumer = ctx.consumer.unwrap_or(""),
            destination = ctx.destination.unwrap_or(""),
            subscription = ctx.subscription.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an error log enriched with bridge context.
#[macro_export]
macro_rules! bridge_error {
    (context = $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            tracing::Level::ERROR,
            session = ctx.session.unwrap_or(""),
            consumer = ctx.consumer.unwrap_or(""),
            destination = ctx.destination.unwrap_or(""),
            subscription = ctx.subscription.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
    ($($arg:tt)+) => {{
        let ctx = &$crate::LogContext::default();
        tracing::event!(
            tracing::Level::ERROR,
            session = ctx.session.unwrap_or(""),
            consumer = ctx.consumer.unwrap_or(""),
            destination = ctx.destination.unwrap_or(""),
            subscription = ctx.subscription.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}

//! ---
//! mqb_section: "01-core-functionality"
//! mqb_subsection: "module"
//! mqb_type: "source"
//! mqb_scope: "code"
//! mqb_description: "Shared configuration and tracing primitives."
//! mqb_version: "v0.1.0"
//! mqb_owner: "tbd"
//! ---
//! Configuration loading and tracing setup shared by the bridge crates
//! and the `mqbridgectl` binary.

pub mod config;
pub mod logging;

pub use config::{
    BridgeConfig, LoadedBridgeConfig, LoggingConfig, MetricsConfig, SessionConfig, StoreConfig,
    StoreKind, TransportConfig,
};
pub use logging::{init_tracing, LogFormat};

//! ---
//! warden_section: "01-core-functionality"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Shared primitives and utilities for the service runtime."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! Shared primitives for the Warden workspace: configuration loading,
//! tracing initialisation and wall-clock helpers.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, IdentityConfig, LoadedAppConfig, LoggingConfig, MetricsConfig, SeedPermissions,
    SyncConfig, TimeoutConfig, TopicSeed, TransportConfig,
};
pub use logging::{init_tracing, LogFormat, TracingGuard, LOG_ENV};
pub use time::{unix_nanos_before, unix_nanos_now};

//! Shared types, configuration and utilities for the PhoneHome bridge.

pub mod config;
pub mod testing;
pub mod types;
pub mod util;

pub use config::{BridgeConfig, ConfigError, EnvError, EnvParser, ServeMode};
pub use types::{Callback, CallbackKind, CorrelationToken, TransactionId, UnknownKind};
pub use util::{HostnameExtractor, preview_payload};

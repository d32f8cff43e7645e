//! Configuration system for the PhoneHome bridge.
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! `PHONEHOME_*` environment variables. Command-line flags are applied last by
//! the binary.

pub mod bridge;
pub mod env;

pub use bridge::{
    BridgeConfig, ConfigError, DEFAULT_CONNECTIVITY_PATH, DEFAULT_MAX_BODY_BYTES,
    DEFAULT_METADATA_PATH, DEFAULT_PORT, DEFAULT_READ_TIMEOUT, DEFAULT_WAIT_TIMEOUT, ServeMode,
    WAIT_PATH_PREFIX,
};
pub use env::{ENV_PREFIX, EnvError, EnvParser, parse_duration};

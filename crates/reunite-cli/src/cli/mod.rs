pub mod commands;
pub mod config;
pub mod fixture;

pub use commands::{execute, CliCommand};
pub use config::{default_config_path, resolve_config};
pub use fixture::Fixture;

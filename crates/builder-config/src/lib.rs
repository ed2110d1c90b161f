//! Configuration for the Simple Builder server.
//!
//! Values are layered: built-in defaults, then an optional KDL file, then
//! whatever the binary's command line overrides.

pub mod error;
pub mod server;

pub use error::{ConfigError, ConfigResult};
pub use server::{QueueConfig, ServerConfig, parse_server_config};

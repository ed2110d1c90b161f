//! Build execution backends for Simple Builder.
//!
//! Provides the pieces a build is made of:
//! - [`LocalExecutor`]: runs one subprocess under a cancellation signal
//! - [`GitCloner`]: clones the repository, optionally over SSH with a key
//! - [`ScriptRunner`]: materializes and runs the build script
//! - [`LogSink`]: the per-build append-only log file

pub mod cloner;
pub mod env;
pub mod layout;
pub mod local;
pub mod log;
pub mod script;
pub mod transcript;

pub use builder_core::executor::{CommandSpec, ExecOutcome, Executor, StopMode};
pub use cloner::GitCloner;
pub use layout::BuildLayout;
pub use local::LocalExecutor;
pub use log::LogSink;
pub use script::ScriptRunner;

//! Build scheduling for Simple Builder.
//!
//! Runs builds and tracks the ones in flight:
//! - [`Build`]: one clone-then-run execution with a completion signal
//! - [`BuildRegistry`]: token-addressed builds, completion callbacks, eviction
//! - [`Worker`]: consumes build requests from a [`WorkQueue`] and keeps each
//!   message leased until its build finishes
//! - [`shutdown::install_shutdown_handler`]: SIGINT/SIGTERM as a cancellation token

pub mod callback;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod shutdown;
pub mod sigv4;
pub mod sqs;
pub mod worker;

pub use callback::CallbackNotifier;
pub use orchestrator::{Build, BuildRunner};
pub use queue::{QueueError, QueueMessage, WorkQueue};
pub use registry::{BuildRegistry, RegistryConfig};
pub use sqs::{SqsConfig, SqsQueue};
pub use worker::{LeaseConfig, Worker};

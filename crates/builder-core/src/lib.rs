//! Core domain types and traits for Simple Builder.
//!
//! This crate contains:
//! - Build descriptors and the callback-carrying build request
//! - Build tokens (registry keys and access capabilities)
//! - Build status, process exit state and the JSON snapshot
//! - The executor trait and command specifications
//! - The build error taxonomy

pub mod build;
pub mod descriptor;
pub mod error;
pub mod executor;
pub mod token;

pub use build::{BuildSnapshot, BuildStatus, ProcessState};
pub use descriptor::{BuildDescriptor, BuildRequest};
pub use error::{Error, ErrorKind, Result};
pub use token::BuildToken;

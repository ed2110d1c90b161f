//! HTTP API for Simple Builder.
//!
//! Builds are submitted, observed and cancelled through `/builds`; each one
//! is addressed by the unguessable token handed back on submission.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;

//! Standalone election node
//!
//! Wires an [`bully_cluster::ElectionEngine`] to its peripheral adapters: the
//! command line, the plain-text HTTP leader endpoint and the election webhook.

pub mod cli;
pub mod error;
pub mod web;
pub mod webhook;

pub use cli::Cli;
pub use error::{NodeError, Result};
pub use web::{render_leader, router, AppState};
pub use webhook::WebhookObserver;

//! Database module for lanpulse.
//!
//! Provides SQLite storage for the monitored target set and durable
//! check-result history.

mod models;
mod store;

pub use models::*;
pub use store::*;

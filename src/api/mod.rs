//! JSON API for the spot trader
//!
//! Mirrors the engine's operations: positions, schedule, execution history,
//! credentials, settings, price alerts and market lookups.

pub mod routes;
pub mod server;

pub use server::{create_app, AppState};

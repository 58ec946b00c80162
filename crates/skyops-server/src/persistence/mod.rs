//! Persistence layer: SQLite-backed storage for drones, missions, and
//! derived analytics rows. Hot reads go through the in-memory state; the
//! database is the system of record for missions and drone assets.

pub mod db;
pub mod drones;
pub mod metrics;
pub mod missions;

pub use db::{init_database, Database};

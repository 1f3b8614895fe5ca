//! Infrastructure layer - ProvenanceGraph adapters
//!
//! - `memory`: in-memory graph + JSON snapshot format
//! - `sqlite`: SQLite adapter

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::{GraphSnapshot, InMemoryGraph};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteProvenanceGraph;

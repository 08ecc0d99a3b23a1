//! memvault - durable memory storage for agent-memory services
//!
//! Memories, reference docs and details clusters behind one provider contract,
//! with SQLite and PostgreSQL backends, optional at-rest encryption, a startup
//! backfill and a write-ahead queue that accepts writes before storage is ready.

pub mod config;
pub mod crypto;
pub mod embedding;
pub mod error;
pub mod gate;
pub mod storage;
pub mod types;

pub use config::VaultConfig;
pub use error::{Result, VaultError};
pub use gate::{ReadinessState, VaultStore};
pub use storage::{StorageProvider, SqliteBackend};
pub use types::*;

#[cfg(feature = "postgres")]
pub use storage::PostgresBackend;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

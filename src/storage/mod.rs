//! Storage engine for memvault
//!
//! Handles the provider contract, the SQLite and PostgreSQL adapters, schema
//! management and the startup backfill.

pub mod backend;
pub mod backfill;
mod cluster_queries;
mod connection;
pub mod migrations;
pub mod queries;
mod records;
mod sqlite_backend;

#[cfg(feature = "postgres")]
mod postgres_backend;

pub use backend::{
    BackendCapabilities, EntityTable, MigrationTarget, PendingRow, StorageInfo, StorageProvider,
    StorageStats,
};
pub use backfill::{run_backfill, BackfillReport};
pub use connection::Storage;
pub use sqlite_backend::SqliteBackend;

#[cfg(feature = "postgres")]
pub use postgres_backend::{PostgresBackend, PG_SCHEMA_VERSION};

//! SQLite connection management
//!
//! One connection per database file, shared behind a mutex. Async callers go
//! through [`Storage::call`], which runs the closure on the blocking pool and
//! cancels it when the calling future is dropped: a call that has not yet
//! acquired the connection never runs, and a running statement is interrupted
//! (its transaction, if any, rolls back).

use parking_lot::Mutex;
use rusqlite::{Connection, InterruptHandle, OpenFlags};
use std::path::Path;
use std::sync::Arc;

use crate::config::{SqliteConfig, StorageMode};
use crate::error::{Result, VaultError};

/// Shared SQLite handle
pub struct Storage {
    config: SqliteConfig,
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    Pending,
    Running,
    Done,
    Cancelled,
}

/// Dropped together with the awaiting future
struct CancelGuard {
    state: Arc<Mutex<CallState>>,
    interrupt: Arc<InterruptHandle>,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        match *state {
            CallState::Pending => *state = CallState::Cancelled,
            // The closure holds the connection until it marks itself Done,
            // so this cannot hit a statement issued by another call.
            CallState::Running => {
                tracing::debug!("Interrupting abandoned SQLite call");
                self.interrupt.interrupt();
            }
            CallState::Done | CallState::Cancelled => {}
        }
    }
}

impl Storage {
    /// Open or create the database file and apply connection pragmas
    pub fn open(config: SqliteConfig) -> Result<Self> {
        let conn = Self::create_connection(&config)?;
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Ok(Self {
            config,
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(SqliteConfig::in_memory())
    }

    fn create_connection(config: &SqliteConfig) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = if config.db_path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            let path = crate::config::expand_path(&config.db_path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open_with_flags(&path, flags)?
        };

        Self::configure_pragmas(&conn, config.storage_mode)?;
        Ok(conn)
    }

    /// Local mode: WAL for performance and crash recovery.
    /// Cloud-safe mode: DELETE journal so sync clients only ever see one file.
    fn configure_pragmas(conn: &Connection, mode: StorageMode) -> Result<()> {
        match mode {
            StorageMode::Local => {
                conn.execute_batch(
                    r#"
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA wal_autocheckpoint=1000;
                    PRAGMA busy_timeout=30000;
                    PRAGMA cache_size=-64000;
                    PRAGMA temp_store=MEMORY;
                    "#,
                )?;
            }
            StorageMode::CloudSafe => {
                conn.execute_batch(
                    r#"
                    PRAGMA journal_mode=DELETE;
                    PRAGMA synchronous=FULL;
                    PRAGMA busy_timeout=30000;
                    PRAGMA cache_size=-32000;
                    PRAGMA temp_store=MEMORY;
                    "#,
                )?;
            }
        }
        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    ///
    /// Dropping the returned future cancels the call.
    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let state = Arc::new(Mutex::new(CallState::Pending));
        let _guard = CancelGuard {
            state: state.clone(),
            interrupt: self.interrupt.clone(),
        };
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            {
                let mut state = state.lock();
                if *state == CallState::Cancelled {
                    return Err(VaultError::Cancelled);
                }
                *state = CallState::Running;
            }
            let result = f(&mut conn);
            *state.lock() = CallState::Done;
            result
        })
        .await
        .map_err(|e| VaultError::Internal(format!("blocking task failed: {}", e)))?
    }

    /// Run `f` in the background without blocking the caller.
    ///
    /// A failed attempt is retried once; the outcome is only logged.
    pub fn spawn_detached<F>(&self, label: &'static str, f: F)
    where
        F: Fn(&Connection) -> Result<()> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            for attempt in 1..=2 {
                let result = {
                    let conn = conn.lock();
                    f(&conn)
                };
                match result {
                    Ok(()) => return,
                    Err(e) if attempt == 1 => {
                        tracing::warn!("{} failed, retrying: {}", label, e);
                    }
                    Err(e) => {
                        tracing::warn!("{} failed after retry: {}", label, e);
                    }
                }
            }
        });
    }

    /// Execute a function with the connection on the current thread
    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.config.storage_mode
    }

    pub fn db_path(&self) -> &str {
        &self.config.db_path
    }

    /// "sqlite-wal" or "sqlite-delete"
    pub fn mode_label(&self) -> &'static str {
        match self.config.storage_mode {
            StorageMode::Local => "sqlite-wal",
            StorageMode::CloudSafe => "sqlite-delete",
        }
    }

    /// Check if database is in a cloud-synced folder
    pub fn is_in_cloud_folder(&self) -> bool {
        let path = self.config.db_path.to_lowercase();
        path.contains("dropbox")
            || path.contains("onedrive")
            || path.contains("icloud")
            || path.contains("google drive")
    }

    /// Get warning if storage mode doesn't match folder type
    pub fn storage_mode_warning(&self) -> Option<String> {
        if self.is_in_cloud_folder() && self.config.storage_mode == StorageMode::Local {
            Some(format!(
                "Database '{}' appears to be in a cloud-synced folder; WAL mode may corrupt it. \
                 Set MEMVAULT_STORAGE_MODE=cloud-safe or move the file to a local folder",
                self.config.db_path
            ))
        } else {
            None
        }
    }

    /// Checkpoint WAL file (for local mode)
    pub async fn checkpoint(&self) -> Result<()> {
        if self.config.storage_mode != StorageMode::Local {
            return Ok(());
        }
        self.call(|conn| {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
            Ok(())
        })
        .await
    }

    pub async fn db_size(&self) -> Result<i64> {
        self.call(|conn| {
            let size: i64 = conn.query_row(
                "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
                [],
                |row| row.get(0),
            )?;
            Ok(size)
        })
        .await
    }
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            conn: self.conn.clone(),
            interrupt: self.interrupt.clone(),
        }
    }
}

//! Database managers - one implementation per engine
//!
//! - `sqlite` - embedded SQLite files (rusqlite)
//! - `postgres` - PostgreSQL with one pool per connection string (sqlx)
//! - `generic` - any `postgres://` or `mysql://` URL through the sqlx `Any` driver
//!
//! Managers are looked up by `DatabaseType` in a static registry.

pub mod generic;
pub mod postgres;
pub mod sqlite;

use crate::domain::types::{DatabaseMessage, DatabaseType, TableConfiguration};
use crate::infra::logging::mask_connection_string;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::error;

pub use generic::GenericDatabaseManager;
pub use postgres::PostgresDatabaseManager;
pub use sqlite::SqliteDatabaseManager;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("SQL error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("blocking database task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("invalid connection string \"{0}\"")]
    InvalidConnectionString(String),
    #[error("unsupported generic SQL URL scheme \"{0}\", expected postgres:// or mysql://")]
    UnsupportedScheme(String),
    #[error("invalid table name \"{0}\"")]
    InvalidTableName(String),
    #[error("database manager is closed")]
    Closed,
    #[error("operation cancelled")]
    Cancelled,
}

/// Persistence for one database engine.
///
/// Each row stored is (Timestamp, Message) in every table the message's
/// database configuration lists. All rows of one call commit together.
#[async_trait]
pub trait DatabaseManager: Send + Sync {
    fn database_type(&self) -> DatabaseType;

    /// Create missing tables inside one transaction
    async fn ensure_tables_exist(
        &self,
        connection_string: &str,
        tables: &[TableConfiguration],
    ) -> Result<(), DatabaseError>;

    /// Insert every entry into every table it names, atomically
    async fn write_to_database(
        &self,
        connection_string: &str,
        entries: &[DatabaseMessage],
    ) -> Result<(), DatabaseError>;

    /// Release pooled connections
    async fn close(&self) {}

    async fn try_ensure_tables_exist(
        &self,
        connection_string: &str,
        tables: &[TableConfiguration],
    ) -> bool {
        match self.ensure_tables_exist(connection_string, tables).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    database_type = %self.database_type(),
                    connection_string = %mask_connection_string(connection_string),
                    error = %e,
                    "database_ensure_tables_failed"
                );
                false
            }
        }
    }

    async fn try_write_to_database(&self, connection_string: &str, entries: &[DatabaseMessage]) -> bool {
        match self.write_to_database(connection_string, entries).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    database_type = %self.database_type(),
                    connection_string = %mask_connection_string(connection_string),
                    messages = entries.len(),
                    error = %e,
                    "database_write_failed"
                );
                false
            }
        }
    }
}

pub type ManagerFactory = fn(CancellationToken) -> Arc<dyn DatabaseManager>;

static REGISTRY: &[(DatabaseType, ManagerFactory)] = &[
    (DatabaseType::SQLite, SqliteDatabaseManager::create as ManagerFactory),
    (DatabaseType::GenericSql, GenericDatabaseManager::create as ManagerFactory),
    (DatabaseType::PostgreSql, PostgresDatabaseManager::create as ManagerFactory),
];

/// Build the manager for `database_type`; `None` has no manager
pub fn make_manager_for(
    database_type: DatabaseType,
    cancel: CancellationToken,
) -> Option<Arc<dyn DatabaseManager>> {
    REGISTRY
        .iter()
        .find(|(registered, _)| *registered == database_type)
        .map(|(_, factory)| factory(cancel))
}

/// Quote an identifier, doubling embedded quote characters
pub(crate) fn quote_identifier(name: &str, quote: char) -> Result<String, DatabaseError> {
    if name.trim().is_empty() || name.contains('\0') {
        return Err(DatabaseError::InvalidTableName(name.to_string()));
    }

    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push(quote);
    for c in name.chars() {
        if c == quote {
            quoted.push(quote);
        }
        quoted.push(c);
    }
    quoted.push(quote);
    Ok(quoted)
}

/// Table names in first-seen order without duplicates
pub(crate) fn unique_table_names(tables: &[TableConfiguration]) -> Vec<&str> {
    let mut names: Vec<&str> = Vec::with_capacity(tables.len());
    for table in tables {
        if !names.contains(&table.name.as_str()) {
            names.push(&table.name);
        }
    }
    names
}

/// One row to insert: (table, formatted timestamp, message)
pub(crate) fn formatted_rows(entries: &[DatabaseMessage]) -> Vec<(String, String, Arc<str>)> {
    entries
        .iter()
        .flat_map(|entry| {
            entry.database.tables.iter().map(move |table| {
                (
                    table.name.clone(),
                    table.timestamp_format.format(&entry.timestamp),
                    entry.message.clone(),
                )
            })
        })
        .collect()
}

/// Run `future` unless `cancel` fires first
pub(crate) async fn cancellable<F: Future>(
    cancel: &CancellationToken,
    future: F,
) -> Result<F::Output, DatabaseError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(DatabaseError::Cancelled),
        output = future => Ok(output),
    }
}

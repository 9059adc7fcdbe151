//! SQLite manager
//!
//! rusqlite is blocking, so each call opens the file on a blocking thread,
//! runs its statements in one transaction and commits.

use super::{formatted_rows, quote_identifier, unique_table_names, DatabaseError, DatabaseManager};
use crate::domain::types::{sqlite_data_source, DatabaseMessage, DatabaseType, TableConfiguration};
use crate::infra::logging::mask_connection_string;
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteDatabaseManager {
    cancel: CancellationToken,
}

impl SqliteDatabaseManager {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn create(cancel: CancellationToken) -> Arc<dyn DatabaseManager> {
        Arc::new(Self::new(cancel))
    }
}

fn open(connection_string: &str) -> Result<Connection, DatabaseError> {
    let path = sqlite_data_source(connection_string).ok_or_else(|| {
        DatabaseError::InvalidConnectionString(mask_connection_string(connection_string))
    })?;
    let connection = Connection::open(path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    Ok(connection)
}

fn create_table_sql(table: &str) -> Result<String, DatabaseError> {
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} (
            id INTEGER NOT NULL PRIMARY KEY,
            Timestamp TEXT NOT NULL DEFAULT (DATETIME(CURRENT_TIMESTAMP, 'localtime')),
            Message VARCHAR NOT NULL
        );",
        quote_identifier(table, '"')?
    ))
}

#[async_trait]
impl DatabaseManager for SqliteDatabaseManager {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    async fn ensure_tables_exist(
        &self,
        connection_string: &str,
        tables: &[TableConfiguration],
    ) -> Result<(), DatabaseError> {
        let statements = unique_table_names(tables)
            .into_iter()
            .map(|table| create_table_sql(table).map(|sql| (table.to_string(), sql)))
            .collect::<Result<Vec<_>, _>>()?;
        let connection_string = connection_string.to_string();
        let cancel = self.cancel.clone();

        tokio::task::spawn_blocking(move || {
            let mut connection = open(&connection_string)?;
            let transaction = connection.transaction()?;
            for (table, sql) in &statements {
                if cancel.is_cancelled() {
                    return Err(DatabaseError::Cancelled);
                }
                debug!(table = %table, "sqlite_ensure_table");
                transaction.execute_batch(sql)?;
            }
            transaction.commit()?;
            Ok(())
        })
        .await?
    }

    async fn write_to_database(
        &self,
        connection_string: &str,
        entries: &[DatabaseMessage],
    ) -> Result<(), DatabaseError> {
        if entries.is_empty() {
            return Ok(());
        }

        let rows = formatted_rows(entries)
            .into_iter()
            .map(|(table, timestamp, message)| {
                let sql = format!(
                    "INSERT INTO {} (Timestamp, Message) VALUES (?1, ?2)",
                    quote_identifier(&table, '"')?
                );
                Ok((sql, timestamp, message))
            })
            .collect::<Result<Vec<_>, DatabaseError>>()?;
        let connection_string = connection_string.to_string();

        tokio::task::spawn_blocking(move || {
            let mut connection = open(&connection_string)?;
            let transaction = connection.transaction()?;
            {
                for (sql, timestamp, message) in &rows {
                    let mut statement = transaction.prepare_cached(sql)?;
                    statement.execute(params![timestamp, &**message])?;
                }
            }
            transaction.commit()?;
            debug!(rows = rows.len(), "sqlite_batch_written");
            Ok(())
        })
        .await?
    }
}

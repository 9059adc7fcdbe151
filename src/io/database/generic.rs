//! Generic SQL manager over the sqlx `Any` driver
//!
//! The connection string must be a URL; its scheme picks the dialect
//! (`postgres://`/`postgresql://` or `mysql://`/`mariadb://`). Timestamps are
//! stored as text in each table's configured format.

use super::{cancellable, formatted_rows, quote_identifier, unique_table_names, DatabaseError, DatabaseManager};
use crate::domain::types::{DatabaseMessage, DatabaseType, TableConfiguration};
use crate::infra::logging::mask_connection_string;
use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const MAX_CONNECTIONS: u32 = 5;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    MySql,
}

impl Dialect {
    pub fn from_url(connection_string: &str) -> Result<Self, DatabaseError> {
        let (scheme, _) = connection_string.split_once("://").ok_or_else(|| {
            DatabaseError::InvalidConnectionString(mask_connection_string(connection_string))
        })?;
        match scheme.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::MySql),
            other => Err(DatabaseError::UnsupportedScheme(other.to_string())),
        }
    }

    fn quote(&self) -> char {
        match self {
            Self::Postgres => '"',
            Self::MySql => '`',
        }
    }

    fn create_table_statements(&self, table: &str) -> Result<Vec<String>, DatabaseError> {
        let quoted = quote_identifier(table, self.quote())?;
        let index = quote_identifier(&format!("idx_{table}_timestamp"), self.quote())?;
        Ok(match self {
            Self::Postgres => vec![
                format!(
                    "CREATE TABLE IF NOT EXISTS {quoted} (
                        id BIGSERIAL PRIMARY KEY,
                        Timestamp TEXT NOT NULL,
                        Message TEXT NOT NULL
                    )"
                ),
                format!("CREATE INDEX IF NOT EXISTS {index} ON {quoted} (Timestamp)"),
            ],
            Self::MySql => vec![format!(
                "CREATE TABLE IF NOT EXISTS {quoted} (
                    id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
                    Timestamp VARCHAR(64) NOT NULL,
                    Message TEXT NOT NULL,
                    INDEX {index} (Timestamp)
                )"
            )],
        })
    }

    fn insert_statement(&self, table: &str) -> Result<String, DatabaseError> {
        let quoted = quote_identifier(table, self.quote())?;
        Ok(match self {
            Self::Postgres => format!("INSERT INTO {quoted} (Timestamp, Message) VALUES ($1, $2)"),
            Self::MySql => format!("INSERT INTO {quoted} (Timestamp, Message) VALUES (?, ?)"),
        })
    }
}

pub struct GenericDatabaseManager {
    cancel: CancellationToken,
    pools: RwLock<FxHashMap<String, (Dialect, AnyPool)>>,
    closed: AtomicBool,
}

impl GenericDatabaseManager {
    pub fn new(cancel: CancellationToken) -> Self {
        sqlx::any::install_default_drivers();
        Self { cancel, pools: RwLock::new(FxHashMap::default()), closed: AtomicBool::new(false) }
    }

    pub fn create(cancel: CancellationToken) -> Arc<dyn DatabaseManager> {
        Arc::new(Self::new(cancel))
    }

    fn pool(&self, connection_string: &str) -> Result<(Dialect, AnyPool), DatabaseError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DatabaseError::Closed);
        }
        if let Some(entry) = self.pools.read().get(connection_string) {
            return Ok(entry.clone());
        }

        let mut pools = self.pools.write();
        if self.closed.load(Ordering::Acquire) {
            return Err(DatabaseError::Closed);
        }
        if let Some(entry) = pools.get(connection_string) {
            return Ok(entry.clone());
        }

        let dialect = Dialect::from_url(connection_string)?;
        let pool = AnyPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_lazy(connection_string)?;
        debug!(
            connection_string = %mask_connection_string(connection_string),
            dialect = ?dialect,
            "generic_pool_created"
        );
        pools.insert(connection_string.to_string(), (dialect, pool.clone()));
        Ok((dialect, pool))
    }
}

#[async_trait]
impl DatabaseManager for GenericDatabaseManager {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::GenericSql
    }

    async fn ensure_tables_exist(
        &self,
        connection_string: &str,
        tables: &[TableConfiguration],
    ) -> Result<(), DatabaseError> {
        let (dialect, pool) = self.pool(connection_string)?;
        let mut transaction = cancellable(&self.cancel, pool.begin()).await??;

        for table in unique_table_names(tables) {
            debug!(table = %table, "generic_ensure_table");
            for statement in dialect.create_table_statements(table)? {
                cancellable(&self.cancel, sqlx::query(&statement).execute(&mut *transaction)).await??;
            }
        }

        cancellable(&self.cancel, transaction.commit()).await??;
        Ok(())
    }

    async fn write_to_database(
        &self,
        connection_string: &str,
        entries: &[DatabaseMessage],
    ) -> Result<(), DatabaseError> {
        if entries.is_empty() {
            return Ok(());
        }

        let (dialect, pool) = self.pool(connection_string)?;
        let rows = formatted_rows(entries);
        let mut transaction = cancellable(&self.cancel, pool.begin()).await??;

        for (table, timestamp, message) in &rows {
            let sql = dialect.insert_statement(table)?;
            let insert = sqlx::query(&sql).bind(timestamp.as_str()).bind(&**message);
            cancellable(&self.cancel, insert.execute(&mut *transaction)).await??;
        }

        cancellable(&self.cancel, transaction.commit()).await??;
        debug!(rows = rows.len(), "generic_batch_written");
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let pools: Vec<AnyPool> = self.pools.write().drain().map(|(_, (_, pool))| pool).collect();
        for pool in pools {
            pool.close().await;
        }
        info!("generic_pools_closed");
    }
}

//! Database message handler
//!
//! One unbounded FIFO queue and one consumer task per (database type,
//! connection string). Producers never block; each consumer drains what is
//! queued, writes it as one batch, then pauses for `BATCH_PAUSE` so bursts
//! coalesce into fewer transactions.

use crate::domain::types::{BrokerConfiguration, DatabaseMessage, DatabaseType, TableConfiguration};
use crate::infra::backoff::ExponentialBackoff;
use crate::infra::logging::mask_connection_string;
use crate::io::database::{make_manager_for, DatabaseManager};
use crate::io::mqtt::MessageSink;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause between two batch writes of one queue
pub const BATCH_PAUSE: Duration = Duration::from_secs(1);
/// Upper bound for the flush performed when a queue is cancelled
pub const FINAL_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("no database manager registered for {0}")]
    MissingManager(DatabaseType),
    #[error("initialization cancelled")]
    Cancelled,
}

type Receiver = mpsc::UnboundedReceiver<DatabaseMessage>;

/// One queue's consumer side
struct Queue {
    database_type: DatabaseType,
    connection_string: String,
    receiver: Receiver,
}

enum BatchOutcome {
    Written,
    Dropped,
    Interrupted,
}

pub struct DatabaseMessageHandler {
    senders: FxHashMap<DatabaseType, FxHashMap<String, mpsc::UnboundedSender<DatabaseMessage>>>,
    queues: Mutex<Vec<Queue>>,
    managers: FxHashMap<DatabaseType, Arc<dyn DatabaseManager>>,
    pending: Arc<AtomicUsize>,
    closed: AtomicBool,
    /// Owned by the handler so the final flush outlives the generation token
    manager_cancel: CancellationToken,
}

/// Every managed (type, connection string) with the union of its tables
fn destinations(brokers: &[BrokerConfiguration]) -> BTreeMap<DatabaseType, Vec<(String, Vec<TableConfiguration>)>> {
    let mut destinations: BTreeMap<DatabaseType, Vec<(String, Vec<TableConfiguration>)>> = BTreeMap::new();

    for database in brokers.iter().flat_map(|b| b.databases()) {
        if database.database_type == DatabaseType::None {
            continue;
        }
        let entries = destinations.entry(database.database_type).or_default();
        let index = match entries.iter().position(|(cs, _)| *cs == database.connection_string) {
            Some(index) => index,
            None => {
                entries.push((database.connection_string.clone(), Vec::new()));
                entries.len() - 1
            }
        };
        let tables = &mut entries[index].1;
        for table in &database.tables {
            if !tables.iter().any(|t| t.name == table.name) {
                tables.push(table.clone());
            }
        }
    }
    destinations
}

impl DatabaseMessageHandler {
    /// Build managers and queues, and make sure every table exists.
    ///
    /// Table creation is retried with the reconnect backoff until it succeeds
    /// or `cancel` fires.
    pub async fn initialize(brokers: &[BrokerConfiguration], cancel: &CancellationToken) -> Result<Self, HandlerError> {
        Self::initialize_with(brokers, cancel, make_manager_for).await
    }

    pub(crate) async fn initialize_with<F>(
        brokers: &[BrokerConfiguration],
        cancel: &CancellationToken,
        factory: F,
    ) -> Result<Self, HandlerError>
    where
        F: Fn(DatabaseType, CancellationToken) -> Option<Arc<dyn DatabaseManager>>,
    {
        let manager_cancel = CancellationToken::new();
        let mut managers = FxHashMap::default();
        let mut senders: FxHashMap<DatabaseType, FxHashMap<String, _>> = FxHashMap::default();
        let mut queues = Vec::new();

        for (database_type, connections) in destinations(brokers) {
            let Some(manager) = factory(database_type, manager_cancel.clone()) else {
                close_all(&managers).await;
                return Err(HandlerError::MissingManager(database_type));
            };

            for (connection_string, tables) in connections {
                if let Err(e) = ensure_tables(manager.as_ref(), &connection_string, &tables, cancel).await {
                    manager_cancel.cancel();
                    manager.close().await;
                    close_all(&managers).await;
                    return Err(e);
                }

                let (sender, receiver) = mpsc::unbounded_channel();
                senders.entry(database_type).or_default().insert(connection_string.clone(), sender);
                queues.push(Queue { database_type, connection_string, receiver });
            }
            managers.insert(database_type, manager);
        }

        info!(queues = queues.len(), managers = managers.len(), "message_handler_initialized");
        Ok(Self {
            senders,
            queues: Mutex::new(queues),
            managers,
            pending: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            manager_cancel,
        })
    }

    /// Messages accepted but not yet written or dropped
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Run every queue's consumer until `cancel` fires and the final flushes end
    pub async fn handle_messages(&self, cancel: CancellationToken) {
        let queues = std::mem::take(&mut *self.queues.lock());
        let mut consumers = JoinSet::new();

        for queue in queues {
            let Some(manager) = self.managers.get(&queue.database_type).cloned() else {
                continue;
            };
            consumers.spawn(consume(queue, manager, self.pending.clone(), cancel.clone()));
        }

        while let Some(result) = consumers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "message_queue_consumer_failed");
            }
        }
    }

    /// Stop accepting messages, report what was not delivered and close the managers
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);

        let unconsumed: usize = self.queues.lock().iter_mut().map(|q| drain(&mut q.receiver).len()).sum();
        if unconsumed > 0 {
            self.pending.fetch_sub(unconsumed, Ordering::AcqRel);
            error!(messages = unconsumed, "message_handler_undelivered_messages");
        }
        let pending = self.pending();
        if pending > 0 {
            error!(messages = pending, "message_handler_messages_lost");
        }

        self.manager_cancel.cancel();
        close_all(&self.managers).await;
        info!("message_handler_stopped");
    }
}

impl MessageSink for DatabaseMessageHandler {
    fn write_message(&self, message: DatabaseMessage) {
        if self.closed.load(Ordering::Acquire) {
            debug!(database = %message.database.name, "message_dropped_handler_closed");
            return;
        }

        let database = message.database.clone();
        let Some(sender) = self
            .senders
            .get(&database.database_type)
            .and_then(|queues| queues.get(&database.connection_string))
        else {
            error!(
                database = %database.name,
                database_type = %database.database_type,
                connection_string = %mask_connection_string(&database.connection_string),
                "message_queue_missing"
            );
            return;
        };

        self.pending.fetch_add(1, Ordering::AcqRel);
        if sender.send(message).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            error!(
                database = %database.name,
                connection_string = %mask_connection_string(&database.connection_string),
                "message_enqueue_failed"
            );
        }
    }
}

async fn close_all(managers: &FxHashMap<DatabaseType, Arc<dyn DatabaseManager>>) {
    for manager in managers.values() {
        manager.close().await;
    }
}

async fn ensure_tables(
    manager: &dyn DatabaseManager,
    connection_string: &str,
    tables: &[TableConfiguration],
    cancel: &CancellationToken,
) -> Result<(), HandlerError> {
    let mut backoff = ExponentialBackoff::reconnect();
    loop {
        let created = tokio::select! {
            _ = cancel.cancelled() => return Err(HandlerError::Cancelled),
            created = manager.try_ensure_tables_exist(connection_string, tables) => created,
        };
        if created {
            debug!(
                database_type = %manager.database_type(),
                connection_string = %mask_connection_string(connection_string),
                tables = tables.len(),
                "database_tables_ready"
            );
            return Ok(());
        }

        warn!(
            connection_string = %mask_connection_string(connection_string),
            delay_ms = backoff.current_delay().as_millis() as u64,
            "database_ensure_tables_retrying"
        );
        match backoff.wait(cancel).await {
            Ok(true) => {}
            _ => return Err(HandlerError::Cancelled),
        }
    }
}

fn drain(receiver: &mut Receiver) -> Vec<DatabaseMessage> {
    let mut batch = Vec::new();
    while let Ok(message) = receiver.try_recv() {
        batch.push(message);
    }
    batch
}

async fn consume(mut queue: Queue, manager: Arc<dyn DatabaseManager>, pending: Arc<AtomicUsize>, cancel: CancellationToken) {
    let connection_string = queue.connection_string.clone();
    let masked = mask_connection_string(&connection_string);
    debug!(database_type = %queue.database_type, connection_string = %masked, "message_queue_started");

    let mut batch: Vec<DatabaseMessage> = Vec::new();
    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => break,
            message = queue.receiver.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        batch.push(first);
        batch.extend(drain(&mut queue.receiver));

        match write_batch(manager.as_ref(), &connection_string, &batch, &cancel).await {
            BatchOutcome::Written => {
                debug!(connection_string = %masked, messages = batch.len(), "message_batch_written");
            }
            BatchOutcome::Dropped => {
                error!(connection_string = %masked, messages = batch.len(), "message_batch_dropped");
            }
            BatchOutcome::Interrupted => break,
        }
        pending.fetch_sub(batch.len(), Ordering::AcqRel);
        batch.clear();

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(BATCH_PAUSE) => {}
        }
    }

    queue.receiver.close();
    batch.extend(drain(&mut queue.receiver));
    if !batch.is_empty() {
        let flushed = tokio::time::timeout(FINAL_FLUSH_TIMEOUT, manager.try_write_to_database(&connection_string, &batch))
            .await
            .unwrap_or(false);
        if flushed {
            info!(connection_string = %masked, messages = batch.len(), "message_queue_flushed");
        } else {
            error!(connection_string = %masked, messages = batch.len(), "message_queue_flush_failed");
        }
        pending.fetch_sub(batch.len(), Ordering::AcqRel);
    }
    debug!(database_type = %queue.database_type, connection_string = %masked, "message_queue_stopped");
}

/// Write one batch, retrying with bounded backoff.
///
/// A write in progress is never interrupted; cancellation is only observed
/// between attempts, leaving the batch for the final flush.
async fn write_batch(
    manager: &dyn DatabaseManager,
    connection_string: &str,
    batch: &[DatabaseMessage],
    cancel: &CancellationToken,
) -> BatchOutcome {
    let mut backoff = ExponentialBackoff::write_retry();
    loop {
        if manager.try_write_to_database(connection_string, batch).await {
            return BatchOutcome::Written;
        }
        match backoff.wait(cancel).await {
            Ok(true) => {}
            Ok(false) => return BatchOutcome::Interrupted,
            Err(_) => return BatchOutcome::Dropped,
        }
    }
}

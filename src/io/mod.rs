//! External interfaces: MQTT connections and database managers

pub mod client_id;
pub mod database;
pub mod mqtt;
pub mod tls;

pub use database::{make_manager_for, DatabaseError, DatabaseManager};
pub use mqtt::{ClientConnection, MessageSink};

//! Domain models - the merged routing model and stored messages
//!
//! - `types` - brokers, clients, subscriptions, databases and tables after merging
//! - `timestamp` - custom timestamp patterns applied when storing messages

pub mod timestamp;
pub mod types;

// Re-export commonly used types at module level
pub use timestamp::TimestampFormat;
pub use types::{
    BrokerConfiguration, ClientConfiguration, DatabaseConfiguration, DatabaseMessage,
    DatabaseType, MqttQos, SslProtocol, SubscriptionConfiguration, TableConfiguration,
    TlsConfiguration,
};

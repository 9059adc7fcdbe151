//! Merged configuration model and pipeline messages

use crate::domain::timestamp::TimestampFormat;
use crate::infra::logging::{mask_connection_string, mask_secret};
use chrono::{DateTime, Local};
use std::fmt;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

/// Database engines a message can be routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DatabaseType {
    None,
    GenericSql,
    SQLite,
    PostgreSql,
}

impl DatabaseType {
    /// Every type that has a database manager
    pub const fn managed() -> &'static [DatabaseType] {
        &[DatabaseType::SQLite, DatabaseType::GenericSql, DatabaseType::PostgreSql]
    }

    /// Case-insensitive parse of a configured type name
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Some(Self::SQLite),
            "genericsql" | "generic" | "sql" => Some(Self::GenericSql),
            "postgresql" | "postgres" => Some(Self::PostgreSql),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::GenericSql => "GenericSql",
            Self::SQLite => "SQLite",
            Self::PostgreSql => "PostgreSql",
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// MQTT quality of service level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum MqttQos {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    #[default]
    ExactlyOnce = 2,
}

impl MqttQos {
    pub fn from_level(level: i64) -> Option<Self> {
        match level {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }

    pub fn level(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for MqttQos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level())
    }
}

/// TLS protocol selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SslProtocol {
    #[default]
    Auto,
    /// Deprecated, kept for older brokers
    Tls11,
    Tls12,
    Tls13,
}

impl SslProtocol {
    pub fn parse(value: &str) -> Option<Self> {
        let lower = value.trim().to_ascii_lowercase();
        match lower.as_str() {
            "auto" => return Some(Self::Auto),
            "1" => return Some(Self::Tls11),
            "2" => return Some(Self::Tls12),
            "3" => return Some(Self::Tls13),
            _ => {}
        }

        // "1.2", "v1.2", "tls1.2", "tls 1.2", "tlsv1.2", "tls v1.2"
        let version = lower.strip_prefix("tls").map(str::trim_start).unwrap_or(&lower);
        match version.strip_prefix('v').unwrap_or(version) {
            "1.1" => Some(Self::Tls11),
            "1.2" => Some(Self::Tls12),
            "1.3" => Some(Self::Tls13),
            _ => None,
        }
    }
}

/// Effective TLS settings of one client connection
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct TlsConfiguration {
    pub enabled: bool,
    pub ssl_protocol: SslProtocol,
    pub ca_cert_path: Option<PathBuf>,
    pub self_signed_ca_cert: bool,
    pub client_cert_path: Option<PathBuf>,
    pub client_cert_password: Option<String>,
    pub allow_untrusted_certificates: bool,
    pub ignore_certificate_chain_errors: bool,
    pub ignore_certificate_revocation_errors: bool,
}

impl fmt::Debug for TlsConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfiguration")
            .field("enabled", &self.enabled)
            .field("ssl_protocol", &self.ssl_protocol)
            .field("ca_cert_path", &self.ca_cert_path)
            .field("self_signed_ca_cert", &self.self_signed_ca_cert)
            .field("client_cert_path", &self.client_cert_path)
            .field("client_cert_password", &self.client_cert_password.as_deref().map(mask_secret))
            .field("allow_untrusted_certificates", &self.allow_untrusted_certificates)
            .field("ignore_certificate_chain_errors", &self.ignore_certificate_chain_errors)
            .field("ignore_certificate_revocation_errors", &self.ignore_certificate_revocation_errors)
            .finish()
    }
}

/// A destination table and the format its timestamps are stored in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableConfiguration {
    pub name: String,
    pub timestamp_format: TimestampFormat,
}

impl TableConfiguration {
    pub fn new(name: impl Into<String>, timestamp_format: TimestampFormat) -> Self {
        Self { name: name.into(), timestamp_format }
    }
}

/// A physical database plus the tables a subscription writes to
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConfiguration {
    /// Canonical name from the configuration file
    pub name: String,
    pub database_type: DatabaseType,
    pub connection_string: String,
    pub tables: Vec<TableConfiguration>,
}

impl fmt::Debug for DatabaseConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfiguration")
            .field("name", &self.name)
            .field("database_type", &self.database_type)
            .field("connection_string", &mask_connection_string(&self.connection_string))
            .field("tables", &self.tables)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionConfiguration {
    /// Topic filter, may contain `+`/`#` wildcards
    pub topic: String,
    pub qos: MqttQos,
    pub databases: Vec<Arc<DatabaseConfiguration>>,
}

/// One MQTT connection: a set of credentials on a broker
#[derive(Clone, PartialEq, Eq)]
pub struct ClientConfiguration {
    pub user: String,
    pub password: String,
    pub tls: TlsConfiguration,
    pub subscriptions: Vec<SubscriptionConfiguration>,
}

impl fmt::Debug for ClientConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfiguration")
            .field("user", &self.user)
            .field("password", &mask_secret(&self.password))
            .field("tls", &self.tls)
            .field("subscriptions", &self.subscriptions)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfiguration {
    pub host: String,
    pub port: u16,
    pub clients: Vec<ClientConfiguration>,
}

impl BrokerConfiguration {
    /// Every (type, connection string) pair this broker routes to, with its tables
    pub fn databases(&self) -> impl Iterator<Item = &Arc<DatabaseConfiguration>> {
        self.clients
            .iter()
            .flat_map(|client| client.subscriptions.iter())
            .flat_map(|subscription| subscription.databases.iter())
    }
}

/// A received message bound for one database
#[derive(Debug, Clone)]
pub struct DatabaseMessage {
    /// Destination, carrying the tables to insert into
    pub database: Arc<DatabaseConfiguration>,
    /// Arrival time, stamped once per received message
    pub timestamp: DateTime<Local>,
    pub message: Arc<str>,
}

impl DatabaseMessage {
    pub fn new(
        database: Arc<DatabaseConfiguration>,
        timestamp: DateTime<Local>,
        message: Arc<str>,
    ) -> Self {
        Self { database, timestamp, message }
    }
}

/// Byte range of the `Data Source` value in an SQLite connection string
fn data_source_span(connection_string: &str) -> Option<Range<usize>> {
    let mut offset = 0;
    for segment in connection_string.split(';') {
        if let Some(eq) = segment.find('=') {
            if segment[..eq].trim().eq_ignore_ascii_case("data source") {
                let value = &segment[eq + 1..];
                let start = offset + eq + 1 + (value.len() - value.trim_start().len());
                let end = offset + segment.trim_end().len();
                return Some(start..end.max(start));
            }
        }
        offset += segment.len() + 1;
    }
    None
}

/// The file path named by an SQLite connection string, if any
pub fn sqlite_data_source(connection_string: &str) -> Option<&str> {
    data_source_span(connection_string)
        .map(|span| &connection_string[span])
        .filter(|path| !path.is_empty())
}

/// Replace (or prepend) the `Data Source` of an SQLite connection string
pub fn with_sqlite_data_source(connection_string: &str, path: &str) -> String {
    match data_source_span(connection_string) {
        Some(span) => format!(
            "{}{}{}",
            &connection_string[..span.start],
            path,
            &connection_string[span.end..]
        ),
        None => format!("Data Source={path};{connection_string}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_type_parse() {
        assert_eq!(DatabaseType::parse("SQLite"), Some(DatabaseType::SQLite));
        assert_eq!(DatabaseType::parse("sqlite"), Some(DatabaseType::SQLite));
        assert_eq!(DatabaseType::parse("GenericSql"), Some(DatabaseType::GenericSql));
        assert_eq!(DatabaseType::parse("postgres"), Some(DatabaseType::PostgreSql));
        assert_eq!(DatabaseType::parse("PostgreSql"), Some(DatabaseType::PostgreSql));
        assert_eq!(DatabaseType::parse("None"), None);
        assert_eq!(DatabaseType::parse("oracle"), None);
    }

    #[test]
    fn test_managed_types_exclude_none() {
        assert!(!DatabaseType::managed().contains(&DatabaseType::None));
        assert_eq!(DatabaseType::managed().len(), 3);
    }

    #[test]
    fn test_qos_levels() {
        assert_eq!(MqttQos::from_level(0), Some(MqttQos::AtMostOnce));
        assert_eq!(MqttQos::from_level(2), Some(MqttQos::ExactlyOnce));
        assert_eq!(MqttQos::from_level(3), None);
        assert_eq!(MqttQos::from_level(-1), None);
        assert!(MqttQos::ExactlyOnce > MqttQos::AtMostOnce);
        assert_eq!(MqttQos::AtLeastOnce.level(), 1);
    }

    #[test]
    fn test_ssl_protocol_parse() {
        assert_eq!(SslProtocol::parse("Auto"), Some(SslProtocol::Auto));
        for value in ["1", "1.1", "v1.1", "tls1.1", "TLS 1.1", "tlsv1.1", "tls v1.1"] {
            assert_eq!(SslProtocol::parse(value), Some(SslProtocol::Tls11), "{value}");
        }
        for value in ["2", "1.2", "v1.2", "tls1.2", "tls 1.2", "TLSv1.2", "tls v1.2"] {
            assert_eq!(SslProtocol::parse(value), Some(SslProtocol::Tls12), "{value}");
        }
        for value in ["3", "1.3", "v1.3", "tls1.3", "tls 1.3", "tlsv1.3", "tls v1.3"] {
            assert_eq!(SslProtocol::parse(value), Some(SslProtocol::Tls13), "{value}");
        }
        assert_eq!(SslProtocol::parse("ssl3"), None);
        assert_eq!(SslProtocol::parse("1.4"), None);
        assert_eq!(SslProtocol::parse(""), None);
    }

    #[test]
    fn test_sqlite_data_source() {
        assert_eq!(sqlite_data_source("Data Source=./x.db;Version=3;"), Some("./x.db"));
        assert_eq!(sqlite_data_source("Version=3; data source = /tmp/a.db"), Some("/tmp/a.db"));
        assert_eq!(sqlite_data_source("Version=3;"), None);
        assert_eq!(sqlite_data_source("Data Source=;Version=3;"), None);
    }

    #[test]
    fn test_with_sqlite_data_source() {
        assert_eq!(
            with_sqlite_data_source("Data Source=./x.db;Version=3;", "/home/x.db"),
            "Data Source=/home/x.db;Version=3;"
        );
        assert_eq!(
            with_sqlite_data_source("Version=3;", "/home/database.sqlite"),
            "Data Source=/home/database.sqlite;Version=3;"
        );
        assert_eq!(
            with_sqlite_data_source("Version=3;Data Source=a.db", "/abs/a.db"),
            "Version=3;Data Source=/abs/a.db"
        );
    }
}

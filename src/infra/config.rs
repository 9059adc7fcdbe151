//! Configuration loading from JSON files
//!
//! The configuration file lives in the service home directory. It is parsed
//! in three steps:
//! 1. `//` and `/* */` comments are stripped
//! 2. keys are lower-cased and aliases rewritten to one canonical key,
//!    single values become arrays, flat subscriptions become nested
//! 3. the normalized tree is deserialized into the raw records below
//!
//! Raw records are later folded into the routing model by `infra::merge`.

use crate::domain::timestamp::DEFAULT_TIMESTAMP_FORMAT;
use crate::infra::logging::{mask_connection_string, mask_secret};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const LOG_FILE_NAME: &str = "logs.txt";
pub const DEFAULT_SQLITE_FILE: &str = "database.sqlite";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("couldn't parse \"{0}\" as an SSL protocol")]
    InvalidSslProtocol(String),
    #[error("invalid QoS {0}, expected 0, 1 or 2")]
    InvalidQos(i64),
    #[error("invalid configuration: {0}")]
    Shape(String),
}

/// Locations the service reads and writes, computed once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePaths {
    pub home_directory: PathBuf,
    pub config_file: PathBuf,
    pub log_file: PathBuf,
}

impl ServicePaths {
    /// Paths inside `home`. A relative home is resolved against the
    /// current directory.
    pub fn new(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        let home_directory = if home.is_absolute() {
            home
        } else {
            env::current_dir().map(|cwd| cwd.join(&home)).unwrap_or(home)
        };

        Self {
            config_file: home_directory.join(CONFIG_FILE_NAME),
            log_file: home_directory.join(LOG_FILE_NAME),
            home_directory,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct RawConfiguration {
    pub databases: Vec<RawDatabase>,
    pub brokers: Vec<RawBroker>,
}

#[derive(Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawDatabase {
    pub name: String,
    #[serde(rename = "type")]
    pub database_type: String,
    #[serde(rename = "connectionstring")]
    pub connection_string: String,
}

impl Default for RawDatabase {
    fn default() -> Self {
        Self {
            name: "sqlite".to_string(),
            database_type: "SQLite".to_string(),
            connection_string: String::new(),
        }
    }
}

impl fmt::Debug for RawDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawDatabase")
            .field("name", &self.name)
            .field("type", &self.database_type)
            .field("connection_string", &mask_connection_string(&self.connection_string))
            .finish()
    }
}

/// One broker entry. Each entry is one set of credentials; entries sharing
/// host and port are merged into one broker.
#[derive(Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawBroker {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub tls: Option<RawTls>,
    pub subscriptions: Vec<RawSubscription>,
}

impl Default for RawBroker {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            user: String::new(),
            password: String::new(),
            tls: None,
            subscriptions: Vec::new(),
        }
    }
}

impl fmt::Debug for RawBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawBroker")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &mask_secret(&self.password))
            .field("tls", &self.tls)
            .field("subscriptions", &self.subscriptions)
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(default)]
pub struct RawTls {
    pub enable: bool,
    #[serde(rename = "sslprotocol")]
    pub ssl_protocol: String,
    #[serde(rename = "cacertpath")]
    pub ca_cert_path: Option<String>,
    #[serde(rename = "selfsignedcacert")]
    pub self_signed_ca_cert: bool,
    #[serde(rename = "clientcertpath")]
    pub client_cert_path: Option<String>,
    #[serde(rename = "clientcertpass")]
    pub client_cert_pass: Option<String>,
    #[serde(rename = "allowuntrustedcertificates")]
    pub allow_untrusted_certificates: bool,
    #[serde(rename = "ignorecertificatechainerrors")]
    pub ignore_certificate_chain_errors: bool,
    #[serde(rename = "ignorecertificaterevocationerrors")]
    pub ignore_certificate_revocation_errors: bool,
}

impl Default for RawTls {
    fn default() -> Self {
        Self {
            enable: false,
            ssl_protocol: "auto".to_string(),
            ca_cert_path: None,
            self_signed_ca_cert: false,
            client_cert_path: None,
            client_cert_pass: None,
            allow_untrusted_certificates: false,
            ignore_certificate_chain_errors: false,
            ignore_certificate_revocation_errors: false,
        }
    }
}

impl fmt::Debug for RawTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawTls")
            .field("enable", &self.enable)
            .field("ssl_protocol", &self.ssl_protocol)
            .field("ca_cert_path", &self.ca_cert_path)
            .field("self_signed_ca_cert", &self.self_signed_ca_cert)
            .field("client_cert_path", &self.client_cert_path)
            .field("client_cert_pass", &self.client_cert_pass.as_deref().map(mask_secret))
            .field("allow_untrusted_certificates", &self.allow_untrusted_certificates)
            .field("ignore_certificate_chain_errors", &self.ignore_certificate_chain_errors)
            .field("ignore_certificate_revocation_errors", &self.ignore_certificate_revocation_errors)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawSubscription {
    pub topic: String,
    pub qos: i64,
    pub databases: Vec<RawTable>,
}

impl Default for RawSubscription {
    fn default() -> Self {
        Self { topic: "sql".to_string(), qos: 2, databases: Vec::new() }
    }
}

/// A (database name, table, timestamp format) reference inside a subscription
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawTable {
    pub name: String,
    pub table: String,
    #[serde(rename = "timestampformat")]
    pub timestamp_format: String,
}

impl Default for RawTable {
    fn default() -> Self {
        Self {
            name: "sqlite".to_string(),
            table: "mqtt".to_string(),
            timestamp_format: DEFAULT_TIMESTAMP_FORMAT.to_string(),
        }
    }
}

const ROOT_DATABASES: &[&str] = &["databases", "database"];
const ROOT_BROKERS: &[&str] = &["brokers", "broker"];
const BROKER_USER: &[&str] = &["user", "username"];
const BROKER_SUBSCRIPTIONS: &[&str] = &["subscriptions", "subscription"];
const TLS_ENABLE: &[&str] = &["enable", "enabled"];
const SUBSCRIPTION_DATABASES_PLURAL: &[&str] = &["databases", "bases", "dbs"];
const SUBSCRIPTION_DATABASES_SINGLE: &[&str] = &["database", "base", "db"];
const TABLE_NAME: &[&str] = &["name", "databasename", "database", "basename", "base", "dbname", "db"];

/// Load and normalize the configuration file
pub fn load_configuration(path: &Path) -> Result<RawConfiguration, ConfigError> {
    info!(path = %path.display(), "config_loading");

    let content = fs::read_to_string(path)
        .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
    let configuration = parse_configuration(&content)?;

    debug!(configuration = ?configuration, "config_parsed");
    Ok(configuration)
}

/// Parse configuration text (comments allowed)
pub fn parse_configuration(content: &str) -> Result<RawConfiguration, ConfigError> {
    let stripped = strip_comments(content);
    if stripped.trim().is_empty() {
        return Err(ConfigError::Shape("configuration file is empty".to_string()));
    }

    let value: Value = serde_json::from_str(&stripped)?;
    let normalized = normalize(value)?;
    Ok(serde_json::from_value(normalized)?)
}

/// Remove `//` and `/* */` comments outside string literals
pub fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                }
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match (c, chars.peek()) {
            ('"', _) => {
                in_string = true;
                out.push(c);
            }
            ('/', Some('/')) => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for skipped in chars.by_ref() {
                    if prev == '*' && skipped == '/' {
                        break;
                    }
                    if skipped == '\n' {
                        out.push('\n');
                    }
                    prev = skipped;
                }
            }
            _ => out.push(c),
        }
    }

    out
}

/// Canonicalize keys and shapes of a parsed configuration tree
pub fn normalize(value: Value) -> Result<Value, ConfigError> {
    let Value::Object(mut root) = lowercase_keys(value) else {
        return Err(ConfigError::Shape("root must be a JSON object".to_string()));
    };

    rename(&mut root, ROOT_DATABASES, "databases");
    rename(&mut root, ROOT_BROKERS, "brokers");

    if let Some(databases) = root.remove("databases") {
        root.insert("databases".to_string(), Value::Array(into_array(databases)));
    }

    if let Some(brokers) = root.remove("brokers") {
        let brokers = into_array(brokers).into_iter().map(normalize_broker).collect();
        root.insert("brokers".to_string(), Value::Array(brokers));
    }

    Ok(Value::Object(root))
}

fn normalize_broker(broker: Value) -> Value {
    let Value::Object(mut broker) = broker else {
        return broker;
    };

    rename(&mut broker, BROKER_USER, "user");
    rename(&mut broker, BROKER_SUBSCRIPTIONS, "subscriptions");

    if let Some(Value::Object(tls)) = broker.get_mut("tls") {
        rename(tls, TLS_ENABLE, "enable");
    }

    if let Some(subscriptions) = broker.remove("subscriptions") {
        let subscriptions =
            into_array(subscriptions).into_iter().map(normalize_subscription).collect();
        broker.insert("subscriptions".to_string(), Value::Array(subscriptions));
    }

    Value::Object(broker)
}

fn normalize_subscription(subscription: Value) -> Value {
    let Value::Object(mut subscription) = subscription else {
        return subscription;
    };

    let has_plural = SUBSCRIPTION_DATABASES_PLURAL.iter().any(|key| subscription.contains_key(*key));
    let single = SUBSCRIPTION_DATABASES_SINGLE.iter().find_map(|key| subscription.get(*key));
    let is_flat = !has_plural
        && match single {
            Some(Value::String(_)) => true,
            Some(_) => false,
            None => subscription.contains_key("table") || subscription.contains_key("timestampformat"),
        };

    if is_flat {
        let mut entry = Map::new();
        for key in SUBSCRIPTION_DATABASES_SINGLE {
            if let Some(name) = subscription.remove(*key) {
                entry.entry("name").or_insert(name);
            }
        }
        for key in ["table", "timestampformat"] {
            if let Some(value) = subscription.remove(key) {
                entry.insert(key.to_string(), value);
            }
        }
        subscription.insert("databases".to_string(), Value::Array(vec![Value::Object(entry)]));
        return Value::Object(subscription);
    }

    let aliases: Vec<&str> = SUBSCRIPTION_DATABASES_PLURAL
        .iter()
        .chain(SUBSCRIPTION_DATABASES_SINGLE)
        .copied()
        .collect();
    rename(&mut subscription, &aliases, "databases");

    if let Some(tables) = subscription.remove("databases") {
        let tables = into_array(tables)
            .into_iter()
            .map(|table| match table {
                Value::Object(mut table) => {
                    rename(&mut table, TABLE_NAME, "name");
                    Value::Object(table)
                }
                other => other,
            })
            .collect();
        subscription.insert("databases".to_string(), Value::Array(tables));
    }

    Value::Object(subscription)
}

/// Lower-case every object key and drop explicit nulls so defaults apply
fn lowercase_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.to_lowercase(), lowercase_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(lowercase_keys).collect()),
        other => other,
    }
}

/// Move the first present alias to `canonical`, discarding the others
fn rename(map: &mut Map<String, Value>, aliases: &[&str], canonical: &str) {
    let mut found = map.remove(canonical);
    for alias in aliases.iter().filter(|alias| **alias != canonical) {
        if let Some(value) = map.remove(*alias) {
            found.get_or_insert(value);
        }
    }
    if let Some(value) = found {
        map.insert(canonical.to_string(), value);
    }
}

fn into_array(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_service_paths() {
        let paths = ServicePaths::new("/srv/mqtt-sql");
        assert_eq!(paths.config_file, PathBuf::from("/srv/mqtt-sql/config.json"));
        assert_eq!(paths.log_file, PathBuf::from("/srv/mqtt-sql/logs.txt"));
        assert_eq!(paths.home_directory, PathBuf::from("/srv/mqtt-sql"));
    }

    #[test]
    fn test_relative_home_is_made_absolute() {
        let paths = ServicePaths::new("home");
        assert!(paths.home_directory.is_absolute());
    }

    #[test]
    fn test_strip_comments() {
        let input = "{\n  // line\n  \"a\": \"http://x\", /* block\n */ \"b\": 1\n}";
        let stripped = strip_comments(input);
        let value: Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(value, json!({"a": "http://x", "b": 1}));
    }

    #[test]
    fn test_strip_comments_keeps_escaped_quotes() {
        let input = r#"{"a": "say \"//hi\""}"#;
        assert_eq!(strip_comments(input), input);
    }

    #[test]
    fn test_defaults_applied() {
        let config = parse_configuration(r#"{"Brokers": [{"Subscriptions": [{}]}]}"#).unwrap();
        assert!(config.databases.is_empty());
        let broker = &config.brokers[0];
        assert_eq!(broker.host, "localhost");
        assert_eq!(broker.port, 1883);
        assert_eq!(broker.tls, None);
        assert_eq!(broker.subscriptions[0].topic, "sql");
        assert_eq!(broker.subscriptions[0].qos, 2);
        assert!(broker.subscriptions[0].databases.is_empty());
    }

    #[test]
    fn test_aliases_and_single_values() {
        let config = parse_configuration(
            r#"{
                "Database": {"Name": "main", "Type": "SQLite", "ConnectionString": "Data Source=a.db"},
                "BROKER": {
                    "Host": "mqtt.local", "UserName": "bob",
                    "Tls": {"Enabled": true},
                    "Subscription": {"Topic": "t", "QOS": 1, "Db": {"DbName": "main", "Table": "x"}}
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.databases.len(), 1);
        assert_eq!(config.databases[0].name, "main");
        let broker = &config.brokers[0];
        assert_eq!(broker.user, "bob");
        assert!(broker.tls.as_ref().unwrap().enable);
        let subscription = &broker.subscriptions[0];
        assert_eq!(subscription.qos, 1);
        assert_eq!(
            subscription.databases,
            vec![RawTable {
                name: "main".to_string(),
                table: "x".to_string(),
                timestamp_format: DEFAULT_TIMESTAMP_FORMAT.to_string(),
            }]
        );
    }

    #[test]
    fn test_flat_subscription_matches_nested() {
        let flat = parse_configuration(
            r#"{"brokers": [{"subscriptions": [
                {"topic": "a", "database": "main", "table": "t", "timestampFormat": "HH:mm"}
            ]}]}"#,
        )
        .unwrap();
        let nested = parse_configuration(
            r#"{"brokers": [{"subscriptions": [
                {"topic": "a", "databases": [{"name": "main", "table": "t", "timestampFormat": "HH:mm"}]}
            ]}]}"#,
        )
        .unwrap();
        assert_eq!(flat, nested);
    }

    #[test]
    fn test_flat_subscription_table_only() {
        let config =
            parse_configuration(r#"{"brokers": {"subscriptions": {"topic": "a", "table": "t"}}}"#)
                .unwrap();
        let tables = &config.brokers[0].subscriptions[0].databases;
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, "sqlite");
        assert_eq!(tables[0].table, "t");
    }

    #[test]
    fn test_nulls_fall_back_to_defaults() {
        let config = parse_configuration(r#"{"brokers": [{"host": null, "port": 1884}]}"#).unwrap();
        assert_eq!(config.brokers[0].host, "localhost");
        assert_eq!(config.brokers[0].port, 1884);
    }

    #[test]
    fn test_structural_errors() {
        assert!(matches!(parse_configuration(""), Err(ConfigError::Shape(_))));
        assert!(matches!(parse_configuration("[]"), Err(ConfigError::Shape(_))));
        assert!(matches!(parse_configuration("{"), Err(ConfigError::Json(_))));
        assert!(matches!(
            parse_configuration(r#"{"brokers": [{"port": "abc"}]}"#),
            Err(ConfigError::Json(_))
        ));
    }
}

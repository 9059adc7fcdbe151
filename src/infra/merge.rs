//! Folding raw configuration records into the routing model
//!
//! Brokers are grouped by (host, port), clients by (user, password),
//! subscriptions by topic, and table references by database, table and
//! timestamp format. Every unit that cannot be used is dropped with a
//! warning; only structural problems (bad SSL protocol, bad QoS) fail the
//! whole load. Empty nodes are pruned bottom-up.

use crate::domain::timestamp::TimestampFormat;
use crate::domain::types::{
    sqlite_data_source, with_sqlite_data_source, BrokerConfiguration, ClientConfiguration,
    DatabaseConfiguration, DatabaseType, MqttQos, SslProtocol, SubscriptionConfiguration,
    TableConfiguration, TlsConfiguration,
};
use crate::infra::config::{ConfigError, RawBroker, RawConfiguration, RawTable, RawTls, DEFAULT_SQLITE_FILE};
use crate::infra::logging::{mask_connection_string, mask_secret};
use rustc_hash::FxHashMap;
use std::hash::Hash;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Name of the database synthesized when none are configured
pub const DEFAULT_DATABASE_NAME: &str = "sqlite";

/// A configured database before tables are attached
#[derive(Debug, Clone)]
struct KnownDatabase {
    database_type: DatabaseType,
    connection_string: String,
}

/// Databases by name plus the names collapsed onto another by connection string
#[derive(Debug, Default)]
struct DatabaseCatalog {
    by_name: FxHashMap<String, KnownDatabase>,
    same_connection: FxHashMap<String, String>,
}

impl DatabaseCatalog {
    fn canonical_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.same_connection.get(name).map(String::as_str).unwrap_or(name)
    }
}

/// Merge a raw configuration into brokers ready to connect.
///
/// `base_directory` anchors relative SQLite and certificate paths.
pub fn to_service_configuration(
    raw: &RawConfiguration,
    base_directory: &Path,
) -> Result<Vec<BrokerConfiguration>, ConfigError> {
    let catalog = build_catalog(raw, base_directory);
    let mut brokers = Vec::new();

    for ((host, port), raw_brokers) in group_by(&raw.brokers, |b| (b.host.clone(), b.port)) {
        let mut clients = Vec::new();

        for ((user, password), entries) in
            group_by(raw_brokers, |b| (b.user.clone(), b.password.clone()))
        {
            let tls = resolve_tls(&entries, &host, port, &user, &password, base_directory)?;
            let subscriptions = merge_subscriptions(&entries, &catalog)?;

            if subscriptions.is_empty() {
                warn!(
                    host = %host,
                    port = port,
                    user = %user,
                    password = %mask_secret(&password),
                    "client_without_subscriptions_discarded"
                );
                continue;
            }

            clients.push(ClientConfiguration { user, password, tls, subscriptions });
        }

        if clients.is_empty() {
            warn!(host = %host, port = port, "broker_without_clients_discarded");
            continue;
        }

        brokers.push(BrokerConfiguration { host, port, clients });
    }

    for broker in &brokers {
        debug!(broker = ?broker, "config_merged");
    }

    Ok(brokers)
}

fn build_catalog(raw: &RawConfiguration, base_directory: &Path) -> DatabaseCatalog {
    let mut catalog = DatabaseCatalog::default();

    if raw.databases.is_empty() {
        let path = resolve_path(base_directory, DEFAULT_SQLITE_FILE);
        catalog.by_name.insert(
            DEFAULT_DATABASE_NAME.to_string(),
            KnownDatabase {
                database_type: DatabaseType::SQLite,
                connection_string: format!("Data Source={};Version=3;", path.display()),
            },
        );
        return catalog;
    }

    let mut name_by_connection: FxHashMap<String, String> = FxHashMap::default();

    for db in &raw.databases {
        if db.name.is_empty() {
            warn!(
                connection_string = %mask_connection_string(&db.connection_string),
                "database_empty_name_discarded"
            );
            continue;
        }

        if catalog.by_name.contains_key(&db.name) || catalog.same_connection.contains_key(&db.name) {
            warn!(database = %db.name, "database_duplicate_name_discarded");
            continue;
        }

        let Some(database_type) = DatabaseType::parse(&db.database_type) else {
            warn!(database = %db.name, database_type = %db.database_type, "database_invalid_type_discarded");
            continue;
        };

        let connection_string = match database_type {
            DatabaseType::SQLite => canonical_sqlite_connection_string(&db.connection_string, base_directory),
            _ if db.connection_string.trim().is_empty() => {
                warn!(database = %db.name, "database_missing_connection_string_discarded");
                continue;
            }
            _ => db.connection_string.clone(),
        };

        if let Some(existing) = name_by_connection.get(&connection_string) {
            warn!(
                database = %db.name,
                existing = %existing,
                connection_string = %mask_connection_string(&connection_string),
                "database_same_connection_string"
            );
            catalog.same_connection.insert(db.name.clone(), existing.clone());
            continue;
        }

        name_by_connection.insert(connection_string.clone(), db.name.clone());
        catalog
            .by_name
            .insert(db.name.clone(), KnownDatabase { database_type, connection_string });
    }

    catalog
}

/// One TLS configuration per merged client: the single distinct one, or the
/// first enabled one when several differ.
fn resolve_tls(
    entries: &[&RawBroker],
    host: &str,
    port: u16,
    user: &str,
    password: &str,
    base_directory: &Path,
) -> Result<TlsConfiguration, ConfigError> {
    let mut distinct: Vec<Option<&RawTls>> = Vec::new();
    for entry in entries {
        let tls = entry.tls.as_ref();
        if !distinct.contains(&tls) {
            distinct.push(tls);
        }
    }

    let default = RawTls::default();
    let chosen = match distinct.as_slice() {
        [] => &default,
        [single] => single.unwrap_or(&default),
        several => {
            warn!(
                host = %host,
                port = port,
                user = %user,
                password = %mask_secret(password),
                "client_multiple_tls_configurations"
            );
            several.iter().flatten().find(|tls| tls.enable).copied().unwrap_or(&default)
        }
    };

    let ssl_protocol = SslProtocol::parse(&chosen.ssl_protocol)
        .ok_or_else(|| ConfigError::InvalidSslProtocol(chosen.ssl_protocol.clone()))?;

    Ok(TlsConfiguration {
        enabled: chosen.enable,
        ssl_protocol,
        ca_cert_path: chosen.ca_cert_path.as_deref().map(|p| resolve_path(base_directory, p)),
        self_signed_ca_cert: chosen.self_signed_ca_cert,
        client_cert_path: chosen.client_cert_path.as_deref().map(|p| resolve_path(base_directory, p)),
        client_cert_password: chosen.client_cert_pass.clone(),
        allow_untrusted_certificates: chosen.allow_untrusted_certificates,
        ignore_certificate_chain_errors: chosen.ignore_certificate_chain_errors,
        ignore_certificate_revocation_errors: chosen.ignore_certificate_revocation_errors,
    })
}

fn merge_subscriptions(
    entries: &[&RawBroker],
    catalog: &DatabaseCatalog,
) -> Result<Vec<SubscriptionConfiguration>, ConfigError> {
    let raw_subscriptions = entries.iter().flat_map(|entry| entry.subscriptions.iter());
    let mut subscriptions = Vec::new();

    for (topic, same_topic) in group_by(raw_subscriptions, |s| s.topic.clone()) {
        let mut qos = MqttQos::AtMostOnce;
        for subscription in &same_topic {
            let level = MqttQos::from_level(subscription.qos)
                .ok_or(ConfigError::InvalidQos(subscription.qos))?;
            qos = qos.max(level);
        }

        let tables = same_topic.iter().flat_map(|s| s.databases.iter());
        let databases = merge_databases(&topic, tables, catalog);

        if databases.is_empty() {
            warn!(topic = %topic, "subscription_without_databases_discarded");
            continue;
        }

        subscriptions.push(SubscriptionConfiguration { topic, qos, databases });
    }

    Ok(subscriptions)
}

fn merge_databases<'a>(
    topic: &str,
    tables: impl Iterator<Item = &'a RawTable>,
    catalog: &DatabaseCatalog,
) -> Vec<Arc<DatabaseConfiguration>> {
    let mut databases = Vec::new();

    for (name, same_database) in group_by(tables, |t| catalog.canonical_name(&t.name).to_string()) {
        let Some(known) = catalog.by_name.get(&name) else {
            warn!(topic = %topic, database = %name, "subscription_unknown_database_discarded");
            continue;
        };

        let mut merged_tables = Vec::new();
        for (table, same_table) in group_by(same_database, |t| t.table.clone()) {
            let patterns = group_by(same_table, |t| t.timestamp_format.clone()).into_iter().map(|(pattern, _)| pattern);
            let (timestamp_format, dropped) = select_timestamp_format(patterns);

            if let Some(kept) = &timestamp_format {
                for format in &dropped {
                    warn!(
                        database = %name,
                        table = %table,
                        kept = %kept,
                        dropped = %format,
                        "table_multiple_timestamp_formats"
                    );
                }
            }

            match timestamp_format {
                Some(format) => merged_tables.push(TableConfiguration::new(table, format)),
                None => warn!(database = %name, table = %table, "table_invalid_timestamp_format_discarded"),
            }
        }

        if merged_tables.is_empty() {
            warn!(topic = %topic, database = %name, "database_without_tables_discarded");
            continue;
        }

        databases.push(Arc::new(DatabaseConfiguration {
            name,
            database_type: known.database_type,
            connection_string: known.connection_string.clone(),
            tables: merged_tables,
        }));
    }

    databases
}

/// Absolute form of an SQLite connection string rooted at `base_directory`.
///
/// A blank connection string becomes `Version=3;` and a missing data
/// source points at `database.sqlite`. Applying it twice changes nothing.
pub fn canonical_sqlite_connection_string(connection_string: &str, base_directory: &Path) -> String {
    let connection_string =
        if connection_string.trim().is_empty() { "Version=3;" } else { connection_string };
    let path = sqlite_data_source(connection_string).unwrap_or(DEFAULT_SQLITE_FILE);

    if path == ":memory:" {
        return with_sqlite_data_source(connection_string, path);
    }

    let absolute = resolve_path(base_directory, path);
    with_sqlite_data_source(connection_string, &absolute.to_string_lossy())
}

/// Resolve `path` against `base_directory` and collapse `.`/`..` components
pub fn resolve_path(base_directory: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        return path.to_path_buf();
    }

    let mut resolved = PathBuf::new();
    for component in base_directory.join(path).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            other => resolved.push(other.as_os_str()),
        }
    }
    resolved
}

/// Order-preserving grouping: groups appear in first-seen order and keep
/// their members in input order.
/// First valid pattern of a table, plus every later valid pattern that loses to it
fn select_timestamp_format(patterns: impl IntoIterator<Item = String>) -> (Option<TimestampFormat>, Vec<TimestampFormat>) {
    let mut kept = None;
    let mut dropped = Vec::new();
    for format in patterns.into_iter().filter_map(|pattern| TimestampFormat::parse(&pattern)) {
        if kept.is_none() {
            kept = Some(format);
        } else {
            dropped.push(format);
        }
    }
    (kept, dropped)
}

fn group_by<T, K, I, F>(items: I, key: F) -> Vec<(K, Vec<T>)>
where
    I: IntoIterator<Item = T>,
    K: Eq + Hash + Clone,
    F: Fn(&T) -> K,
{
    let mut index: FxHashMap<K, usize> = FxHashMap::default();
    let mut groups: Vec<(K, Vec<T>)> = Vec::new();

    for item in items {
        let k = key(&item);
        match index.get(&k) {
            Some(&i) => groups[i].1.push(item),
            None => {
                index.insert(k.clone(), groups.len());
                groups.push((k, vec![item]));
            }
        }
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::config::parse_configuration;

    #[test]
    fn test_group_by_preserves_order() {
        let groups = group_by(vec![3, 1, 4, 1, 5, 9, 2, 6], |n| n % 3);
        assert_eq!(groups, vec![(0, vec![3, 9, 6]), (1, vec![1, 4, 1]), (2, vec![5, 2])]);
    }

    #[test]
    fn test_every_conflicting_format_is_dropped() {
        let patterns = ["", "yyyy-MM-dd", "HH:mm", "yyyyMMdd", "'none'"].map(String::from);
        let (kept, dropped) = select_timestamp_format(patterns);

        assert_eq!(kept.unwrap().as_str(), "yyyy-MM-dd");
        let dropped: Vec<&str> = dropped.iter().map(|f| f.as_str()).collect();
        assert_eq!(dropped, vec!["HH:mm", "yyyyMMdd"]);
    }

    #[test]
    fn test_resolve_path() {
        let base = Path::new("/srv/home");
        assert_eq!(resolve_path(base, "./x.db"), PathBuf::from("/srv/home/x.db"));
        assert_eq!(resolve_path(base, "../x.db"), PathBuf::from("/srv/x.db"));
        assert_eq!(resolve_path(base, "data/./x.db"), PathBuf::from("/srv/home/data/x.db"));
        assert_eq!(resolve_path(base, "/var/x.db"), PathBuf::from("/var/x.db"));
    }

    #[test]
    fn test_canonical_sqlite_connection_string() {
        let base = Path::new("/srv/home");
        assert_eq!(
            canonical_sqlite_connection_string("", base),
            "Data Source=/srv/home/database.sqlite;Version=3;"
        );
        assert_eq!(
            canonical_sqlite_connection_string("Data Source=./x.db;Version=3;", base),
            "Data Source=/srv/home/x.db;Version=3;"
        );
        assert_eq!(
            canonical_sqlite_connection_string("Data Source=:memory:", base),
            "Data Source=:memory:"
        );
    }

    #[test]
    fn test_canonical_sqlite_connection_string_is_idempotent() {
        let base = Path::new("/srv/home");
        let once = canonical_sqlite_connection_string("Data Source=x.db", base);
        let twice = canonical_sqlite_connection_string(&once, base);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_alias_database_keeps_its_tables() {
        let raw = parse_configuration(
            r#"{
                "databases": [
                    {"name": "a", "connectionString": "Data Source=x.db"},
                    {"name": "b", "connectionString": "Data Source=./x.db"}
                ],
                "brokers": [{"subscriptions": [{"topic": "t", "databases": [
                    {"name": "a", "table": "one"},
                    {"name": "b", "table": "two"}
                ]}]}]
            }"#,
        )
        .unwrap();

        let brokers = to_service_configuration(&raw, Path::new("/srv/home")).unwrap();
        let databases = &brokers[0].clients[0].subscriptions[0].databases;
        assert_eq!(databases.len(), 1);
        assert_eq!(databases[0].name, "a");
        let tables: Vec<_> = databases[0].tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(tables, vec!["one", "two"]);
    }

    #[test]
    fn test_invalid_ssl_protocol_is_fatal() {
        let raw = parse_configuration(
            r#"{"brokers": [{"tls": {"enable": true, "sslProtocol": "ssl3"},
                "subscriptions": [{"topic": "t", "table": "x"}]}]}"#,
        )
        .unwrap();
        let result = to_service_configuration(&raw, Path::new("/srv/home"));
        assert!(matches!(result, Err(ConfigError::InvalidSslProtocol(p)) if p == "ssl3"));
    }

    #[test]
    fn test_invalid_qos_is_fatal() {
        let raw = parse_configuration(r#"{"brokers": [{"subscriptions": [{"topic": "t", "qos": 3}]}]}"#)
            .unwrap();
        let result = to_service_configuration(&raw, Path::new("/srv/home"));
        assert!(matches!(result, Err(ConfigError::InvalidQos(3))));
    }
}

//! Integration tests for configuration loading

use mqtt_sql::infra::config::{load_configuration, ConfigError, ServicePaths};
use pretty_assertions::assert_eq;
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
// bridge configuration
{
    "Databases": [
        { "Name": "local", "Type": "sqlite", "ConnectionString": "Data Source=./local.sqlite;" },
        { "name": "warehouse", "type": "postgres", "connectionString": "postgres://app@db/mqtt" }
    ],
    "Broker": {
        "Host": "broker.local",
        "Port": 8883,
        "Username": "bridge",
        "Password": "secret",
        "TLS": { "Enabled": true, "SslProtocol": "tls v1.2", "CaCertPath": "certs/ca.pem" },
        /* one flat, one nested */
        "Subscriptions": [
            { "Topic": "sensors/#", "QOS": 1, "Database": "local", "Table": "sensors" },
            { "topic": "events", "databases": [ { "db": "warehouse", "table": "events", "timestampFormat": "yyyy-MM-dd" } ] }
        ]
    }
}
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = load_configuration(temp_file.path()).unwrap();

    assert_eq!(config.databases.len(), 2);
    assert_eq!(config.databases[0].name, "local");
    assert_eq!(config.databases[1].database_type, "postgres");

    assert_eq!(config.brokers.len(), 1);
    let broker = &config.brokers[0];
    assert_eq!(broker.host, "broker.local");
    assert_eq!(broker.port, 8883);
    assert_eq!(broker.user, "bridge");

    let tls = broker.tls.as_ref().unwrap();
    assert!(tls.enable);
    assert_eq!(tls.ssl_protocol, "tls v1.2");
    assert_eq!(tls.ca_cert_path.as_deref(), Some("certs/ca.pem"));

    assert_eq!(broker.subscriptions.len(), 2);
    let flat = &broker.subscriptions[0];
    assert_eq!(flat.topic, "sensors/#");
    assert_eq!(flat.qos, 1);
    assert_eq!(flat.databases.len(), 1);
    assert_eq!(flat.databases[0].name, "local");
    assert_eq!(flat.databases[0].table, "sensors");
    assert_eq!(flat.databases[0].timestamp_format, "yyyy-MM-dd HH:mm:ss");

    let nested = &broker.subscriptions[1];
    assert_eq!(nested.qos, 2);
    assert_eq!(nested.databases[0].name, "warehouse");
    assert_eq!(nested.databases[0].timestamp_format, "yyyy-MM-dd");
}

#[test]
fn test_missing_file_is_an_io_error() {
    let result = load_configuration(std::path::Path::new("/nonexistent/config.json"));
    assert!(matches!(result, Err(ConfigError::Io { .. })));
}

#[test]
fn test_malformed_json_is_an_error() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"{ \"brokers\": [ { \"host\": } ] }").unwrap();
    temp_file.flush().unwrap();

    assert!(matches!(load_configuration(temp_file.path()), Err(ConfigError::Json(_))));
}

#[test]
fn test_service_paths_layout() {
    let dir = tempfile::tempdir().unwrap();
    let paths = ServicePaths::new(dir.path());
    assert_eq!(paths.config_file, dir.path().join("config.json"));
    assert_eq!(paths.log_file, dir.path().join("logs.txt"));
    assert_eq!(paths.home_directory, dir.path());
}

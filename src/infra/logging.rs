//! Structured logging setup and secret masking
//!
//! Log level is controlled with `RUST_LOG` (default: info). tracing has no
//! level above ERROR, so critical events are `error!` with `critical = true`.

use anyhow::Context;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber, writing to `log_file` when given, else stdout
pub fn init(log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {e}"))
        }
        None => builder
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {e}")),
    }
}

/// Replace every character of a secret with `*`
pub fn redact(secret: &str) -> String {
    "*".repeat(secret.chars().count())
}

/// Mask `password=`/`pwd=` values and URL passwords in a connection string
pub fn redact_connection_string(connection_string: &str) -> String {
    if let Some(scheme_end) = connection_string.find("://") {
        let rest = &connection_string[scheme_end + 3..];
        let authority_end = rest.find('/').unwrap_or(rest.len());
        if let Some(at) = rest[..authority_end].rfind('@') {
            if let Some(colon) = rest[..at].find(':') {
                let start = scheme_end + 3 + colon + 1;
                let end = scheme_end + 3 + at;
                return format!(
                    "{}{}{}",
                    &connection_string[..start],
                    redact(&connection_string[start..end]),
                    &connection_string[end..]
                );
            }
        }
        return connection_string.to_string();
    }

    connection_string
        .split(';')
        .map(|segment| match segment.find('=') {
            Some(eq)
                if matches!(
                    segment[..eq].trim().to_ascii_lowercase().as_str(),
                    "password" | "pwd"
                ) =>
            {
                format!("{}={}", &segment[..eq], redact(&segment[eq + 1..]))
            }
            _ => segment.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Secret as it may appear in logs: verbatim in debug builds, masked otherwise
pub fn mask_secret(secret: &str) -> String {
    if cfg!(debug_assertions) {
        secret.to_string()
    } else {
        redact(secret)
    }
}

/// Connection string as it may appear in logs
pub fn mask_connection_string(connection_string: &str) -> String {
    if cfg!(debug_assertions) {
        connection_string.to_string()
    } else {
        redact_connection_string(connection_string)
    }
}

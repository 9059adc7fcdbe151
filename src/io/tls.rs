//! TLS transport for broker connections

use crate::domain::types::{SslProtocol, TlsConfiguration};
use rumqttc::Transport;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
#[error("failed to read certificate {path}: {source}")]
pub struct TlsError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

fn read(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError { path: path.to_path_buf(), source })
}

/// Build the rustls transport for `tls`, or `None` when TLS is disabled.
///
/// The client certificate file must hold the PEM certificate chain followed
/// by its private key.
pub fn transport(tls: &TlsConfiguration, client_id: &str) -> Result<Option<Transport>, TlsError> {
    if !tls.enabled {
        return Ok(None);
    }

    if tls.ssl_protocol == SslProtocol::Tls11 {
        warn!(client_id = %client_id, "tls_1_1_unsupported_negotiating_newer");
    }
    if tls.allow_untrusted_certificates
        || tls.ignore_certificate_chain_errors
        || tls.ignore_certificate_revocation_errors
    {
        warn!(
            client_id = %client_id,
            allow_untrusted = tls.allow_untrusted_certificates,
            ignore_chain_errors = tls.ignore_certificate_chain_errors,
            ignore_revocation_errors = tls.ignore_certificate_revocation_errors,
            "tls_trust_relaxation_ignored"
        );
    }
    if tls.client_cert_password.as_deref().is_some_and(|p| !p.is_empty()) {
        warn!(client_id = %client_id, "tls_client_cert_password_ignored");
    }

    let client_auth = match &tls.client_cert_path {
        Some(path) => {
            let pem = read(path)?;
            Some((pem.clone(), pem))
        }
        None => None,
    };

    match &tls.ca_cert_path {
        Some(path) => Ok(Some(Transport::tls(read(path)?, client_auth, None))),
        None => {
            if client_auth.is_some() {
                warn!(client_id = %client_id, "tls_client_cert_requires_ca_cert");
            }
            Ok(Some(Transport::tls_with_default_config()))
        }
    }
}

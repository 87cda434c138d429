//! TLS connector construction.

use crate::error::ClientError;
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use std::io::Cursor;
use std::sync::Arc;
use tokio_rustls::TlsConnector;

/// Builds a TLS connector whose root store holds the webpki trust anchors,
/// optionally extended with a caller-supplied PEM bundle.
///
/// `server_host` must be the configured hostname, not a resolved address,
/// so SNI and certificate validation see the right name.
pub fn create_tls_connector(
    ca_bundle: Option<&[u8]>,
    server_host: &str,
) -> Result<(TlsConnector, ServerName<'static>), ClientError> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(pem) = ca_bundle {
        let mut reader = Cursor::new(pem);
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ClientError::TlsConfig(format!("invalid CA bundle: {e}")))?;
        if certs.is_empty() {
            return Err(ClientError::TlsConfig(
                "CA bundle contains no certificates".to_string(),
            ));
        }
        for cert in certs {
            root_store
                .add(cert)
                .map_err(|e| ClientError::TlsConfig(format!("invalid CA certificate: {e}")))?;
        }
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let server_name = ServerName::try_from(server_host.to_string())
        .map_err(|_| ClientError::TlsConfig(format!("invalid server name: {server_host}")))?;

    Ok((connector, server_name))
}

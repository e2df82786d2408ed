// TLS support for the mock server's listener.
// Uses tokio-rustls; accepted sockets are wrapped and the codec sees
// plaintext after the handshake.

use crate::error::{Error, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, pkcs8_private_keys};
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// Build a server-side TLS configuration from PEM cert and key files,
/// suitable for `ServerOptions::tls`.
pub fn build_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let cert_data = fs::read(cert_path)
        .map_err(|e| Error::Msg(format!("failed to read {}: {}", cert_path.display(), e)))?;
    let mut cert_reader = BufReader::new(&cert_data[..]);
    let cert_chain: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Msg(format!("failed to parse certificates: {e}")))?;
    if cert_chain.is_empty() {
        return Err(Error::Msg(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key_data = fs::read(key_path)
        .map_err(|e| Error::Msg(format!("failed to read {}: {}", key_path.display(), e)))?;
    let mut key_reader = BufReader::new(&key_data[..]);
    let keys: Vec<_> = pkcs8_private_keys(&mut key_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Msg(format!("failed to parse private key: {e}")))?;
    let key = keys
        .into_iter()
        .next()
        .ok_or_else(|| Error::Msg(format!("no private key found in {}", key_path.display())))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, PrivateKeyDer::Pkcs8(key))
        .map_err(|e| Error::Msg(format!("invalid certificate or key: {e}")))?;
    Ok(Arc::new(config))
}

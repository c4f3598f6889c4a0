use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use log::debug;
use rustls::ServerConfig;
use rustls::pki_types::CertificateDer;
use rustls_pemfile::{ certs, private_key };
use tokio_rustls::TlsAcceptor;

use crate::llm::chat::BoxError;

/// Both the HTTP and WebSocket listeners use ring; make it the process default.
pub fn install_crypto_provider() {
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        debug!("rustls crypto provider already installed");
    }
}

pub fn load_tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, BoxError> {
    let cert_file = File::open(cert_path).map_err(|e|
        format!("Failed to open TLS certificate file '{}': {}", cert_path, e)
    )?;
    let key_file = File::open(key_path).map_err(|e|
        format!("Failed to open TLS key file '{}': {}", key_path, e)
    )?;

    let cert_chain: Vec<CertificateDer<'static>> = certs(&mut BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|e| format!("Failed to read certificate(s): {}", e))?;
    let key = private_key(&mut BufReader::new(key_file))
        .map_err(|e| format!("Error reading private key: {}", e))?
        .ok_or("No private key found in key file")?;

    let config = ServerConfig::builder_with_provider(
        Arc::new(rustls::crypto::ring::default_provider())
    )
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

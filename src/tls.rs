//! TLS termination for the POP3S listener.
//!
//! The acceptor is built once at startup from a combined PEM holding the
//! server certificate chain and its (unencrypted) private key, with an
//! optional CA chain appended to the presented chain. Accepted streams are
//! ordinary `AsyncRead + AsyncWrite` values, so the line framer and the
//! POP3 machine treat them exactly like plaintext sockets.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use log::info;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

/// Installs the process-wide rustls crypto provider. Safe to call more
/// than once; later calls are ignored.
pub fn install_crypto_provider() {
    rustls::crypto::aws_lc_rs::default_provider().install_default().ok();
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("cannot open {}", path.display()))?,
    );
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("cannot parse certificates in {}", path.display()))?;
    Ok(certs)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("cannot open {}", path.display()))?,
    );
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("cannot parse private key in {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}

/// Builds the TLS acceptor from the combined certificate/key PEM, with the
/// CA chain appended when given.
///
/// # Errors
///
/// Any unreadable or unparsable file is a startup failure.
pub fn load_acceptor(cert_file: &Path, ca_file: Option<&Path>) -> Result<TlsAcceptor> {
    let mut chain = read_certs(cert_file)?;
    if chain.is_empty() {
        return Err(anyhow!("no certificates found in {}", cert_file.display()));
    }
    if let Some(ca) = ca_file {
        chain.extend(read_certs(ca)?);
    }
    let key = read_key(cert_file)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .context("invalid TLS certificate/key material")?;
    info!("TLS material loaded from {}", cert_file.display());
    Ok(TlsAcceptor::from(Arc::new(config)))
}

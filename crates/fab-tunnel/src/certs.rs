//! Certificate loading for connection descriptors.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rustls_pki_types::CertificateDer;
use tracing::debug;

use crate::error::{Result, TunnelError};

/// Resolves `name` against `certs_dir` unless it is absolute.
#[must_use]
pub fn resolve_cert_path(certs_dir: &Path, name: &str) -> PathBuf {
    let path = Path::new(name);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        certs_dir.join(path)
    }
}

/// Re-encodes a DER certificate as canonical PEM.
#[must_use]
pub fn encode_pem(cert: &CertificateDer<'_>) -> String {
    let encoded = STANDARD.encode(cert.as_ref());
    let mut pem = String::with_capacity(encoded.len() + encoded.len() / 64 + 64);
    pem.push_str("-----BEGIN CERTIFICATE-----\n");
    for line in encoded.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

/// Loads every certificate in the PEM file `name`.
pub fn load_certificate(certs_dir: &Path, name: &str) -> Result<Vec<String>> {
    let path = resolve_cert_path(certs_dir, name);
    let cert_error = |reason: String| TunnelError::Certificate {
        path: path.clone(),
        reason,
    };

    let file = File::open(&path).map_err(|e| cert_error(e.to_string()))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| cert_error(e.to_string()))?;

    if certs.is_empty() {
        return Err(cert_error("no certificates found".to_string()));
    }

    debug!(count = certs.len(), path = %path.display(), "loaded certificates");
    Ok(certs.iter().map(encode_pem).collect())
}

/// Loads all certificate files of a connection, in order.
pub fn load_certificates(certs_dir: &Path, names: &[String]) -> Result<Vec<String>> {
    let mut pems = Vec::with_capacity(names.len());
    for name in names {
        pems.extend(load_certificate(certs_dir, name)?);
    }
    Ok(pems)
}

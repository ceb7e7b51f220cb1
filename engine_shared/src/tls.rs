//! Optional TLS for peer streams.
//!
//! Hosts present a certificate chain and private key loaded from PEM files.
//! Clients trust either a PEM CA bundle (self-signed setups) or the bundled
//! web PKI roots.

use std::{path::Path, sync::Arc};

use anyhow::Context;
use tokio_rustls::{
    rustls::{
        self,
        pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer, ServerName},
        RootCertStore,
    },
    TlsAcceptor, TlsConnector,
};

use crate::config::TlsConfig;

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_file_iter(path)
        .with_context(|| format!("open certificates {}", path.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parse certificates {}", path.display()))?;
    anyhow::ensure!(!certs.is_empty(), "no certificates in {}", path.display());
    Ok(certs)
}

fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_file(path).with_context(|| format!("load private key {}", path.display()))
}

/// Server-side TLS context.
pub fn server_acceptor(cfg: &TlsConfig) -> anyhow::Result<TlsAcceptor> {
    let chain = cfg
        .cert_chain
        .as_deref()
        .context("tls.cert_chain is required to host")?;
    let key = cfg
        .private_key
        .as_deref()
        .context("tls.private_key is required to host")?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(load_certs(chain)?, load_private_key(key)?)
        .context("build tls server config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Client-side TLS context.
pub fn client_connector(cfg: &TlsConfig) -> anyhow::Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    match cfg.ca_bundle.as_deref() {
        Some(bundle) => {
            for cert in load_certs(bundle)? {
                roots
                    .add(cert)
                    .with_context(|| format!("add CA from {}", bundle.display()))?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Name to verify the host certificate against.
pub fn server_name(cfg: &TlsConfig, host: &str) -> anyhow::Result<ServerName<'static>> {
    let name = cfg.server_name.as_deref().unwrap_or(host).to_string();
    ServerName::try_from(name.clone()).with_context(|| format!("invalid tls server name {name:?}"))
}

use anyhow::{bail, Context, Result};
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    ClientConfig, RootCertStore, ServerConfig,
};
use std::{path::Path, sync::Arc};

/// Loads the HTTPS listener's TLS configuration.
///
/// HTTP/2 is offered over ALPN unless `http2` is false.
pub async fn server_config(certs: &Path, key: &Path, http2: bool) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(certs).await?;
    let key = load_private_key(key).await?;
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS credentials")?;
    config.alpn_protocols = if http2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };
    Ok(Arc::new(config))
}

/// Builds an agent's client TLS configuration trusting the CA certificates in `ca`.
pub async fn client_config(ca: &Path) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    let (added, _) = roots.add_parsable_certificates(load_certs(ca).await?);
    if added == 0 {
        bail!("no CA certificates found in {}", ca.display());
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

async fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("invalid certificates in {}", path.display()))?;
    if certs.is_empty() {
        bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

async fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .with_context(|| format!("invalid private key in {}", path.display()))?
        .with_context(|| format!("no private key found in {}", path.display()))
}

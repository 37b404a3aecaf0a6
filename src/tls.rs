use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::DigitallySignedStruct;
use rustls::SignatureScheme;

/// Server-side TLS material plus the fingerprint advertised via `info`.
pub struct ServerTls {
    pub config: Arc<rustls::ServerConfig>,
    pub fingerprint: String,
}

/// Load a PEM cert/key pair, or generate an in-memory self-signed pair when
/// none is configured. Returns the config and the certificate fingerprint.
pub fn server_tls(cert: Option<&Path>, key: Option<&Path>, host: &str) -> Result<ServerTls> {
    let (certs, key) = match (cert, key) {
        (Some(c), Some(k)) => load_pem_pair(c, k)?,
        (None, None) => generate_self_signed(host)?,
        _ => return Err(anyhow!("ssl_cert and ssl_privkey must be given together")),
    };

    let fingerprint = fingerprint_hex(&certs[0]);
    let cfg = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build server tls config")?;
    Ok(ServerTls { config: Arc::new(cfg), fingerprint })
}

fn load_pem_pair(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let certs = {
        let mut rd = BufReader::new(fs::File::open(cert_path).context("open cert")?);
        let mut out = Vec::new();
        for c in rustls_pemfile::certs(&mut rd) {
            out.push(c.context("read cert")?);
        }
        if out.is_empty() {
            return Err(anyhow!("no certificates in {}", cert_path.display()));
        }
        out
    };
    let key = {
        let mut rd = BufReader::new(fs::File::open(key_path).context("open key")?);
        let pkcs8: Vec<_> = rustls_pemfile::pkcs8_private_keys(&mut rd).collect();
        if let Some(k) = pkcs8.into_iter().next() {
            PrivateKeyDer::from(k.context("pkcs8 key")?)
        } else {
            let mut rd2 = BufReader::new(fs::File::open(key_path).context("reopen key")?);
            let rsa: Vec<_> = rustls_pemfile::rsa_private_keys(&mut rd2).collect();
            let k = rsa.into_iter().next().context("rsa key not found")??;
            PrivateKeyDer::from(k)
        }
    };
    Ok((certs, key))
}

fn generate_self_signed(
    host: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let subject = if host.is_empty() { "easyshare.local".to_string() } else { host.to_string() };
    let cert =
        rcgen::generate_simple_self_signed(vec![subject]).context("generate self-signed cert")?;
    let cert_der = CertificateDer::from(cert.serialize_der().context("serialize cert")?);
    let key_der = PrivateKeyDer::try_from(cert.serialize_private_key_der())
        .map_err(|e| anyhow!("private key: {e}"))?;
    Ok((vec![cert_der], key_der))
}

pub fn fingerprint_hex(cert: &CertificateDer<'_>) -> String {
    let mut h = Sha256::new();
    h.update(cert.as_ref());
    let digest = h.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect::<String>()
}

/// Verifier that accepts any certificate (self-signed allowed by default)
/// and records the presented fingerprint so `info` can surface it.
#[derive(Debug)]
struct RecordingVerifier {
    seen: Arc<Mutex<Option<String>>>,
}

impl ServerCertVerifier for RecordingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _dns_name: &ServerName,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let fp = fingerprint_hex(end_entity);
        if let Ok(mut slot) = self.seen.lock() {
            *slot = Some(fp);
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PKCS1_SHA256,
        ]
    }
}

/// Client config. `seen_fingerprint` is filled in during the handshake.
pub fn client_config(seen_fingerprint: Arc<Mutex<Option<String>>>) -> rustls::ClientConfig {
    let verifier = RecordingVerifier { seen: seen_fingerprint };
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth()
}

pub fn server_name_for(host: &str) -> ServerName<'static> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        ServerName::IpAddress(ip.into())
    } else {
        ServerName::try_from(host.to_string())
            .unwrap_or_else(|_| ServerName::try_from("localhost".to_string()).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_has_fingerprint() {
        let tls = server_tls(None, None, "127.0.0.1").unwrap();
        assert_eq!(tls.fingerprint.len(), 64);
        assert!(tls.fingerprint.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn cert_without_key_rejected() {
        let res = server_tls(Some(Path::new("/tmp/cert.pem")), None, "x");
        assert!(res.is_err());
    }

    #[test]
    fn server_name_accepts_ips_and_hostnames() {
        assert!(matches!(server_name_for("192.168.1.4"), ServerName::IpAddress(_)));
        assert!(matches!(server_name_for("myhost.lan"), ServerName::DnsName(_)));
    }
}

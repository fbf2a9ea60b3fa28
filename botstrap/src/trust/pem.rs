//! Certificate decoding.
//!
//! PEM armor is read with `rustls-pemfile`. Every item must then parse as
//! an X.509 certificate usable as a trust anchor, so a payload that only
//! looks like DER is rejected.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rustls::pki_types::CertificateDer;
use std::io::Cursor;

const BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const END: &str = "-----END CERTIFICATE-----";

/// A single DER-encoded certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
}

impl Certificate {
    /// Accept `der` only if it decodes as an X.509 certificate.
    pub fn from_der(der: Vec<u8>) -> Result<Self, String> {
        {
            let cert = CertificateDer::from(der.as_slice());
            webpki::anchor_from_trusted_cert(&cert)
                .map_err(|e| format!("not an X.509 certificate: {:?}", e))?;
        }
        Ok(Self { der })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Canonical PEM form, 64 columns.
    pub fn to_pem(&self) -> String {
        let body = STANDARD.encode(&self.der);
        let mut out = String::with_capacity(body.len() + 64);
        out.push_str(BEGIN);
        out.push('\n');
        for chunk in body.as_bytes().chunks(64) {
            out.push_str(&String::from_utf8_lossy(chunk));
            out.push('\n');
        }
        out.push_str(END);
        out.push('\n');
        out
    }
}

/// Parse every `CERTIFICATE` block in `text`.
///
/// Text outside the blocks (comments in bundles) is ignored. Broken armor,
/// bad base64 or a block that is not a certificate is an error.
pub fn parse_pem_bundle(text: &str) -> Result<Vec<Certificate>, String> {
    let mut reader = Cursor::new(text.as_bytes());
    rustls_pemfile::certs(&mut reader)
        .enumerate()
        .map(|(index, item)| {
            let der = item.map_err(|e| format!("certificate {}: {}", index + 1, e))?;
            Certificate::from_der(der.to_vec())
                .map_err(|e| format!("certificate {}: {}", index + 1, e))
        })
        .collect()
}

/// Accept either a PEM document or a raw DER certificate.
pub fn parse_certificate_payload(bytes: &[u8]) -> Result<Vec<Certificate>, String> {
    if bytes.first() == Some(&0x30) {
        return Certificate::from_der(bytes.to_vec()).map(|c| vec![c]);
    }

    let text = std::str::from_utf8(bytes).map_err(|_| "payload is neither PEM nor DER".to_string())?;
    let certs = parse_pem_bundle(text)?;
    if certs.is_empty() {
        return Err("payload contains no CERTIFICATE block".to_string());
    }
    Ok(certs)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

    /// A self-signed CA certificate named `common_name`.
    pub(crate) fn test_certificate(common_name: &str) -> Certificate {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, common_name);
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Certificate::from_der(cert.der().to_vec()).unwrap()
    }

    #[test]
    fn test_pem_roundtrip_canonical() {
        let cert = test_certificate("Ops Root");
        let pem = cert.to_pem();
        assert!(pem.lines().all(|l| l.len() <= 64 || l.starts_with("-----")));

        let parsed = parse_pem_bundle(&format!("# comment\n{pem}\n{pem}")).unwrap();
        assert_eq!(parsed, vec![cert.clone(), cert]);
    }

    #[test]
    fn test_rejects_html_payload() {
        let err = parse_certificate_payload(b"<html><body>Not Found</body></html>").unwrap_err();
        assert!(err.contains("no CERTIFICATE"));
    }

    #[test]
    fn test_rejects_truncated_der() {
        let mut der = test_certificate("Ops Root").der().to_vec();
        der.truncate(der.len() / 2);
        assert!(Certificate::from_der(der).is_err());
    }

    #[test]
    fn test_rejects_sequence_that_is_not_a_certificate() {
        // SEQUENCE { INTEGER 5 }
        let der = vec![0x30, 0x03, 0x02, 0x01, 0x05];
        assert!(Certificate::from_der(der.clone()).is_err());
        assert!(parse_certificate_payload(&der).is_err());

        let text = format!("{BEGIN}\nMAMCAQU=\n{END}\n");
        let err = parse_certificate_payload(text.as_bytes()).unwrap_err();
        assert!(err.contains("not an X.509 certificate"), "{err}");
    }

    #[test]
    fn test_rejects_bad_base64() {
        let text = format!("{BEGIN}\n@@@not base64@@@\n{END}\n");
        assert!(parse_pem_bundle(&text).is_err());
    }

    #[test]
    fn test_rejects_unterminated_block() {
        let text = format!("{BEGIN}\nMIIB\n");
        assert!(parse_pem_bundle(&text).is_err());
    }

    #[test]
    fn test_accepts_raw_der() {
        let der = test_certificate("Proxy Root").der().to_vec();
        let certs = parse_certificate_payload(&der).unwrap();
        assert_eq!(certs.len(), 1);
    }
}

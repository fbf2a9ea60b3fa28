//! Certificate retrieval.
//!
//! Fetches run over a client whose only roots are the ones the base image
//! already trusts, never the host's or a built-in bundle.

use super::pem::{Certificate, parse_certificate_payload};
use async_trait::async_trait;
use botstrap_shared::errors::{BotstrapError, BotstrapResult};
use std::time::Duration;

/// Source of certificate payloads.
#[async_trait]
pub trait CertificateFetcher: Send + Sync {
    /// Retrieve the certificate(s) at `url`, validating the transport
    /// against `roots`.
    async fn fetch(&self, url: &str, roots: &[Certificate]) -> BotstrapResult<Vec<Certificate>>;
}

/// HTTP(S) fetcher built on reqwest + rustls.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn client(&self, roots: &[Certificate]) -> BotstrapResult<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .timeout(self.timeout)
            .user_agent(concat!("botstrap/", env!("CARGO_PKG_VERSION")));

        for root in roots {
            let cert = reqwest::Certificate::from_der(root.der()).map_err(|e| {
                BotstrapError::Fetch(format!("base trust store holds an unusable root: {}", e))
            })?;
            builder = builder.add_root_certificate(cert);
        }

        builder
            .build()
            .map_err(|e| BotstrapError::Fetch(format!("failed to build HTTP client: {}", e)))
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl CertificateFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, roots: &[Certificate]) -> BotstrapResult<Vec<Certificate>> {
        let client = self.client(roots)?;

        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| BotstrapError::Fetch(format!("{} unreachable: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BotstrapError::Fetch(format!("{} returned {}", url, status)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| BotstrapError::Fetch(format!("{} body read failed: {}", url, e)))?;

        parse_certificate_payload(&body)
            .map_err(|e| BotstrapError::Fetch(format!("{} is not a certificate: {}", url, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::pem::tests::test_certificate;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch_pem() {
        let server = MockServer::start().await;
        let pem = test_certificate("Ops Root").to_pem();
        Mock::given(method("GET"))
            .and(path("/root_ca.crt"))
            .respond_with(ResponseTemplate::new(200).set_body_string(pem))
            .mount(&server)
            .await;

        let certs = HttpFetcher::default()
            .fetch(&format!("{}/root_ca.crt", server.uri()), &[])
            .await
            .unwrap();
        assert_eq!(certs.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_not_found_is_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = HttpFetcher::default()
            .fetch(&format!("{}/missing.crt", server.uri()), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, BotstrapError::Fetch(ref m) if m.contains("404")));
    }

    #[tokio::test]
    async fn test_fetch_html_is_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>captive portal</html>"))
            .mount(&server)
            .await;

        let err = HttpFetcher::default()
            .fetch(&format!("{}/ca.crt", server.uri()), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, BotstrapError::Fetch(ref m) if m.contains("not a certificate")));
    }

    #[tokio::test]
    async fn test_fetch_der_sequence_that_is_not_a_certificate_is_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "-----BEGIN CERTIFICATE-----\nMAMCAQU=\n-----END CERTIFICATE-----\n",
            ))
            .mount(&server)
            .await;

        let err = HttpFetcher::default()
            .fetch(&format!("{}/ca.crt", server.uri()), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, BotstrapError::Fetch(ref m) if m.contains("not a certificate")));
    }

    #[tokio::test]
    async fn test_unreachable_is_fetch_error() {
        let err = HttpFetcher::new(Duration::from_secs(2))
            .fetch("http://127.0.0.1:9/ca.crt", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, BotstrapError::Fetch(_)));
    }
}

//! Trust anchors: retrieval, validation and installation into the image.

mod fetch;
mod pem;
mod store;

pub use fetch::{CertificateFetcher, HttpFetcher};
pub use pem::{Certificate, parse_certificate_payload, parse_pem_bundle};
pub use store::{BundleSummary, install_anchor, read_bundle, rebuild_bundle};

use serde::{Deserialize, Serialize};

/// A certificate authority to add to the image trust store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustAnchor {
    /// File stem used for the installed certificate.
    pub name: String,
    /// Where the certificate is fetched from.
    pub url: String,
}

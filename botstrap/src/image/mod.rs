//! OCI image layout output.

mod layout;

pub use layout::{ImageConfigDraft, LayerRecord, OciLayout, Platform, PublishedImage};

use botstrap_shared::errors::BotstrapError;
use oci_spec::OciSpecError;

pub(crate) fn oci_err(e: OciSpecError) -> BotstrapError {
    BotstrapError::Image(e.to_string())
}

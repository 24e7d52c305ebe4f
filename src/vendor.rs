//! Vendor image client interface, consumed by the hero-image pipeline the
//! same way render tasks consume rendering sessions. Only the interface
//! shape lives here; the pipeline itself is a separate component.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Webp,
    Avif,
}

/// One converted rendition of a source image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageVariant {
    pub format: ImageFormat,
    pub url: Url,
    pub bytes: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum VendorError {
    #[error("vendor rejected source: {0}")]
    Rejected(String),
    #[error("vendor unavailable: {0}")]
    Unavailable(String),
}

/// Third-party image conversion service.
pub trait VendorImageClient: Send + Sync {
    fn convert<'a>(
        &'a self,
        source: &'a Url,
        formats: &'a [ImageFormat],
    ) -> BoxFuture<'a, Result<Vec<ImageVariant>, VendorError>>;
}

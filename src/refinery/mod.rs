// * The Refinery (Image Filter Pipeline)
// * Goal: Turn downloaded bytes into an accepted, scored and hashed image, or a rejection.
// * Everything here is CPU-bound and synchronous; callers run it on the blocking pool.

pub mod classifier;
pub mod decode;
pub mod filters;
pub mod phash;

// * Re-exports for convenient access
pub use classifier::{HeuristicPhotoScorer, ImageScorer};
pub use decode::{decode_image, DecodeError, DecodedImage};
pub use filters::{classify_orientation, watermark_density, FilterChain, FilterPass, Rejection};
pub use phash::{compute_phash, PHash, ParsePHashError};

use crate::config::{ClassifierConfig, FilterConfig};
use std::sync::Arc;
use thiserror::Error;

/// An image that passed every content stage
#[derive(Debug, Clone)]
pub struct RefinedImage {
    pub image: DecodedImage,
    pub score: Option<f32>,
    pub phash: PHash,
}

/// Why the refinery produced nothing
#[derive(Debug, Error)]
pub enum RefineryReject {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("filtered at {}: {0}", .0.stage())]
    Filtered(Rejection),
}

/// Decode -> filter chain -> perceptual hash
#[derive(Debug, Clone)]
pub struct Refinery {
    accept_bw: bool,
    chain: FilterChain,
}

impl Refinery {
    pub fn new(
        filters: FilterConfig,
        classifier: &ClassifierConfig,
        scorer: Option<Arc<dyn ImageScorer>>,
    ) -> Self {
        Self {
            accept_bw: filters.accept_bw,
            chain: FilterChain::new(filters, classifier, scorer),
        }
    }

    /// Runs the content stages over raw bytes
    pub fn process(&self, bytes: &[u8]) -> Result<RefinedImage, RefineryReject> {
        let image = decode_image(bytes, self.accept_bw)?;
        let pass = self
            .chain
            .evaluate(&image)
            .map_err(RefineryReject::Filtered)?;
        let phash = compute_phash(&image.image);

        Ok(RefinedImage {
            image,
            score: pass.score,
            phash,
        })
    }

    pub fn chain(&self) -> &FilterChain {
        &self.chain
    }
}

// * Image Filter Chain
// * Ordered accept/reject stages over a decoded image; the first rejection wins

use crate::config::constants::{SQUARE_RATIO_MAX, SQUARE_RATIO_MIN};
use crate::config::{ClassifierConfig, FilterConfig, Orientation, WatermarkConfig};
use crate::refinery::classifier::ImageScorer;
use crate::refinery::decode::DecodedImage;
use image::GrayImage;
use std::fmt;
use std::sync::Arc;

/// Why the chain rejected an image
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rejection {
    TooSmall { min_side: u32 },
    Orientation { actual: Orientation },
    Watermark { density: f64 },
    LowScore { score: f32 },
}

impl Rejection {
    /// Stable identifier of the stage that rejected
    pub fn stage(&self) -> &'static str {
        match self {
            Rejection::TooSmall { .. } => "min_side",
            Rejection::Orientation { .. } => "orientation",
            Rejection::Watermark { .. } => "watermark",
            Rejection::LowScore { .. } => "classifier",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::TooSmall { min_side } => write!(f, "shorter side below {}px", min_side),
            Rejection::Orientation { actual } => write!(f, "orientation {:?} not wanted", actual),
            Rejection::Watermark { density } => write!(f, "band edge density {:.3}", density),
            Rejection::LowScore { score } => write!(f, "photo score {:.3}", score),
        }
    }
}

/// Outcome of a passing image
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterPass {
    /// Classifier score, `None` when no scorer produced one
    pub score: Option<f32>,
}

/// The configured filter stages.
///
/// Pure with respect to its inputs: the same image and config always give the
/// same verdict.
#[derive(Clone)]
pub struct FilterChain {
    config: FilterConfig,
    classifier_threshold: f32,
    scorer: Option<Arc<dyn ImageScorer>>,
}

impl FilterChain {
    pub fn new(
        config: FilterConfig,
        classifier: &ClassifierConfig,
        scorer: Option<Arc<dyn ImageScorer>>,
    ) -> Self {
        Self {
            config,
            classifier_threshold: classifier.threshold,
            scorer,
        }
    }

    /// Runs min-side, orientation, watermark and score stages in order
    pub fn evaluate(&self, image: &DecodedImage) -> Result<FilterPass, Rejection> {
        check_min_side(image.width, image.height, self.config.min_side)?;
        check_orientation(image.width, image.height, self.config.orientation)?;

        if watermark_enabled(&self.config.watermark) {
            let density = watermark_density(
                &image.image.to_luma8(),
                self.config.watermark.band_ratio,
                self.config.watermark.edge_threshold,
            );
            if density >= self.config.watermark.edge_density {
                return Err(Rejection::Watermark { density });
            }
        }

        let score = self.scorer.as_ref().and_then(|s| s.score(image));
        if let Some(score) = score {
            if self.classifier_threshold > 0.0 && score < self.classifier_threshold {
                return Err(Rejection::LowScore { score });
            }
        }

        Ok(FilterPass { score })
    }

    pub fn has_scorer(&self) -> bool {
        self.scorer.is_some()
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("config", &self.config)
            .field("classifier_threshold", &self.classifier_threshold)
            .field("scorer", &self.scorer.as_ref().map(|s| s.name().to_string()))
            .finish()
    }
}

/// Rejects when the shorter side is below `min_side`; 0 disables the stage
pub fn check_min_side(width: u32, height: u32, min_side: u32) -> Result<(), Rejection> {
    if min_side > 0 && width.min(height) < min_side {
        return Err(Rejection::TooSmall { min_side });
    }
    Ok(())
}

/// Classifies by aspect ratio: square within `[0.9, 1.1]`, portrait below, landscape above
pub fn classify_orientation(width: u32, height: u32) -> Orientation {
    if height == 0 {
        return Orientation::Landscape;
    }
    let ratio = width as f64 / height as f64;
    if ratio < SQUARE_RATIO_MIN {
        Orientation::Portrait
    } else if ratio > SQUARE_RATIO_MAX {
        Orientation::Landscape
    } else {
        Orientation::Square
    }
}

pub fn check_orientation(width: u32, height: u32, wanted: Orientation) -> Result<(), Rejection> {
    if wanted == Orientation::All {
        return Ok(());
    }
    let actual = classify_orientation(width, height);
    if actual != wanted {
        return Err(Rejection::Orientation { actual });
    }
    Ok(())
}

fn watermark_enabled(config: &WatermarkConfig) -> bool {
    config.enable && config.band_ratio > 0.0 && config.edge_density > 0.0
}

/// Highest edge density of the top and bottom bands.
///
/// Density is the share of horizontal and vertical neighbour differences above
/// `edge_threshold` inside a band of `band_ratio * height` rows.
pub fn watermark_density(luma: &GrayImage, band_ratio: f64, edge_threshold: u8) -> f64 {
    let (width, height) = luma.dimensions();
    if width == 0 || height == 0 {
        return 0.0;
    }
    let band = ((height as f64 * band_ratio) as u32).clamp(1, height);

    let top = band_density(luma, 0, band, edge_threshold);
    let bottom = band_density(luma, height - band, height, edge_threshold);
    top.max(bottom)
}

fn band_density(luma: &GrayImage, y_start: u32, y_end: u32, edge_threshold: u8) -> f64 {
    let width = luma.width();
    let threshold = edge_threshold as i16;
    let mut edges = 0u64;
    let mut total = 0u64;

    for y in y_start..y_end {
        for x in 0..width {
            let value = luma.get_pixel(x, y).0[0] as i16;
            if x + 1 < width {
                total += 1;
                if (luma.get_pixel(x + 1, y).0[0] as i16 - value).abs() > threshold {
                    edges += 1;
                }
            }
            if y + 1 < y_end {
                total += 1;
                if (luma.get_pixel(x, y + 1).0[0] as i16 - value).abs() > threshold {
                    edges += 1;
                }
            }
        }
    }

    edges as f64 / total.max(1) as f64
}

// * Photo Classifier Seam
// * External scorers plug in behind `ImageScorer`; a cheap heuristic ships as the default

use crate::refinery::decode::DecodedImage;
use image::imageops::FilterType;

// * Longest side the heuristic works at
const HEURISTIC_SIDE: u32 = 224;

// * Weights of the two heuristic features
const EDGE_WEIGHT: f32 = 0.6;
const VARIANCE_WEIGHT: f32 = 0.4;
const VARIANCE_SCALE: f32 = 10.0;

/// Scores how likely an image is a real photograph, in `[0.0, 1.0]`.
///
/// `None` means the scorer is disabled or unavailable and is treated the same
/// as having no scorer at all.
pub trait ImageScorer: Send + Sync {
    fn score(&self, image: &DecodedImage) -> Option<f32>;

    /// Short name for logs
    fn name(&self) -> &str {
        "external"
    }
}

/// Edge density + colour variance heuristic.
///
/// Flat fills (drawings, logos, banners) score low on both features.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicPhotoScorer;

impl HeuristicPhotoScorer {
    pub fn new() -> Self {
        Self
    }
}

impl ImageScorer for HeuristicPhotoScorer {
    fn score(&self, image: &DecodedImage) -> Option<f32> {
        let small = if image.width > HEURISTIC_SIDE || image.height > HEURISTIC_SIDE {
            image
                .image
                .resize(HEURISTIC_SIDE, HEURISTIC_SIDE, FilterType::Triangle)
                .to_rgb8()
        } else {
            image.image.to_rgb8()
        };

        let (width, height) = small.dimensions();
        if width == 0 || height == 0 {
            return None;
        }

        let edge = edge_mean(&small);
        let variance = channel_variance(&small);

        let v_edge = edge.clamp(0.0, 1.0);
        let v_var = (variance * VARIANCE_SCALE).clamp(0.0, 1.0);
        Some((EDGE_WEIGHT * v_edge + VARIANCE_WEIGHT * v_var).clamp(0.0, 1.0))
    }

    fn name(&self) -> &str {
        "heuristic"
    }
}

/// Mean response of an 8-neighbour Laplacian, clipped to `[0, 255]` and scaled to `[0, 1]`
fn edge_mean(image: &image::RgbImage) -> f32 {
    let (width, height) = image.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }

    let mut total = 0.0f64;
    let mut samples = 0u64;
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            for channel in 0..3 {
                let center = image.get_pixel(x, y).0[channel] as i32;
                let mut neighbours = 0i32;
                for dy in 0..3 {
                    for dx in 0..3 {
                        if dx == 1 && dy == 1 {
                            continue;
                        }
                        neighbours += image.get_pixel(x + dx - 1, y + dy - 1).0[channel] as i32;
                    }
                }
                let response = (8 * center - neighbours).clamp(0, 255);
                total += response as f64 / 255.0;
                samples += 1;
            }
        }
    }

    (total / samples as f64) as f32
}

/// Variance over every channel sample, with samples scaled to `[0, 1]`
fn channel_variance(image: &image::RgbImage) -> f32 {
    let values: Vec<f64> = image.as_raw().iter().map(|&v| v as f64 / 255.0).collect();
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance as f32
}

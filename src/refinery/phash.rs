// * Perceptual Hash
// * 64-bit DCT hash: 32x32 luma -> 2D DCT-II -> top-left 8x8 block -> bits above the median

use image::imageops::{self, FilterType};
use image::DynamicImage;
use rustdct::DctPlanner;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const SAMPLE_SIDE: usize = 32;
const BLOCK_SIDE: usize = 8;

/// A 64-bit perceptual hash, rendered as 16 lowercase hex digits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PHash(pub u64);

impl PHash {
    /// Number of differing bits
    pub fn distance(&self, other: &PHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    pub fn is_similar(&self, other: &PHash, threshold: u32) -> bool {
        self.distance(other) <= threshold
    }

    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }
}

impl fmt::Display for PHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("Invalid perceptual hash '{0}': expected up to 16 hex digits")]
pub struct ParsePHashError(pub String);

impl FromStr for PHash {
    type Err = ParsePHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.len() > 16 {
            return Err(ParsePHashError(s.to_string()));
        }
        u64::from_str_radix(trimmed, 16)
            .map(PHash)
            .map_err(|_| ParsePHashError(s.to_string()))
    }
}

impl From<PHash> for String {
    fn from(hash: PHash) -> Self {
        hash.to_hex()
    }
}

impl TryFrom<String> for PHash {
    type Error = ParsePHashError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Computes the DCT perceptual hash of an image.
///
/// Colour images are reduced to luma first, so RGB and grayscale renditions of
/// the same picture hash identically.
pub fn compute_phash(image: &DynamicImage) -> PHash {
    let luma = image.to_luma8();
    let small = imageops::resize(
        &luma,
        SAMPLE_SIDE as u32,
        SAMPLE_SIDE as u32,
        FilterType::Lanczos3,
    );

    let mut matrix: Vec<f32> = small.pixels().map(|p| p.0[0] as f32).collect();

    let mut planner = DctPlanner::new();
    let dct = planner.plan_dct2(SAMPLE_SIDE);

    // * Rows
    for row in matrix.chunks_exact_mut(SAMPLE_SIDE) {
        dct.process_dct2(row);
    }

    // * Columns
    let mut column = vec![0.0f32; SAMPLE_SIDE];
    for x in 0..SAMPLE_SIDE {
        for y in 0..SAMPLE_SIDE {
            column[y] = matrix[y * SAMPLE_SIDE + x];
        }
        dct.process_dct2(&mut column);
        for y in 0..SAMPLE_SIDE {
            matrix[y * SAMPLE_SIDE + x] = column[y];
        }
    }

    let mut block = [0.0f32; BLOCK_SIDE * BLOCK_SIDE];
    for y in 0..BLOCK_SIDE {
        for x in 0..BLOCK_SIDE {
            block[y * BLOCK_SIDE + x] = matrix[y * SAMPLE_SIDE + x];
        }
    }

    let median = median(&block);

    // * First coefficient lands in the most significant bit
    let mut hash: u64 = 0;
    for &coefficient in block.iter() {
        hash <<= 1;
        if coefficient > median {
            hash |= 1;
        }
    }

    PHash(hash)
}

fn median(values: &[f32]) -> f32 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

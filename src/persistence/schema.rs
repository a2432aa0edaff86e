// * Image Record Schema
// * Persisted metadata for every image that made it into the dataset

use crate::refinery::phash::PHash;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("Image dimensions must be non-zero, got {width}x{height}")]
    EmptyDimensions { width: u32, height: u32 },

    #[error("Image extension must not be empty")]
    MissingExtension,

    #[error("Score {0} is outside [0.0, 1.0]")]
    ScoreOutOfRange(f32),
}

/// Primary record for an accepted image
///
/// # Fields
/// - `id`: Store-assigned sequence number
/// - `url`: Image URL as fetched
/// - `source`: Domain the image was fetched from
/// - `saved_path`: Final file location inside the storage root
/// - `score`: Classifier score, `None` when no scorer ran
/// - `phash`: 64-bit perceptual hash (hex on the wire)
/// - `created_at`: Unix timestamp in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: u64,
    pub url: String,
    pub source: String,
    pub width: u32,
    pub height: u32,
    pub ext: String,
    pub saved_path: PathBuf,
    pub score: Option<f32>,
    pub phash: PHash,
    pub created_at: u64,
}

/// Everything needed to insert an image record, before the store assigns an id
#[derive(Debug, Clone, PartialEq)]
pub struct NewImageRecord {
    pub url: String,
    pub source: String,
    pub width: u32,
    pub height: u32,
    pub ext: String,
    pub saved_path: PathBuf,
    pub score: Option<f32>,
    pub phash: PHash,
}

impl NewImageRecord {
    /// Checks the fields a store relies on
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.width == 0 || self.height == 0 {
            return Err(SchemaError::EmptyDimensions {
                width: self.width,
                height: self.height,
            });
        }
        if self.ext.is_empty() {
            return Err(SchemaError::MissingExtension);
        }
        if let Some(score) = self.score {
            if !(0.0..=1.0).contains(&score) {
                return Err(SchemaError::ScoreOutOfRange(score));
            }
        }
        Ok(())
    }

    /// Stamps the record with its id and the current time
    pub fn into_record(self, id: u64) -> ImageRecord {
        ImageRecord {
            id,
            url: self.url,
            source: self.source,
            width: self.width,
            height: self.height,
            ext: self.ext,
            saved_path: self.saved_path,
            score: self.score,
            phash: self.phash,
            created_at: current_timestamp_ms(),
        }
    }
}

/// Persisted hash row, one per accepted image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRecord {
    pub phash: PHash,
}

/// Per-domain image count, as returned by `count_by_source`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceCount {
    pub source: String,
    pub count: u64,
}

/// Returns current Unix timestamp in milliseconds
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NewImageRecord {
        NewImageRecord {
            url: "https://img.example.com/a.jpg".to_string(),
            source: "img.example.com".to_string(),
            width: 800,
            height: 600,
            ext: "jpg".to_string(),
            saved_path: PathBuf::from("/data/2024-01-01/img.example.com/img_1_1000.jpg"),
            score: Some(0.75),
            phash: PHash(0x0123_4567_89ab_cdef),
        }
    }

    #[test]
    fn test_validate_accepts_sample() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_dimensions() {
        let mut record = sample();
        record.height = 0;
        assert_eq!(
            record.validate(),
            Err(SchemaError::EmptyDimensions { width: 800, height: 0 })
        );
    }

    #[test]
    fn test_validate_rejects_bad_score() {
        let mut record = sample();
        record.score = Some(1.5);
        assert!(matches!(record.validate(), Err(SchemaError::ScoreOutOfRange(_))));

        record.score = None;
        assert!(record.validate().is_ok());
    }

    #[test]
    fn test_into_record_keeps_fields() {
        let record = sample().into_record(9);
        assert_eq!(record.id, 9);
        assert_eq!(record.source, "img.example.com");
        assert_eq!(record.phash, PHash(0x0123_4567_89ab_cdef));
        assert!(record.created_at > 0);
    }

    #[test]
    fn test_record_json_has_hex_phash() {
        let record = sample().into_record(1);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"phash\":\"0123456789abcdef\""));

        let back: ImageRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}

// * Image Decoding
// * Raw bytes -> oriented RGB raster, with the grayscale policy applied

use image::metadata::Orientation as ExifOrientation;
use image::{ColorType, DynamicImage, ImageDecoder, ImageFormat, ImageReader};
use std::io::Cursor;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Unreadable image data: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a decodable raster image: {0}")]
    Image(#[from] image::ImageError),

    #[error("Grayscale image rejected")]
    Grayscale,
}

/// A decoded image with EXIF orientation applied
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub image: DynamicImage,
    pub width: u32,
    pub height: u32,
    /// Container format sniffed from the bytes
    pub format: Option<ImageFormat>,
}

impl DecodedImage {
    /// Wraps an in-memory image, mostly for tests and scorers
    pub fn from_image(image: DynamicImage) -> Self {
        let (width, height) = (image.width(), image.height());
        Self {
            image,
            width,
            height,
            format: None,
        }
    }
}

/// Decodes bytes into an RGB raster.
///
/// Single-channel luma images are rejected unless `accept_bw` is set, in which case
/// they are expanded to RGB like every other colour mode.
pub fn decode_image(bytes: &[u8], accept_bw: bool) -> Result<DecodedImage, DecodeError> {
    let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    let format = reader.format();

    let mut decoder = reader.into_decoder()?;
    // * Missing or malformed EXIF is not fatal
    let orientation = decoder.orientation().unwrap_or(ExifOrientation::NoTransforms);
    let mut image = DynamicImage::from_decoder(decoder)?;
    image.apply_orientation(orientation);

    let grayscale = matches!(image.color(), ColorType::L8 | ColorType::L16);
    if grayscale && !accept_bw {
        return Err(DecodeError::Grayscale);
    }

    let image = match image {
        DynamicImage::ImageRgb8(_) => image,
        other => DynamicImage::ImageRgb8(other.to_rgb8()),
    };

    let (width, height) = (image.width(), image.height());
    Ok(DecodedImage {
        image,
        width,
        height,
        format,
    })
}

//! Camera-specific artefact rendering.
//!
//! A reconstructed FLIR byte stream is 480 bytes of sensor telemetry
//! followed by an 80x60 matrix of big-endian 16-bit pixels. Three
//! artefacts are derived from it: a tagged telemetry text, a CSV matrix
//! and a normalised grayscale BMP. uCAM streams are JPEG bytes and are
//! persisted as they are.

use std::io::Cursor;

use image::{GrayImage, ImageFormat};

use crate::frame::word;

/// Bytes of sensor telemetry ahead of the FLIR pixel matrix.
pub const FLIR_TM_LEN: usize = 480;
/// Thermal matrix dimensions.
pub const FLIR_WIDTH: u32 = 80;
pub const FLIR_HEIGHT: u32 = 60;
/// Total reconstructed FLIR stream length.
pub const FLIR_IMAGE_LEN: usize =
    FLIR_TM_LEN + (FLIR_WIDTH as usize) * (FLIR_HEIGHT as usize) * 2;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("thermal matrix is {got} pixels, expected {expected}")]
    UnexpectedShape { expected: usize, got: usize },

    #[error("BMP encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Whether a reconstructed uCAM stream opens with the JPEG SOI and DQT
/// markers.
pub fn ucam_has_jpeg_header(data: &[u8]) -> bool {
    data.len() >= 4 && data[0] == 0xFF && data[1] == 0xD8 && data[2] == 0xFF && data[3] == 0xDB
}

/// Renders the FLIR sensor telemetry region as text: 240 lines of
/// `<tag><index>:<value>`, tag `A` for words 0..80, `B` for 80..160,
/// `C` for the rest.
pub fn flir_tm_text(data: &[u8]) -> String {
    let words = data.len().min(FLIR_TM_LEN) / 2;
    let mut out = String::new();

    for i in 0..words {
        let tag = match i {
            0..=79 => 'A',
            80..=159 => 'B',
            _ => 'C',
        };
        out.push(tag);
        out.push_str(&format!("{}:{}\n", i % 80, word(data, i * 2)));
    }

    out
}

/// Renders the FLIR pixel matrix as comma-separated rows of decimal
/// 16-bit values, one `\n`-terminated row per sensor line.
pub fn flir_csv(data: &[u8]) -> String {
    let pixel_data = &data[data.len().min(FLIR_TM_LEN)..];
    let words = pixel_data.len() / 2;
    let mut out = String::new();

    for i in 0..words {
        if i > 0 {
            out.push(if i % (FLIR_WIDTH as usize) == 0 { '\n' } else { ',' });
        }
        out.push_str(&word(pixel_data, i * 2).to_string());
    }
    out.push('\n');

    out
}

/// Encodes the FLIR pixel matrix as an 8-bit grayscale BMP, stretching
/// the full dynamic range of the frame onto 0..=255.
pub fn flir_bmp(data: &[u8]) -> Result<Vec<u8>, RenderError> {
    let pixel_data = &data[data.len().min(FLIR_TM_LEN)..];
    let expected = (FLIR_WIDTH * FLIR_HEIGHT) as usize;
    if pixel_data.len() / 2 != expected {
        return Err(RenderError::UnexpectedShape {
            expected,
            got: pixel_data.len() / 2,
        });
    }

    let pixels: Vec<u16> = (0..expected).map(|i| word(pixel_data, i * 2)).collect();
    let min = pixels.iter().copied().min().unwrap_or(0);
    let max = pixels.iter().copied().max().unwrap_or(0);
    let range = u32::from(max.saturating_sub(min));

    let normalised: Vec<u8> = pixels
        .iter()
        .map(|p| {
            if range == 0 {
                0
            } else {
                // (p - min) * 256 / range saturates at 255 for p = max.
                (u32::from(p - min) * 256 / range).min(255) as u8
            }
        })
        .collect();

    let gray = GrayImage::from_raw(FLIR_WIDTH, FLIR_HEIGHT, normalised)
        .expect("pixel count was checked above");
    let mut out = Cursor::new(Vec::new());
    gray.write_to(&mut out, ImageFormat::Bmp)?;
    Ok(out.into_inner())
}

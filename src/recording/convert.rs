//! Interleaved RGB(A) to planar YUV 4:2:0 conversion
//!
//! Integer BT.601-style weights on an 8-bit fixed-point scale:
//! luma uses 77/150/29 (~0.299/0.587/0.114), chroma is evaluated only at
//! the top-left pixel of every 2x2 block. Output layout is I420: the full
//! luma plane, then the U plane, then the V plane.

use image::imageops::{self, FilterType};
use image::RgbaImage;

use crate::errors::RecorderError;

/// Byte order of a 32-bit interleaved pixel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// R, G, B, A
    Rgba,
    /// B, G, R, A (little-endian ARGB words)
    Bgra,
    /// A, R, G, B
    Argb,
}

impl PixelFormat {
    #[inline]
    fn rgb(self, px: &[u8]) -> (i32, i32, i32) {
        match self {
            PixelFormat::Rgba => (px[0] as i32, px[1] as i32, px[2] as i32),
            PixelFormat::Bgra => (px[2] as i32, px[1] as i32, px[0] as i32),
            PixelFormat::Argb => (px[1] as i32, px[2] as i32, px[3] as i32),
        }
    }
}

/// Resampling used when a frame does not match the recording dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResizeFilter {
    #[default]
    Nearest,
    Bilinear,
}

impl From<ResizeFilter> for FilterType {
    fn from(filter: ResizeFilter) -> Self {
        match filter {
            ResizeFilter::Nearest => FilterType::Nearest,
            ResizeFilter::Bilinear => FilterType::Triangle,
        }
    }
}

/// Size in bytes of an I420 frame
pub fn i420_size(width: u32, height: u32) -> usize {
    let w = width as usize;
    let h = height as usize;
    w * h + 2 * (w.div_ceil(2) * h.div_ceil(2))
}

/// Convert an interleaved 32-bit frame to I420 at the target dimensions.
///
/// Frames whose dimensions differ from the target are resized first so the
/// encoder always receives exactly `target_width * target_height * 3 / 2`
/// bytes.
pub fn convert(
    pixels: &[u8],
    format: PixelFormat,
    width: u32,
    height: u32,
    target_width: u32,
    target_height: u32,
    filter: ResizeFilter,
) -> Result<Vec<u8>, RecorderError> {
    if width == target_width && height == target_height {
        return to_i420(pixels, format, width, height);
    }

    let resized = pre_resize(pixels, width, height, target_width, target_height, filter)?;
    to_i420(&resized, format, target_width, target_height)
}

/// Resize an interleaved 32-bit frame.
///
/// Channels are resampled independently, so the byte order is preserved
/// whatever `PixelFormat` the buffer is in.
pub fn pre_resize(
    pixels: &[u8],
    width: u32,
    height: u32,
    target_width: u32,
    target_height: u32,
    filter: ResizeFilter,
) -> Result<Vec<u8>, RecorderError> {
    check_interleaved(pixels, width, height)?;
    if target_width == 0 || target_height == 0 {
        return Err(RecorderError::Capture(format!(
            "Invalid resize target {}x{}",
            target_width, target_height
        )));
    }

    let image = RgbaImage::from_raw(width, height, pixels.to_vec()).ok_or_else(|| {
        RecorderError::Capture(format!("Pixel buffer does not hold a {}x{} frame", width, height))
    })?;
    let resized = imageops::resize(&image, target_width, target_height, filter.into());
    Ok(resized.into_raw())
}

/// Convert an interleaved 32-bit frame to I420 without resizing
pub fn to_i420(
    pixels: &[u8],
    format: PixelFormat,
    width: u32,
    height: u32,
) -> Result<Vec<u8>, RecorderError> {
    check_interleaved(pixels, width, height)?;

    let w = width as usize;
    let h = height as usize;
    let cw = w.div_ceil(2);
    let ch = h.div_ceil(2);

    let mut yuv = vec![0u8; i420_size(width, height)];
    let (y_plane, chroma) = yuv.split_at_mut(w * h);
    let (u_plane, v_plane) = chroma.split_at_mut(cw * ch);

    for (row, line) in pixels.chunks_exact(w * 4).enumerate() {
        let y_row = &mut y_plane[row * w..(row + 1) * w];
        for (col, px) in line.chunks_exact(4).enumerate() {
            let (r, g, b) = format.rgb(px);

            let y = (77 * r + 150 * g + 29 * b) >> 8;
            y_row[col] = y.clamp(0, 255) as u8;

            if row % 2 == 0 && col % 2 == 0 {
                let idx = (row / 2) * cw + col / 2;
                let u = 128 + ((-43 * r - 85 * g + 128 * b) >> 8);
                let v = 128 + ((128 * r - 107 * g - 21 * b) >> 8);
                u_plane[idx] = u.clamp(0, 255) as u8;
                v_plane[idx] = v.clamp(0, 255) as u8;
            }
        }
    }

    Ok(yuv)
}

fn check_interleaved(pixels: &[u8], width: u32, height: u32) -> Result<(), RecorderError> {
    if width == 0 || height == 0 {
        return Err(RecorderError::Capture(format!(
            "Invalid frame dimensions {}x{}",
            width, height
        )));
    }
    let expected = width as usize * height as usize * 4;
    if pixels.len() != expected {
        return Err(RecorderError::Capture(format!(
            "Invalid frame size: expected {} bytes, got {}",
            expected,
            pixels.len()
        )));
    }
    Ok(())
}

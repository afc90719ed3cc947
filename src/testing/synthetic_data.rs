//! Synthetic frames and audio
//!
//! Patterns change every frame so the encoder has real temporal work to do,
//! which matters for the end-to-end MP4 tests.

use crate::recording::{AudioChunk, PixelFormat, RawFrame};

/// Moving gradient in the requested 4-byte packed layout
pub fn synthetic_rgba_frame(frame_number: u64, width: u32, height: u32, format: PixelFormat) -> RawFrame {
    let mut data = vec![0u8; (width * height * 4) as usize];
    let base = (frame_number % 256) as u8;

    for y in 0..height {
        for x in 0..width {
            let idx = ((y * width + x) * 4) as usize;
            let r = base.wrapping_add((x % 256) as u8);
            let g = base.wrapping_add((y % 256) as u8);
            let b = base.wrapping_add(((x + y) % 256) as u8);
            let px = match format {
                PixelFormat::Rgba => [r, g, b, 255],
                PixelFormat::Bgra => [b, g, r, 255],
                PixelFormat::Argb => [255, r, g, b],
            };
            data[idx..idx + 4].copy_from_slice(&px);
        }
    }

    RawFrame::interleaved(data, width, height, format)
}

/// Planar I420 frame with a luma ramp that scrolls with the frame number
pub fn synthetic_i420_frame(frame_number: u64, width: u32, height: u32) -> RawFrame {
    let w = width as usize;
    let h = height as usize;
    let chroma = w.div_ceil(2) * h.div_ceil(2);
    let mut data = Vec::with_capacity(w * h + 2 * chroma);

    let shift = (frame_number * 3) as usize;
    for y in 0..h {
        for x in 0..w {
            data.push(((x + y + shift) % 220 + 16) as u8);
        }
    }
    data.extend(std::iter::repeat(128u8).take(chroma));
    data.extend(std::iter::repeat(((frame_number * 5) % 64 + 96) as u8).take(chroma));

    RawFrame::planar(data, width, height)
}

/// 440 Hz tone, `frames` samples per channel
pub fn synthetic_audio_chunk(chunk_number: u64, frames: usize, sample_rate: u32, channels: u16) -> AudioChunk {
    let channels_usize = usize::from(channels.max(1));
    let mut samples = vec![0.0f32; frames * channels_usize];

    for i in 0..frames {
        let t = (chunk_number as f64 * frames as f64 + i as f64) / f64::from(sample_rate);
        let value = (2.0 * std::f64::consts::PI * 440.0 * t).sin() as f32 * 0.3;
        for c in 0..channels_usize {
            samples[i * channels_usize + c] = value;
        }
    }

    AudioChunk {
        samples,
        sample_rate,
        channels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::convert::i420_size;

    #[test]
    fn test_rgba_frame_layout() {
        let frame = synthetic_rgba_frame(0, 4, 2, PixelFormat::Argb);
        assert_eq!(frame.data.len(), 32);
        assert_eq!(frame.data[0], 255);
        assert!(!frame.is_planar());
    }

    #[test]
    fn test_i420_frame_size() {
        let frame = synthetic_i420_frame(3, 256, 192);
        assert_eq!(frame.data.len(), i420_size(256, 192));
        assert!(frame.is_planar());
    }

    #[test]
    fn test_frames_differ_over_time() {
        let a = synthetic_i420_frame(0, 16, 16);
        let b = synthetic_i420_frame(1, 16, 16);
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn test_audio_chunk_shape() {
        let chunk = synthetic_audio_chunk(0, 960, 48_000, 2);
        assert_eq!(chunk.samples.len(), 1920);
        assert_eq!(chunk.frames(), 960);
        assert!(chunk.samples.iter().all(|s| s.abs() <= 0.3));
    }
}

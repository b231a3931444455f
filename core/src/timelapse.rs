use std::borrow::Cow;

use gif::{Encoder, Frame as GifFrame, Repeat};
use image::RgbaImage;
use placelog_common::config::TimelapseConfig;
use placelog_common::frame::{CodecError, Frame};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum TimelapseError {
    #[error("not enough frames: got {got}, need at least {min}")]
    NotEnoughFrames { got: usize, min: usize },
    #[error("frame {sequence_id} is corrupt: {source}")]
    BadFrame {
        sequence_id: i64,
        source: CodecError,
    },
    #[error("frame {sequence_id} bounds {got_w}x{got_h} differ from first frame {want_w}x{want_h}")]
    BoundsMismatch {
        sequence_id: i64,
        got_w: u32,
        got_h: u32,
        want_w: u32,
        want_h: u32,
    },
    #[error("failed to encode GIF: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Copy)]
pub struct TimelapseOptions {
    /// Per-frame display delay in centiseconds.
    pub delay_cs: u16,
    pub min_frames: usize,
    /// Replay count for the animation. `None` replays once per frame, which
    /// is what the service has historically produced.
    pub repeat: Option<u16>,
}

impl Default for TimelapseOptions {
    fn default() -> Self {
        Self {
            delay_cs: 20,
            min_frames: 3,
            repeat: None,
        }
    }
}

impl TimelapseOptions {
    pub fn from_config(config: &TimelapseConfig) -> Self {
        Self {
            delay_cs: config.default_delay_cs,
            min_frames: config.min_frames,
            repeat: config.repeat,
        }
    }
}

// Fixed shared palette: a 6x6x6 color cube plus a 40-level gray ramp.
const CUBE_LEVELS: [u8; 6] = [0, 51, 102, 153, 204, 255];
const CUBE_SIZE: usize = 216;
const GRAY_COUNT: usize = 40;

fn shared_palette() -> [u8; 768] {
    let mut palette = [0u8; 768];
    let mut i = 0;
    for r in CUBE_LEVELS {
        for g in CUBE_LEVELS {
            for b in CUBE_LEVELS {
                palette[i] = r;
                palette[i + 1] = g;
                palette[i + 2] = b;
                i += 3;
            }
        }
    }
    for k in 0..GRAY_COUNT {
        let v = gray_level(k);
        palette[i] = v;
        palette[i + 1] = v;
        palette[i + 2] = v;
        i += 3;
    }
    palette
}

fn gray_level(k: usize) -> u8 {
    (k * 255 / (GRAY_COUNT - 1)) as u8
}

/// Nearest of the six cube levels (spacing 51).
fn cube_slot(channel: u8) -> usize {
    ((channel as usize + 25) / 51).min(5)
}

fn dist2(a: [u8; 3], b: [u8; 3]) -> u32 {
    a.iter()
        .zip(b)
        .map(|(&x, y)| {
            let d = x as i32 - y as i32;
            (d * d) as u32
        })
        .sum()
}

/// Map every pixel to its palette index. Near-gray pixels fall into the gray
/// ramp when it is closer than the cube entry; alpha is dropped.
fn quantize(pixels: &RgbaImage) -> Vec<u8> {
    pixels
        .pixels()
        .map(|p| {
            let [r, g, b, _] = p.0;
            let (ri, gi, bi) = (cube_slot(r), cube_slot(g), cube_slot(b));
            let cube = [CUBE_LEVELS[ri], CUBE_LEVELS[gi], CUBE_LEVELS[bi]];

            let luma = (r as usize * 299 + g as usize * 587 + b as usize * 114) / 1000;
            let gk = (luma * (GRAY_COUNT - 1) + 127) / 255;
            let gv = gray_level(gk);

            if dist2([r, g, b], [gv, gv, gv]) < dist2([r, g, b], cube) {
                (CUBE_SIZE + gk) as u8
            } else {
                (ri * 36 + gi * 6 + bi) as u8
            }
        })
        .collect()
}

/// Assemble an animated GIF from an ordered run of stored frames.
///
/// Frames must already be in one consistent chronological order; the
/// assembler never resorts them. A corrupt stored frame aborts the whole
/// assembly, identifying the offending sequence id.
pub fn assemble(frames: &[Frame], opts: TimelapseOptions) -> Result<Vec<u8>, TimelapseError> {
    if frames.len() < opts.min_frames {
        return Err(TimelapseError::NotEnoughFrames {
            got: frames.len(),
            min: opts.min_frames,
        });
    }

    let mut decoded = Vec::with_capacity(frames.len());
    for frame in frames {
        let pixels = frame.decode().map_err(|source| TimelapseError::BadFrame {
            sequence_id: frame.sequence_id,
            source,
        })?;
        decoded.push((frame.sequence_id, pixels));
    }

    let (width, height) = decoded[0].1.dimensions();
    // GIF dimensions are 16-bit; anything larger cannot be represented.
    if width > u16::MAX as u32 || height > u16::MAX as u32 {
        return Err(TimelapseError::Encode(format!(
            "frame bounds {width}x{height} exceed the GIF limit of {max}x{max}",
            max = u16::MAX
        )));
    }
    for (sequence_id, pixels) in &decoded[1..] {
        if pixels.dimensions() != (width, height) {
            return Err(TimelapseError::BoundsMismatch {
                sequence_id: *sequence_id,
                got_w: pixels.width(),
                got_h: pixels.height(),
                want_w: width,
                want_h: height,
            });
        }
    }

    let repeat = opts
        .repeat
        .unwrap_or_else(|| frames.len().min(u16::MAX as usize) as u16);

    let mut out = Vec::new();
    {
        let palette = shared_palette();
        let mut encoder = Encoder::new(&mut out, width as u16, height as u16, &palette)
            .map_err(|e| TimelapseError::Encode(e.to_string()))?;
        encoder
            .set_repeat(Repeat::Finite(repeat))
            .map_err(|e| TimelapseError::Encode(e.to_string()))?;

        for (_, pixels) in &decoded {
            let mut gif_frame = GifFrame::default();
            gif_frame.width = width as u16;
            gif_frame.height = height as u16;
            gif_frame.buffer = Cow::Owned(quantize(pixels));
            gif_frame.delay = opts.delay_cs;
            encoder
                .write_frame(&gif_frame)
                .map_err(|e| TimelapseError::Encode(e.to_string()))?;
        }
    }

    debug!(
        frames = frames.len(),
        delay_cs = opts.delay_cs,
        repeat,
        bytes = out.len(),
        "timelapse assembled"
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use image::Rgba;
    use placelog_common::frame::encode_png;
    use std::io::Cursor;

    fn frame(sequence_id: i64, rgba: [u8; 4]) -> Frame {
        Frame {
            sequence_id,
            place_id: 1,
            captured_at: Utc::now(),
            submitter: "t".into(),
            data: encode_png(&RgbaImage::from_pixel(4, 4, Rgba(rgba))).unwrap(),
        }
    }

    fn decode_gif(bytes: &[u8]) -> (Vec<Vec<u8>>, Repeat, Vec<u16>) {
        let mut options = gif::DecodeOptions::new();
        options.set_color_output(gif::ColorOutput::RGBA);
        let mut decoder = options.read_info(Cursor::new(bytes)).unwrap();
        let repeat = decoder.repeat();
        let mut frames = Vec::new();
        let mut delays = Vec::new();
        while let Some(f) = decoder.read_next_frame().unwrap() {
            frames.push(f.buffer.to_vec());
            delays.push(f.delay);
        }
        (frames, repeat, delays)
    }

    #[test]
    fn two_frames_is_insufficient() {
        let frames = vec![frame(1, [255, 0, 0, 255]), frame(2, [0, 255, 0, 255])];
        let err = assemble(&frames, TimelapseOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            TimelapseError::NotEnoughFrames { got: 2, min: 3 }
        ));
    }

    #[test]
    fn three_frames_in_input_order_with_delay() {
        let frames = vec![
            frame(1, [255, 0, 0, 255]),
            frame(2, [0, 255, 0, 255]),
            frame(3, [0, 0, 255, 255]),
        ];
        let gif_bytes = assemble(&frames, TimelapseOptions::default()).unwrap();
        let (decoded, repeat, delays) = decode_gif(&gif_bytes);

        assert_eq!(decoded.len(), 3);
        assert_eq!(delays, vec![20, 20, 20]);
        // Replay count defaults to the frame count.
        assert_eq!(repeat, Repeat::Finite(3));
        // Pure primaries are exact palette entries, so order is observable.
        assert_eq!(&decoded[0][0..3], &[255, 0, 0]);
        assert_eq!(&decoded[1][0..3], &[0, 255, 0]);
        assert_eq!(&decoded[2][0..3], &[0, 0, 255]);
    }

    #[test]
    fn delay_and_repeat_are_overridable() {
        let frames = vec![
            frame(1, [255, 0, 0, 255]),
            frame(2, [0, 255, 0, 255]),
            frame(3, [0, 0, 255, 255]),
        ];
        let opts = TimelapseOptions {
            delay_cs: 7,
            min_frames: 3,
            repeat: Some(1),
        };
        let (_, repeat, delays) = decode_gif(&assemble(&frames, opts).unwrap());
        assert_eq!(delays, vec![7, 7, 7]);
        assert_eq!(repeat, Repeat::Finite(1));
    }

    #[test]
    fn corrupt_frame_aborts_and_is_identified() {
        let mut frames = vec![
            frame(10, [255, 0, 0, 255]),
            frame(11, [0, 255, 0, 255]),
            frame(12, [0, 0, 255, 255]),
        ];
        frames[1].data = b"corrupt".to_vec();

        let err = assemble(&frames, TimelapseOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            TimelapseError::BadFrame {
                sequence_id: 11,
                ..
            }
        ));
    }

    #[test]
    fn mismatched_bounds_rejected() {
        let mut frames = vec![
            frame(1, [255, 0, 0, 255]),
            frame(2, [0, 255, 0, 255]),
            frame(3, [0, 0, 255, 255]),
        ];
        frames[2].data =
            encode_png(&RgbaImage::from_pixel(8, 8, Rgba([0, 0, 255, 255]))).unwrap();

        let err = assemble(&frames, TimelapseOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            TimelapseError::BoundsMismatch {
                sequence_id: 3,
                ..
            }
        ));
    }

    #[test]
    fn oversized_frames_rejected_before_encoding() {
        let wide = RgbaImage::from_pixel(u16::MAX as u32 + 1, 1, Rgba([0, 0, 0, 255]));
        let data = encode_png(&wide).unwrap();
        let frames: Vec<Frame> = (1..=3)
            .map(|sequence_id| Frame {
                sequence_id,
                place_id: 1,
                captured_at: Utc::now(),
                submitter: "t".into(),
                data: data.clone(),
            })
            .collect();

        let err = assemble(&frames, TimelapseOptions::default()).unwrap_err();
        assert!(matches!(err, TimelapseError::Encode(_)));
    }

    #[test]
    fn palette_has_256_entries() {
        let palette = shared_palette();
        assert_eq!(palette.len(), 768);
        // Last gray ramp entry is pure white.
        assert_eq!(&palette[765..768], &[255, 255, 255]);
    }

    #[test]
    fn quantize_maps_exact_palette_colors_to_themselves() {
        let palette = shared_palette();
        for rgba in [[255u8, 0, 0, 255], [0, 255, 0, 255], [51, 102, 153, 255]] {
            let img = RgbaImage::from_pixel(1, 1, Rgba(rgba));
            let idx = quantize(&img)[0] as usize;
            assert_eq!(&palette[idx * 3..idx * 3 + 3], &rgba[0..3]);
        }
    }

    #[test]
    fn quantize_prefers_gray_ramp_for_gray_pixels() {
        // 128 is 26 away from both cube levels 102 and 153 but only ~3 away
        // from the nearest gray ramp entry.
        let img = RgbaImage::from_pixel(1, 1, Rgba([128, 128, 128, 255]));
        let idx = quantize(&img)[0] as usize;
        assert!(idx >= CUBE_SIZE);

        let palette = shared_palette();
        let v = palette[idx * 3];
        assert!((v as i32 - 128).abs() <= 4);
    }
}

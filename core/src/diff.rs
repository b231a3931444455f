use image::{Pixel, Rgba, RgbaImage};

use crate::detector::BoundsMismatch;

const HIGHLIGHT: Rgba<u8> = Rgba([255, 0, 0, 255]);
/// Unchanged pixels keep their color from `a` at roughly 40% opacity so the
/// highlighted regions stand out when scanning a large canvas.
const UNCHANGED_ALPHA: u8 = 102;

/// Render a highlight image of the pixels that changed between two frames.
///
/// Pixels are compared at the luminance level rather than by exact RGBA
/// equality, which tolerates lossy re-encoding noise while still flagging
/// genuine edits. The changed/unchanged classification is symmetric in the
/// argument order; only the desaturated color of unchanged pixels follows `a`.
pub fn render_diff(a: &RgbaImage, b: &RgbaImage) -> Result<RgbaImage, BoundsMismatch> {
    if a.dimensions() != b.dimensions() {
        return Err(BoundsMismatch::new(a, b));
    }

    let mut out = RgbaImage::new(a.width(), a.height());
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let pa = a.get_pixel(x, y);
        let pb = b.get_pixel(x, y);
        if pa.to_luma()[0] != pb.to_luma()[0] {
            *pixel = HIGHLIGHT;
        } else {
            let Rgba([r, g, bl, _]) = *pa;
            *pixel = Rgba([r, g, bl, UNCHANGED_ALPHA]);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, rgba: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba(rgba))
    }

    fn changed_positions(diff: &RgbaImage) -> Vec<(u32, u32)> {
        diff.enumerate_pixels()
            .filter(|(_, _, p)| **p == HIGHLIGHT)
            .map(|(x, y, _)| (x, y))
            .collect()
    }

    #[test]
    fn changed_pixels_are_highlighted_red() {
        let a = solid(2, 2, [0, 0, 0, 255]);
        let mut b = a.clone();
        b.put_pixel(1, 0, Rgba([255, 255, 255, 255]));

        let diff = render_diff(&a, &b).unwrap();
        assert_eq!(changed_positions(&diff), vec![(1, 0)]);
    }

    #[test]
    fn unchanged_pixels_keep_color_at_reduced_opacity() {
        let a = solid(2, 1, [40, 80, 120, 255]);
        let diff = render_diff(&a, &a).unwrap();
        for (_, _, p) in diff.enumerate_pixels() {
            assert_eq!(*p, Rgba([40, 80, 120, UNCHANGED_ALPHA]));
        }
    }

    #[test]
    fn classification_is_symmetric() {
        let a = solid(3, 3, [10, 10, 10, 255]);
        let mut b = a.clone();
        b.put_pixel(0, 0, Rgba([200, 10, 10, 255]));
        b.put_pixel(2, 2, Rgba([10, 200, 10, 255]));

        let ab = render_diff(&a, &b).unwrap();
        let ba = render_diff(&b, &a).unwrap();
        assert_eq!(changed_positions(&ab), changed_positions(&ba));
    }

    #[test]
    fn equal_luminance_counts_as_unchanged() {
        // Alpha does not affect luminance, so an alpha-only edit is tolerated.
        let a = solid(1, 1, [50, 50, 50, 255]);
        let b = solid(1, 1, [50, 50, 50, 10]);
        let diff = render_diff(&a, &b).unwrap();
        assert!(changed_positions(&diff).is_empty());
    }

    #[test]
    fn bounds_mismatch_fails_without_output() {
        let a = solid(2, 2, [0, 0, 0, 255]);
        let b = solid(2, 3, [0, 0, 0, 255]);
        assert!(render_diff(&a, &b).is_err());
    }

    #[test]
    fn output_dimensions_match_inputs() {
        let a = solid(5, 7, [1, 2, 3, 255]);
        let diff = render_diff(&a, &a).unwrap();
        assert_eq!(diff.dimensions(), (5, 7));
    }
}

use image::RgbaImage;
use tracing::debug;

/// Two frames being compared or diffed do not share dimensions. This is an
/// administrative inconsistency, not an ordinary rejection.
#[derive(Debug, thiserror::Error)]
#[error("image bounds differ: {a_width}x{a_height} vs {b_width}x{b_height}")]
pub struct BoundsMismatch {
    pub a_width: u32,
    pub a_height: u32,
    pub b_width: u32,
    pub b_height: u32,
}

impl BoundsMismatch {
    pub(crate) fn new(a: &RgbaImage, b: &RgbaImage) -> Self {
        Self {
            a_width: a.width(),
            a_height: a.height(),
            b_width: b.width(),
            b_height: b.height(),
        }
    }
}

/// Mean squared per-channel difference between two equal-size RGBA images,
/// averaged over all pixels and all four channels.
pub fn score(a: &RgbaImage, b: &RgbaImage) -> Result<f64, BoundsMismatch> {
    if a.dimensions() != b.dimensions() {
        return Err(BoundsMismatch::new(a, b));
    }

    let channels = a.width() as f64 * a.height() as f64 * 4.0;
    if channels == 0.0 {
        return Ok(0.0);
    }

    let mut sum = 0.0f64;
    for (pa, pb) in a.pixels().zip(b.pixels()) {
        for c in 0..4 {
            let d = pa.0[c] as f64 - pb.0[c] as f64;
            sum += d * d;
        }
    }
    Ok(sum / channels)
}

/// Decides whether a candidate frame differs enough from the last accepted
/// one to be worth storing.
pub struct ChangeDetector {
    threshold: f64,
}

impl ChangeDetector {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Accept iff the dissimilarity score strictly exceeds the threshold.
    /// The first frame for a place (no previous) is always accepted.
    /// A `false` result is a normal duplicate-suppression outcome, not an error.
    pub fn should_accept(
        &self,
        candidate: &RgbaImage,
        previous: Option<&RgbaImage>,
    ) -> Result<bool, BoundsMismatch> {
        let Some(previous) = previous else {
            debug!("no previous frame, accepting unconditionally");
            return Ok(true);
        };

        let mse = score(candidate, previous)?;
        let accepted = mse > self.threshold;
        debug!(
            mse = format!("{mse:.3}"),
            threshold = self.threshold,
            accepted,
            "frame comparison"
        );
        Ok(accepted)
    }
}

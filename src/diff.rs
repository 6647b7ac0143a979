//! Pixel comparison between a fresh response image and its baseline.

use crate::model::OutcomeStatus;
use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

/// An opaque RGB color, written as `[r, g, b]` in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub fn to_rgba(self) -> Rgba<u8> {
        Rgba([self.0, self.1, self.2, 255])
    }

    fn matches(self, px: &Rgba<u8>) -> bool {
        px[0] == self.0 && px[1] == self.1 && px[2] == self.2
    }
}

/// Colors used to paint the difference raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffColors {
    #[serde(default = "default_background")]
    pub background: Rgb,
    #[serde(default = "default_small_diff")]
    pub small_diff: Rgb,
    #[serde(default = "default_big_diff")]
    pub big_diff: Rgb,
}

fn default_background() -> Rgb {
    Rgb(255, 255, 255)
}

fn default_small_diff() -> Rgb {
    Rgb(255, 200, 0)
}

fn default_big_diff() -> Rgb {
    Rgb(255, 0, 0)
}

impl Default for DiffColors {
    fn default() -> Self {
        Self {
            background: default_background(),
            small_diff: default_small_diff(),
            big_diff: default_big_diff(),
        }
    }
}

/// Run-time settings for the diff engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiffConfig {
    /// Largest per-channel delta still counted as a small difference.
    #[serde(default = "default_tolerance")]
    pub tolerance: u8,
    #[serde(default)]
    pub colors: DiffColors,
    /// Weight of the diff raster when composing an overlay, 0.0..=1.0.
    #[serde(default = "default_overlay_opacity")]
    pub overlay_opacity: f32,
}

fn default_tolerance() -> u8 {
    15
}

fn default_overlay_opacity() -> f32 {
    0.6
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
            colors: DiffColors::default(),
            overlay_opacity: default_overlay_opacity(),
        }
    }
}

/// Output of [`DiffEngine::classify`].
#[derive(Debug, Clone, PartialEq)]
pub struct DiffResult {
    pub image: RgbaImage,
    /// Pixels that differ at all.
    pub invalid_pixels: u64,
    /// Pixels where some channel differs by more than the tolerance.
    pub big_diff_pixels: u64,
}

impl DiffResult {
    pub fn total_pixels(&self) -> u64 {
        u64::from(self.image.width()) * u64::from(self.image.height())
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiffEngine {
    config: DiffConfig,
}

impl DiffEngine {
    pub fn new(config: DiffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DiffConfig {
        &self.config
    }

    /// Classify every pixel of `candidate` against `baseline`.
    ///
    /// Both images must have the same dimensions; callers route size
    /// mismatches to an error outcome instead of calling this.
    pub fn classify(&self, candidate: &RgbaImage, baseline: &RgbaImage) -> DiffResult {
        debug_assert_eq!(candidate.dimensions(), baseline.dimensions());

        let colors = self.config.colors;
        let tolerance = i16::from(self.config.tolerance);
        let (width, height) = candidate.dimensions();
        let mut image = RgbaImage::from_pixel(width, height, colors.background.to_rgba());
        let mut invalid_pixels = 0u64;
        let mut big_diff_pixels = 0u64;

        for (x, y, out) in image.enumerate_pixels_mut() {
            let a = candidate.get_pixel(x, y);
            let b = baseline.get_pixel(x, y);
            if a == b {
                continue;
            }
            invalid_pixels += 1;

            let big = (0..3).any(|c| (i16::from(a[c]) - i16::from(b[c])).abs() > tolerance);
            if big {
                big_diff_pixels += 1;
                *out = colors.big_diff.to_rgba();
            } else {
                *out = colors.small_diff.to_rgba();
            }
        }

        DiffResult {
            image,
            invalid_pixels,
            big_diff_pixels,
        }
    }

    /// Blend `diff` over `base`. Pixels of `diff` equal to `transparent`
    /// leave `base` untouched; all others are mixed in with the
    /// configured overlay opacity scaled by their own alpha.
    pub fn compose(&self, base: &RgbaImage, diff: &RgbaImage, transparent: Rgb) -> RgbaImage {
        compose(base, diff, transparent, self.config.overlay_opacity)
    }
}

/// See [`DiffEngine::compose`].
pub fn compose(base: &RgbaImage, diff: &RgbaImage, transparent: Rgb, opacity: f32) -> RgbaImage {
    let opacity = opacity.clamp(0.0, 1.0);
    let mut out = base.clone();
    for (x, y, px) in out.enumerate_pixels_mut() {
        if x >= diff.width() || y >= diff.height() {
            continue;
        }
        let over = diff.get_pixel(x, y);
        if transparent.matches(over) {
            continue;
        }
        let alpha = opacity * f32::from(over[3]) / 255.0;
        for c in 0..3 {
            let blended = f32::from(px[c]) * (1.0 - alpha) + f32::from(over[c]) * alpha;
            px[c] = blended.round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Maps diff statistics to an outcome status.
pub trait StatusPolicy: Send + Sync {
    fn status(&self, diff: &DiffResult) -> OutcomeStatus;
}

/// Default policy: too many differing pixels, or differences that are
/// mostly big, fail the case; any remaining difference is a warning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdPolicy {
    /// Fail when `invalid / total` exceeds this ratio.
    #[serde(default = "default_max_invalid_ratio")]
    pub max_invalid_ratio: f64,
    /// Fail when there are big differences and `invalid / big` is
    /// below this value.
    #[serde(default = "default_min_invalid_per_big")]
    pub min_invalid_per_big: u64,
}

fn default_max_invalid_ratio() -> f64 {
    0.01
}

fn default_min_invalid_per_big() -> u64 {
    3
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            max_invalid_ratio: default_max_invalid_ratio(),
            min_invalid_per_big: default_min_invalid_per_big(),
        }
    }
}

impl StatusPolicy for ThresholdPolicy {
    fn status(&self, diff: &DiffResult) -> OutcomeStatus {
        let total = diff.total_pixels();
        let invalid = diff.invalid_pixels;
        let big = diff.big_diff_pixels;

        if total > 0 && invalid as f64 / total as f64 > self.max_invalid_ratio {
            return OutcomeStatus::Failed;
        }
        if big > 0 && invalid < self.min_invalid_per_big.saturating_mul(big) {
            return OutcomeStatus::Failed;
        }
        if invalid == 0 {
            OutcomeStatus::Success
        } else {
            OutcomeStatus::Warning
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, px: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba(px))
    }

    fn result(w: u32, h: u32, invalid: u64, big: u64) -> DiffResult {
        DiffResult {
            image: solid(w, h, [0, 0, 0, 255]),
            invalid_pixels: invalid,
            big_diff_pixels: big,
        }
    }

    #[test]
    fn test_identical_images() {
        let engine = DiffEngine::default();
        let img = solid(10, 10, [10, 20, 30, 255]);
        let res = engine.classify(&img, &img);
        assert_eq!(res.invalid_pixels, 0);
        assert_eq!(res.big_diff_pixels, 0);
        let bg = engine.config().colors.background.to_rgba();
        assert!(res.image.pixels().all(|p| *p == bg));
    }

    #[test]
    fn test_single_big_difference() {
        let engine = DiffEngine::default();
        let base = solid(4, 4, [100, 100, 100, 255]);
        let mut cand = base.clone();
        cand.put_pixel(2, 1, Rgba([120, 100, 100, 255]));

        let res = engine.classify(&cand, &base);
        assert_eq!(res.invalid_pixels, 1);
        assert_eq!(res.big_diff_pixels, 1);
        assert_eq!(
            *res.image.get_pixel(2, 1),
            engine.config().colors.big_diff.to_rgba()
        );
    }

    #[test]
    fn test_small_difference_within_tolerance() {
        let engine = DiffEngine::default();
        let base = solid(4, 4, [100, 100, 100, 255]);
        let mut cand = base.clone();
        cand.put_pixel(0, 0, Rgba([100, 115, 90, 255]));

        let res = engine.classify(&cand, &base);
        assert_eq!(res.invalid_pixels, 1);
        assert_eq!(res.big_diff_pixels, 0);
        assert_eq!(
            *res.image.get_pixel(0, 0),
            engine.config().colors.small_diff.to_rgba()
        );
    }

    #[test]
    fn test_classify_is_idempotent() {
        let engine = DiffEngine::new(DiffConfig {
            tolerance: 5,
            ..DiffConfig::default()
        });
        let base = RgbaImage::from_fn(8, 8, |x, y| Rgba([x as u8 * 9, y as u8 * 9, 0, 255]));
        let cand = RgbaImage::from_fn(8, 8, |x, y| Rgba([x as u8 * 10, y as u8 * 9, 3, 255]));
        assert_eq!(engine.classify(&cand, &base), engine.classify(&cand, &base));
    }

    #[test]
    fn test_custom_colors_are_used() {
        let colors = DiffColors {
            background: Rgb(0, 0, 0),
            small_diff: Rgb(0, 0, 255),
            big_diff: Rgb(0, 255, 0),
        };
        let engine = DiffEngine::new(DiffConfig {
            colors,
            ..DiffConfig::default()
        });
        let base = solid(2, 1, [0, 0, 0, 255]);
        let mut cand = base.clone();
        cand.put_pixel(1, 0, Rgba([200, 0, 0, 255]));
        let res = engine.classify(&cand, &base);
        assert_eq!(*res.image.get_pixel(0, 0), Rgba([0, 0, 0, 255]));
        assert_eq!(*res.image.get_pixel(1, 0), Rgba([0, 255, 0, 255]));
    }

    #[test]
    fn test_compose_skips_transparent_color() {
        let base = solid(2, 1, [0, 0, 0, 255]);
        let mut diff = solid(2, 1, [255, 255, 255, 255]);
        diff.put_pixel(1, 0, Rgba([255, 0, 0, 255]));

        let out = compose(&base, &diff, Rgb(255, 255, 255), 1.0);
        assert_eq!(*out.get_pixel(0, 0), Rgba([0, 0, 0, 255]));
        assert_eq!(*out.get_pixel(1, 0), Rgba([255, 0, 0, 255]));

        let half = compose(&base, &diff, Rgb(255, 255, 255), 0.5);
        assert_eq!(*half.get_pixel(1, 0), Rgba([128, 0, 0, 255]));
    }

    #[test]
    fn test_policy_success_and_warning() {
        let policy = ThresholdPolicy::default();
        assert_eq!(policy.status(&result(100, 100, 0, 0)), OutcomeStatus::Success);
        // 50 of 10000 pixels, no big differences
        assert_eq!(policy.status(&result(100, 100, 50, 0)), OutcomeStatus::Warning);
        // invalid / big == 5, not below 3
        assert_eq!(policy.status(&result(100, 100, 50, 10)), OutcomeStatus::Warning);
    }

    #[test]
    fn test_policy_failures() {
        let policy = ThresholdPolicy::default();
        // 2% of the pixels differ
        assert_eq!(policy.status(&result(100, 100, 200, 0)), OutcomeStatus::Failed);
        // mostly big differences
        assert_eq!(policy.status(&result(100, 100, 20, 10)), OutcomeStatus::Failed);
        assert_eq!(policy.status(&result(100, 100, 1, 1)), OutcomeStatus::Failed);
    }
}

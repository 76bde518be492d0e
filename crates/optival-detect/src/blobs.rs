//! Blob extraction for circle-grid targets and electrode markers.

use optival_core::math::Pt2;

use crate::image::GrayView;

/// Whether blobs are darker or brighter than the background.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlobPolarity {
    Dark,
    Bright,
}

/// Blob extraction parameters.
#[derive(Clone, Copy, Debug)]
pub struct BlobParams {
    pub polarity: BlobPolarity,
    pub min_area: usize,
    pub max_area: usize,
    /// Minimum blob area over bounding-box area. A filled circle scores
    /// about 0.78.
    pub min_fill_ratio: f64,
    /// Maximum bounding-box side ratio.
    pub max_aspect: f64,
}

impl Default for BlobParams {
    fn default() -> Self {
        Self {
            polarity: BlobPolarity::Dark,
            min_area: 12,
            max_area: 20_000,
            min_fill_ratio: 0.6,
            max_aspect: 2.0,
        }
    }
}

/// One extracted blob.
#[derive(Clone, Copy, Debug)]
pub struct Blob {
    /// Intensity-weighted centroid.
    pub centroid: Pt2,
    pub area: usize,
    /// Mean foreground contrast relative to the threshold, in `[0, 1]`.
    pub contrast: f64,
}

#[inline]
fn foreground_weight(value: u8, threshold: f64, polarity: BlobPolarity) -> f64 {
    match polarity {
        BlobPolarity::Dark => (threshold - value as f64).max(0.0),
        BlobPolarity::Bright => (value as f64 - threshold).max(0.0),
    }
}

/// Extract blobs of the requested polarity.
///
/// Binarizes at the midpoint of the frame's intensity range, groups
/// foreground pixels by 4-connectivity, and keeps components passing
/// the area and shape gates. Centroids are weighted by contrast so they
/// stay stable under mild blur.
pub fn find_blobs(src: &GrayView<'_>, params: &BlobParams) -> Vec<Blob> {
    if src.data.is_empty() {
        return Vec::new();
    }
    let lo = *src.data.iter().min().unwrap_or(&0) as f64;
    let hi = *src.data.iter().max().unwrap_or(&255) as f64;
    if hi - lo < 8.0 {
        return Vec::new();
    }
    let threshold = (lo + hi) / 2.0;
    let max_weight = match params.polarity {
        BlobPolarity::Dark => threshold - lo,
        BlobPolarity::Bright => hi - threshold,
    };

    let w = src.width;
    let h = src.height;
    let mut visited = vec![false; w * h];
    let mut stack = Vec::new();
    let mut blobs = Vec::new();

    for start in 0..w * h {
        if visited[start] || foreground_weight(src.data[start], threshold, params.polarity) <= 0.0
        {
            continue;
        }

        visited[start] = true;
        stack.push(start);
        let mut area = 0usize;
        let mut weight_sum = 0.0;
        let mut wx = 0.0;
        let mut wy = 0.0;
        let (mut min_x, mut max_x) = (usize::MAX, 0usize);
        let (mut min_y, mut max_y) = (usize::MAX, 0usize);

        while let Some(idx) = stack.pop() {
            let x = idx % w;
            let y = idx / w;
            let weight = foreground_weight(src.data[idx], threshold, params.polarity);

            area += 1;
            weight_sum += weight;
            wx += weight * x as f64;
            wy += weight * y as f64;
            min_x = min_x.min(x);
            max_x = max_x.max(x);
            min_y = min_y.min(y);
            max_y = max_y.max(y);

            let mut visit = |nx: usize, ny: usize| {
                let nidx = ny * w + nx;
                if !visited[nidx]
                    && foreground_weight(src.data[nidx], threshold, params.polarity) > 0.0
                {
                    visited[nidx] = true;
                    stack.push(nidx);
                }
            };
            if x > 0 {
                visit(x - 1, y);
            }
            if x + 1 < w {
                visit(x + 1, y);
            }
            if y > 0 {
                visit(x, y - 1);
            }
            if y + 1 < h {
                visit(x, y + 1);
            }
        }

        if area < params.min_area || area > params.max_area || weight_sum <= 0.0 {
            continue;
        }
        let bbox_w = (max_x - min_x + 1) as f64;
        let bbox_h = (max_y - min_y + 1) as f64;
        let fill = area as f64 / (bbox_w * bbox_h);
        let aspect = bbox_w.max(bbox_h) / bbox_w.min(bbox_h);
        if fill < params.min_fill_ratio || aspect > params.max_aspect {
            continue;
        }

        blobs.push(Blob {
            centroid: Pt2::new(wx / weight_sum, wy / weight_sum),
            area,
            contrast: (weight_sum / (area as f64 * max_weight)).clamp(0.0, 1.0),
        });
    }

    blobs
}

/// A detected electrode marker in one frame.
#[derive(Clone, Copy, Debug)]
pub struct SpotDetection {
    pub pixel: Pt2,
    /// Contrast-based confidence in `(0, 1]`.
    pub confidence: f64,
}

/// Detect bright electrode markers, strongest first.
pub fn find_spots(src: &GrayView<'_>, max_count: usize) -> Vec<SpotDetection> {
    let params = BlobParams {
        polarity: BlobPolarity::Bright,
        min_area: 4,
        max_area: 4_000,
        min_fill_ratio: 0.5,
        max_aspect: 2.5,
    };
    let mut blobs = find_blobs(src, &params);
    blobs.sort_by(|a, b| b.contrast.total_cmp(&a.contrast));
    blobs
        .into_iter()
        .take(max_count)
        .map(|b| SpotDetection {
            pixel: b.centroid,
            confidence: b.contrast.max(f64::MIN_POSITIVE),
        })
        .collect()
}

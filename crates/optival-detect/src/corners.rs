//! Checkerboard junction detection and sub-pixel refinement.

use nalgebra::{Matrix2, Vector2};

use optival_core::math::Pt2;

use crate::image::{sample_bilinear, sample_gradient, GrayView};

/// Number of samples on the scoring ring.
const RING_SAMPLES: usize = 16;

/// Candidate junction at integer pixel resolution.
#[derive(Clone, Copy, Debug)]
pub struct CornerCandidate {
    pub x: usize,
    pub y: usize,
    pub response: f64,
}

/// Ring response of one pixel.
///
/// Samples a circle of `radius` pixels at 16 angles. A checkerboard
/// junction has opposite arcs of equal intensity and adjacent arcs of
/// inverted intensity, so the quarter-cycle contrast is high while the
/// half-cycle difference vanishes. Edges and plain corners score near
/// zero.
pub fn ring_response(src: &GrayView<'_>, x: f64, y: f64, radius: f64) -> f64 {
    let mut ring = [0.0f64; RING_SAMPLES];
    for (k, sample) in ring.iter_mut().enumerate() {
        let theta = std::f64::consts::TAU * k as f64 / RING_SAMPLES as f64;
        *sample = sample_bilinear(src, x + radius * theta.cos(), y + radius * theta.sin());
    }

    let mut cross = 0.0;
    let mut edge = 0.0;
    for k in 0..RING_SAMPLES / 2 {
        let a = ring[k];
        let b = ring[(k + 4) % RING_SAMPLES];
        let c = ring[(k + 8) % RING_SAMPLES];
        let d = ring[(k + 12) % RING_SAMPLES];
        cross += (a + c - b - d).abs();
        edge += (a - c).abs() + (b - d).abs();
    }

    let mean = ring.iter().sum::<f64>() / RING_SAMPLES as f64;
    let centre = sample_bilinear(src, x, y);
    (cross - edge - 8.0 * (centre - mean).abs()).max(0.0)
}

/// Scan the frame and keep local response maxima.
///
/// Returns candidates whose response exceeds `threshold_rel` times the
/// strongest response and which are maximal within `nms_radius`.
pub fn find_junctions(
    src: &GrayView<'_>,
    ring_radius: f64,
    nms_radius: usize,
    threshold_rel: f64,
) -> Vec<CornerCandidate> {
    let margin = ring_radius.ceil() as usize + 1;
    if src.width <= 2 * margin || src.height <= 2 * margin {
        return Vec::new();
    }

    let mut response = vec![0.0f64; src.width * src.height];
    let mut max_response = 0.0f64;
    for y in margin..src.height - margin {
        for x in margin..src.width - margin {
            let r = ring_response(src, x as f64, y as f64, ring_radius);
            response[y * src.width + x] = r;
            max_response = max_response.max(r);
        }
    }
    if max_response <= 0.0 {
        return Vec::new();
    }

    let threshold = threshold_rel * max_response;
    let r = nms_radius as i64;
    let mut out = Vec::new();
    for y in margin..src.height - margin {
        for x in margin..src.width - margin {
            let v = response[y * src.width + x];
            if v < threshold {
                continue;
            }
            let mut is_max = true;
            'nms: for dy in -r..=r {
                for dx in -r..=r {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = (x as i64 + dx) as usize;
                    let ny = (y as i64 + dy) as usize;
                    let n = response[ny * src.width + nx];
                    // Ties break toward the lexicographically first pixel.
                    if n > v || (n == v && (ny, nx) < (y, x)) {
                        is_max = false;
                        break 'nms;
                    }
                }
            }
            if is_max {
                out.push(CornerCandidate { x, y, response: v });
            }
        }
    }
    out
}

/// Refine a corner to sub-pixel accuracy by gradient orthogonality.
///
/// Every window point `q` with nonzero gradient satisfies
/// `grad(q) . (q - c) = 0` at the true corner `c`, which yields the
/// normal equations solved here. The window recentres after each step;
/// iteration stops once the update drops below `eps` pixels.
pub fn refine_subpixel(
    src: &GrayView<'_>,
    start: Pt2,
    half_window: usize,
    max_iterations: usize,
    eps: f64,
) -> Pt2 {
    let h = half_window as i64;
    let sigma = half_window as f64 / 2.0;
    let mut c = Vector2::new(start.x, start.y);

    for _ in 0..max_iterations {
        let mut ata = Matrix2::zeros();
        let mut atb = Vector2::zeros();

        for dy in -h..=h {
            for dx in -h..=h {
                let q = Vector2::new(c.x + dx as f64, c.y + dy as f64);
                let (gx, gy) = sample_gradient(src, q.x, q.y);
                let w = (-((dx * dx + dy * dy) as f64) / (2.0 * sigma * sigma)).exp();
                let gxx = w * gx * gx;
                let gxy = w * gx * gy;
                let gyy = w * gy * gy;
                ata[(0, 0)] += gxx;
                ata[(0, 1)] += gxy;
                ata[(1, 0)] += gxy;
                ata[(1, 1)] += gyy;
                atb.x += gxx * q.x + gxy * q.y;
                atb.y += gxy * q.x + gyy * q.y;
            }
        }

        let Some(inv) = ata.try_inverse() else {
            break;
        };
        let next = inv * atb;
        let shift = (next - c).norm();
        c = next;
        if shift < eps {
            break;
        }
    }

    Pt2::new(c.x, c.y)
}

//! Synthetic rig and scene generators for tests and demos.
//!
//! The functions here build camera rings around the working volume,
//! place the calibration pattern inside it, and project everything into
//! ideal pixel observations. All randomness is seeded so scenarios are
//! reproducible.

use anyhow::{bail, Result};
use nalgebra::{Translation3, UnitQuaternion};
use rand::Rng;

use crate::camera::{CameraModel, Distortion, Intrinsics};
use crate::math::{Iso3, Pt2, Pt3, Real, Vec3};
use crate::pattern::PatternSpec;
use crate::types::{
    bounding_box_coverage, CalibrationView, CameraId, ElectrodeObservation, PatternDetection,
    TimestampUs,
};

/// Intrinsics of a nominal rig camera with the principal point at the
/// image centre.
pub fn default_intrinsics(image_width: u32, image_height: u32) -> Intrinsics {
    Intrinsics {
        fx: 1500.0,
        fy: 1500.0,
        cx: image_width as Real / 2.0,
        cy: image_height as Real / 2.0,
        skew: 0.0,
    }
}

/// Build `count` cameras on a ring looking at the world origin.
///
/// Cameras sit at `distance_mm` from the origin, elevated by
/// `elevation_deg` above the X-Y plane, evenly spaced in azimuth.
/// Camera 0 defines the reference viewpoint; all share `intrinsics` and
/// zero distortion.
pub fn ring_cameras(
    count: usize,
    distance_mm: Real,
    elevation_deg: Real,
    intrinsics: Intrinsics,
) -> Vec<CameraModel> {
    let elevation = elevation_deg.to_radians();
    (0..count)
        .map(|i| {
            let azimuth = std::f64::consts::TAU * i as Real / count as Real;
            let eye = Pt3::new(
                distance_mm * elevation.cos() * azimuth.cos(),
                distance_mm * elevation.cos() * azimuth.sin(),
                distance_mm * elevation.sin(),
            );
            // face_towards yields world_se3_cam with +Z toward the target;
            // the camera pose convention is its inverse.
            let world_se3_cam =
                Iso3::face_towards(&eye, &Pt3::origin(), &Vec3::new(0.0, 0.0, 1.0));
            CameraModel {
                id: CameraId(i as u32),
                intrinsics,
                distortion: Distortion::default(),
                pose: world_se3_cam.inverse(),
            }
        })
        .collect()
}

/// Generate `n_views` pattern placements inside the working volume.
///
/// Each placement tilts the pattern a little further around alternating
/// axes and shifts it along X so consecutive views differ in both
/// orientation and position.
pub fn pattern_placements(
    n_views: usize,
    tilt_start_rad: Real,
    tilt_step_rad: Real,
    shift_step_mm: Real,
) -> Vec<Iso3> {
    (0..n_views)
        .map(|view_idx| {
            let tilt = tilt_start_rad + tilt_step_rad * view_idx as Real;
            let axis = if view_idx % 2 == 0 {
                Vec3::new(1.0, 0.0, 0.0)
            } else {
                Vec3::new(0.0, 1.0, 0.0)
            };
            let rotation = UnitQuaternion::from_scaled_axis(axis * tilt);
            let shift = shift_step_mm * (view_idx as Real - n_views as Real / 2.0);
            Iso3::from_parts(Translation3::new(shift, 0.0, 0.0), rotation)
        })
        .collect()
}

/// Pattern feature points in the world frame for one placement.
///
/// The pattern's own points are centred first so a placement with zero
/// translation puts the pattern centre at the world origin.
pub fn pattern_world_points(pattern: &PatternSpec, world_se3_pattern: &Iso3) -> Vec<Pt3> {
    let (width, height) = pattern.physical_size();
    let half = Vec3::new(width / 2.0, height / 2.0, 0.0);
    pattern
        .object_points()
        .iter()
        .map(|p| world_se3_pattern.transform_point(&(p - half)))
        .collect()
}

/// Project one pattern placement into every rig camera.
///
/// A camera contributes a detection only when all pattern points land
/// inside its frame. Fails when fewer than two cameras see the pattern.
pub fn project_pattern_view(
    cameras: &[CameraModel],
    pattern: &PatternSpec,
    world_se3_pattern: &Iso3,
    image_width: u32,
    image_height: u32,
    timestamp_us: TimestampUs,
) -> Result<CalibrationView> {
    let world_points = pattern_world_points(pattern, world_se3_pattern);
    let mut detections = Vec::with_capacity(cameras.len());

    for camera in cameras {
        detections.push(project_full_detection(
            camera,
            &world_points,
            image_width,
            image_height,
        )?);
    }

    CalibrationView::new(timestamp_us, detections)
}

fn project_full_detection(
    camera: &CameraModel,
    world_points: &[Pt3],
    image_width: u32,
    image_height: u32,
) -> Result<Option<PatternDetection>> {
    let mut pixels = Vec::with_capacity(world_points.len());
    for p in world_points {
        match camera.project_point(p) {
            Some(uv) if in_frame(&uv, image_width, image_height) => pixels.push(uv),
            _ => return Ok(None),
        }
    }
    let coverage = bounding_box_coverage(&pixels, image_width, image_height);
    let confidences = vec![1.0; pixels.len()];
    Ok(Some(PatternDetection::new(pixels, confidences, coverage)?))
}

fn in_frame(uv: &Pt2, width: u32, height: u32) -> bool {
    uv.x >= 0.0 && uv.y >= 0.0 && uv.x < width as Real && uv.y < height as Real
}

/// Project an electrode position into every camera that sees it.
pub fn project_electrode(
    cameras: &[CameraModel],
    position_mm: &Pt3,
    image_width: u32,
    image_height: u32,
    timestamp_us: TimestampUs,
) -> Vec<ElectrodeObservation> {
    cameras
        .iter()
        .filter_map(|camera| {
            let uv = camera.project_point(position_mm)?;
            in_frame(&uv, image_width, image_height).then_some(ElectrodeObservation {
                camera: camera.id,
                pixel: uv,
                confidence: 1.0,
                timestamp_us,
            })
        })
        .collect()
}

/// Draw one standard-normal sample via the Box-Muller transform.
pub fn standard_normal<R: Rng>(rng: &mut R) -> f64 {
    let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.random();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

/// Perturb every detection point in the view with Gaussian pixel noise.
pub fn add_detection_noise<R: Rng>(view: &mut CalibrationView, sigma_px: f64, rng: &mut R) {
    for detection in view.detections.iter_mut().flatten() {
        for p in &mut detection.points {
            p.x += sigma_px * standard_normal(rng);
            p.y += sigma_px * standard_normal(rng);
        }
    }
}

/// Project several placements, requiring every view to be usable.
pub fn project_pattern_views(
    cameras: &[CameraModel],
    pattern: &PatternSpec,
    placements: &[Iso3],
    image_width: u32,
    image_height: u32,
    frame_period_us: TimestampUs,
) -> Result<Vec<CalibrationView>> {
    if placements.is_empty() {
        bail!("no pattern placements supplied");
    }
    placements
        .iter()
        .enumerate()
        .map(|(i, placement)| {
            project_pattern_view(
                cameras,
                pattern,
                placement,
                image_width,
                image_height,
                i as TimestampUs * frame_period_us,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn ring_cameras_look_at_origin() {
        let cams = ring_cameras(5, 300.0, 35.0, default_intrinsics(1920, 1080));
        assert_eq!(cams.len(), 5);
        for cam in &cams {
            assert!((cam.center().coords.norm() - 300.0).abs() < 1e-9);
            let uv = cam.project_point(&Pt3::origin()).unwrap();
            assert!((uv.x - 960.0).abs() < 1e-6);
            assert!((uv.y - 540.0).abs() < 1e-6);
        }
    }

    #[test]
    fn projected_views_cover_all_cameras() {
        let cams = ring_cameras(5, 300.0, 35.0, default_intrinsics(1920, 1080));
        let pattern = PatternSpec::default();
        let placements = pattern_placements(8, 0.1, 0.08, 5.0);
        let views =
            project_pattern_views(&cams, &pattern, &placements, 1920, 1080, 100_000).unwrap();
        assert_eq!(views.len(), 8);
        for view in &views {
            assert!(view.cameras_detected() >= 2);
        }
    }

    #[test]
    fn noise_perturbs_points() {
        let cams = ring_cameras(3, 300.0, 35.0, default_intrinsics(1920, 1080));
        let pattern = PatternSpec::default();
        let mut view = project_pattern_view(
            &cams,
            &pattern,
            &pattern_placements(1, 0.1, 0.0, 0.0)[0],
            1920,
            1080,
            0,
        )
        .unwrap();
        let clean = view.clone();

        let mut rng = StdRng::seed_from_u64(7);
        add_detection_noise(&mut view, 0.5, &mut rng);

        let before = clean.detections[0].as_ref().unwrap();
        let after = view.detections[0].as_ref().unwrap();
        let moved = before
            .points
            .iter()
            .zip(&after.points)
            .any(|(a, b)| (a - b).norm() > 1e-6);
        assert!(moved);
    }

    #[test]
    fn standard_normal_has_unit_spread() {
        let mut rng = StdRng::seed_from_u64(42);
        let n = 20_000;
        let samples: Vec<f64> = (0..n).map(|_| standard_normal(&mut rng)).collect();
        let mean = samples.iter().sum::<f64>() / n as f64;
        let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.05);
        assert!((var - 1.0).abs() < 0.05);
    }
}

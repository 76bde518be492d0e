use std::fmt::Write as _;
use std::{fs, path::Path};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::{rngs::StdRng, SeedableRng};

use optival::core::{synthetic, CalibrationResult, CaptureSession, RigConfig};
use optival::optim::CancelToken;
use optival::pipeline::{evaluate, load_result, run_calibration, save_result};

/// Command line driver for the optical validation rig.
#[derive(Debug, Parser)]
#[command(author, version, about = "Optical electrode validation rig pipeline")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Calibrate the rig from a captured session and report quality.
    Calibrate(CalibrateArgs),
    /// Calibrate a synthetic rig end to end and print the quality summary.
    Demo(DemoArgs),
    /// Print a summary of a saved calibration result.
    Show(ShowArgs),
}

#[derive(Debug, clap::Args)]
struct CalibrateArgs {
    /// Path to a JSON capture session.
    #[arg(long)]
    session: String,

    /// Optional path to a JSON rig configuration. Defaults are used if omitted.
    #[arg(long)]
    config: Option<String>,

    /// Also write the evaluated result to this path.
    #[arg(long)]
    output: Option<String>,
}

#[derive(Debug, clap::Args)]
struct DemoArgs {
    /// Number of pattern placements to simulate.
    #[arg(long, default_value_t = 8)]
    views: usize,

    /// Gaussian detection noise, pixels.
    #[arg(long, default_value_t = 0.3)]
    noise_px: f64,

    /// Seed for the noise generator.
    #[arg(long, default_value_t = 7)]
    seed: u64,

    /// Write the evaluated result to this path.
    #[arg(long)]
    output: Option<String>,
}

#[derive(Debug, clap::Args)]
struct ShowArgs {
    /// Path to a JSON calibration result.
    result: String,
}

fn load_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    Ok(value)
}

fn load_config(path: Option<&str>) -> Result<RigConfig> {
    let config = match path {
        Some(p) => load_json_file::<RigConfig>(Path::new(p))?,
        None => RigConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

/// Run the full calibrate-and-evaluate chain on an already captured session.
fn calibrate_session(config: RigConfig, session: CaptureSession) -> Result<CalibrationResult> {
    let cancel = CancelToken::new();
    let calibration = run_calibration(config.clone(), session.clone(), &cancel)?;
    let result = evaluate(&config, &session, &calibration);
    for failure in &result.failures {
        log::warn!("quality threshold failed: {failure}");
    }
    Ok(result)
}

fn calibrate_from_files(
    session_path: &str,
    config_path: Option<&str>,
    output: Option<&str>,
) -> Result<String> {
    let config = load_config(config_path)?;
    let session: CaptureSession = load_json_file(Path::new(session_path))?;

    let result = calibrate_session(config, session)?;
    if let Some(path) = output {
        save_result(Path::new(path), &result)?;
    }
    Ok(serde_json::to_string_pretty(&result)?)
}

fn run_demo(args: &DemoArgs) -> Result<String> {
    let config = RigConfig::default();
    let cameras = synthetic::ring_cameras(
        config.camera_count,
        config.working_distance_mm,
        35.0,
        synthetic::default_intrinsics(config.image_width, config.image_height),
    );
    let placements = synthetic::pattern_placements(args.views, 0.1, 0.08, 5.0);
    let mut views = synthetic::project_pattern_views(
        &cameras,
        &config.pattern,
        &placements,
        config.image_width,
        config.image_height,
        100_000,
    )?;
    if args.noise_px > 0.0 {
        let mut rng = StdRng::seed_from_u64(args.seed);
        for view in &mut views {
            synthetic::add_detection_noise(view, args.noise_px, &mut rng);
        }
    }
    let session = CaptureSession::new(config.pattern.clone(), config.camera_count, views)?;

    let result = calibrate_session(config, session)?;
    if let Some(path) = &args.output {
        save_result(Path::new(path), &result)?;
    }
    Ok(format_result_summary(&result))
}

fn show_result_file(path: &str) -> Result<String> {
    let result = load_result(Path::new(path))?;
    Ok(format_result_summary(&result))
}

fn format_result_summary(result: &CalibrationResult) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "calibration result (schema {}, created {} unix)",
        result.version, result.created_unix
    );
    let _ = writeln!(
        out,
        "global RMS: {:.3} px / {:.4} mm",
        result.global_rms_px, result.global_rms_mm
    );
    for q in &result.per_camera {
        let _ = writeln!(
            out,
            "  {}: RMS {:.3} px / {:.4} mm, max {:.3} px, {} views",
            q.camera, q.rms_px, q.rms_mm, q.max_error_px, q.views_used
        );
    }
    for b in &result.baselines_mm {
        let _ = writeln!(out, "  baseline {} - {}: {:.2} mm", b.from, b.to, b.distance_mm);
    }
    let extent = result.coverage.volume_extent_mm;
    let _ = writeln!(
        out,
        "coverage: {:.0} x {:.0} x {:.0} mm, orientation spread {:.1} deg, {} points",
        extent[0], extent[1], extent[2], result.coverage.orientation_spread_deg,
        result.coverage.total_points
    );
    if result.valid {
        let _ = writeln!(out, "quality: PASS");
    } else {
        let _ = writeln!(out, "quality: FAIL");
        for failure in &result.failures {
            let _ = writeln!(out, "  {failure}");
        }
    }
    out
}

fn main() {
    env_logger::init();
    if let Err(err) = try_main() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let args = Args::parse();
    let text = match &args.command {
        Command::Calibrate(a) => {
            calibrate_from_files(&a.session, a.config.as_deref(), a.output.as_deref())?
        }
        Command::Demo(a) => run_demo(a)?,
        Command::Show(a) => show_result_file(&a.result)?,
    };
    println!("{text}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::NamedTempFile;

    fn write_json<T: serde::Serialize>(value: &T, path: &Path) {
        serde_json::to_writer_pretty(fs::File::create(path).unwrap(), value).unwrap();
    }

    fn synthetic_session() -> (RigConfig, CaptureSession) {
        let config = RigConfig::default();
        let cameras = synthetic::ring_cameras(
            config.camera_count,
            config.working_distance_mm,
            35.0,
            synthetic::default_intrinsics(config.image_width, config.image_height),
        );
        let placements = synthetic::pattern_placements(4, 0.1, 0.08, 5.0);
        let views = synthetic::project_pattern_views(
            &cameras,
            &config.pattern,
            &placements,
            config.image_width,
            config.image_height,
            100_000,
        )
        .expect("projection");
        let session = CaptureSession::new(config.pattern.clone(), config.camera_count, views)
            .expect("session");
        (config, session)
    }

    #[test]
    fn calibrate_helper_smoke_test() {
        let (config, session) = synthetic_session();
        let session_file = NamedTempFile::new().unwrap();
        let config_file = NamedTempFile::new().unwrap();
        let output_file = NamedTempFile::new().unwrap();

        write_json(&session, session_file.path());
        write_json(&config, config_file.path());

        let json = calibrate_from_files(
            session_file.path().to_str().unwrap(),
            Some(config_file.path().to_str().unwrap()),
            Some(output_file.path().to_str().unwrap()),
        )
        .expect("cli helper should succeed");

        let result: CalibrationResult = serde_json::from_str(&json).unwrap();
        assert!(
            result.valid,
            "noise-free calibration should pass: {:?}",
            result.failures
        );
        assert!(
            result.global_rms_mm < 1e-6,
            "global RMS too high: {}",
            result.global_rms_mm
        );

        let summary = show_result_file(output_file.path().to_str().unwrap())
            .expect("saved result should load");
        assert!(summary.contains("quality: PASS"), "summary:\n{summary}");
        assert!(summary.contains("cam0"), "summary:\n{summary}");
    }

    #[test]
    fn demo_produces_a_passing_summary() {
        let args = DemoArgs {
            views: 4,
            noise_px: 0.2,
            seed: 1,
            output: None,
        };
        let summary = run_demo(&args).expect("demo should succeed");
        assert!(summary.contains("quality: PASS"), "summary:\n{summary}");
        assert!(summary.contains("baseline cam0 - cam1"), "summary:\n{summary}");
    }
}

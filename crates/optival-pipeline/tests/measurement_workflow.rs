//! Operational scenarios around the calibration and measurement paths.
//!
//! These tests validate:
//! 1. A background calibration run driving the workflow to the active state
//! 2. Divergence aborting a run while the previous result stays in force
//! 3. Operator cancellation of a queued optimization
//! 4. Device faults pausing the workflow, and navigation dropouts pausing
//!    validation while measurements keep flowing
//! 5. Batch measurement throughput on a five-camera rig

use std::thread;
use std::time::{Duration, Instant};

use optival_core::math::Pt3;
use optival_core::synthetic::{
    default_intrinsics, pattern_placements, project_electrode, project_pattern_views, ring_cameras,
};
use optival_core::{CameraId, CameraModel, CaptureSession, RigConfig};
use optival_optim::{CancelToken, PointRefineOptions, SolveError};
use optival_pipeline::status::{DeviceError, DeviceStatusBoard};
use optival_pipeline::validate::AccuracyValidator;
use optival_pipeline::worker::spawn_task;
use optival_pipeline::{
    evaluate, measure_frame_set, measure_frame_sets, run_calibration, ActiveCalibration,
    CalibrateError, FrameSet, Workflow, WorkflowEvent, WorkflowState,
};

const WIDTH: u32 = 1920;
const HEIGHT: u32 = 1080;

fn rig_scene() -> (RigConfig, Vec<CameraModel>, CaptureSession) {
    let config = RigConfig::default();
    let cameras = ring_cameras(5, 300.0, 35.0, default_intrinsics(WIDTH, HEIGHT));
    let views = project_pattern_views(
        &cameras,
        &config.pattern,
        &pattern_placements(8, 0.1, 0.08, 5.0),
        WIDTH,
        HEIGHT,
        100_000,
    )
    .expect("synthetic projection");
    let session =
        CaptureSession::new(config.pattern.clone(), config.camera_count, views).expect("session");
    (config, cameras, session)
}

fn electrode_frame_set(
    cameras: &[CameraModel],
    truths: &[Pt3],
    timestamp_us: i64,
) -> FrameSet {
    let mut candidates: Vec<Vec<_>> = vec![Vec::new(); cameras.len()];
    for truth in truths {
        for obs in project_electrode(cameras, truth, WIDTH, HEIGHT, timestamp_us) {
            candidates[obs.camera.index()].push(obs);
        }
    }
    FrameSet {
        timestamp_us,
        candidates,
    }
}

#[test]
fn background_run_drives_the_workflow_to_active() {
    let (config, _, session) = rig_scene();
    let mut workflow = Workflow::new();

    workflow.apply(WorkflowEvent::BeginSession).unwrap();
    workflow.apply(WorkflowEvent::FinalizeSession).unwrap();
    assert_eq!(workflow.state(), WorkflowState::Calibrating);

    let run_config = config.clone();
    let run_session = session.clone();
    let handle =
        spawn_task(move |cancel| run_calibration(run_config, run_session, cancel));

    let calibration = handle
        .wait()
        .expect("worker must not panic")
        .expect("calibration converges");
    workflow.apply(WorkflowEvent::OptimizationFinished).unwrap();

    let result = evaluate(&config, &session, &calibration);
    assert!(result.valid, "{:?}", result.failures);

    let mut active = ActiveCalibration::default();
    active.adopt(result, false).unwrap();
    workflow.apply(WorkflowEvent::AdoptResult).unwrap();
    assert!(workflow.state().allows_measurement());
}

#[test]
fn divergent_run_leaves_previous_calibration_in_force() {
    let (config, _, session) = rig_scene();
    let cancel = CancelToken::new();

    let calibration = run_calibration(config.clone(), session.clone(), &cancel).unwrap();
    let first = evaluate(&config, &session, &calibration);
    let mut active = ActiveCalibration::default();
    active.adopt(first.clone(), false).unwrap();

    let mut workflow = Workflow::new();
    workflow.apply(WorkflowEvent::BeginSession).unwrap();
    workflow.apply(WorkflowEvent::FinalizeSession).unwrap();
    workflow.apply(WorkflowEvent::OptimizationFinished).unwrap();
    workflow.apply(WorkflowEvent::AdoptResult).unwrap();

    // Recalibrate with a wall-clock budget no optimization can meet.
    let mut starved = config.clone();
    starved.optim.timeout_s = Some(1e-9);
    workflow.apply(WorkflowEvent::BeginSession).unwrap();
    workflow.apply(WorkflowEvent::FinalizeSession).unwrap();

    let err = run_calibration(starved, session.clone(), &cancel)
        .expect_err("zero budget must diverge");
    assert!(
        matches!(
            err,
            CalibrateError::Optimization(SolveError::OptimizationDivergence { .. })
        ),
        "unexpected error: {err}"
    );

    workflow.apply(WorkflowEvent::OptimizationFailed).unwrap();
    assert_eq!(workflow.state(), WorkflowState::Capturing);

    // The failed run never reached adoption; the earlier result holds.
    let current = active.current().expect("previous result in force");
    assert_eq!(current.cameras, first.cameras);
    assert_eq!(current.created_unix, first.created_unix);
}

#[test]
fn cancelled_queued_run_reports_cancellation() {
    let (config, _, session) = rig_scene();

    // The worker idles briefly before starting, so the operator abort
    // below lands before the optimization begins.
    let handle = spawn_task(move |cancel| {
        thread::sleep(Duration::from_millis(50));
        run_calibration(config, session, cancel)
    });
    handle.cancel();

    match handle.wait().expect("worker must not panic") {
        Err(CalibrateError::Optimization(SolveError::Cancelled(_))) => {}
        other => panic!("expected a cancelled run, got {other:?}"),
    }
}

#[test]
fn device_faults_pause_the_workflow_until_reset() {
    let mut board = DeviceStatusBoard::new(5);
    let mut workflow = Workflow::new();
    workflow.apply(WorkflowEvent::BeginSession).unwrap();

    for c in 0..5 {
        board.mark_camera_frame(CameraId(c), 1_000_000);
    }
    board.mark_navigation_sample(1_000_000);
    assert!(board.check(1_200_000, 500.0).is_empty());

    // Camera 3 goes dark for two seconds.
    for c in [0, 1, 2, 4] {
        board.mark_camera_frame(CameraId(c), 3_000_000);
    }
    board.mark_navigation_sample(3_000_000);
    let faults = board.check(3_000_000, 500.0);
    assert_eq!(faults, vec![DeviceError::CameraDisconnection(CameraId(3))]);

    workflow.apply(WorkflowEvent::DeviceFault).unwrap();
    assert_eq!(workflow.state(), WorkflowState::Faulted);
    assert!(workflow.apply(WorkflowEvent::FinalizeSession).is_err());
    workflow.apply(WorkflowEvent::Reset).unwrap();
    assert_eq!(workflow.state(), WorkflowState::Idle);
}

#[test]
fn navigation_dropout_pauses_validation_not_measurement() {
    let (config, cameras, _) = rig_scene();
    let cancel = CancelToken::new();

    // The rig keeps measuring while the navigation device is silent.
    let truth = Pt3::new(15.0, 10.0, -5.0);
    let set = electrode_frame_set(&cameras, &[truth], 2_000_000);
    let measurements = measure_frame_set(
        &cameras,
        &set,
        &config.measure,
        &PointRefineOptions::default(),
        &cancel,
    )
    .expect("measurement continues without navigation");
    assert_eq!(measurements.len(), 1);

    // With no samples to compare against, the validator records the
    // gap instead of producing a comparison.
    let mut validator = AccuracyValidator::new(config.validate.clone(), 1.0);
    validator.check(&measurements[0], &[]);
    assert!(validator.records().is_empty());
    assert_eq!(validator.misalignments().len(), 1);

    let mut board = DeviceStatusBoard::new(cameras.len());
    for camera in &cameras {
        board.mark_camera_frame(camera.id, 2_000_000);
    }
    let faults = board.check(2_000_000, 500.0);
    assert_eq!(faults, vec![DeviceError::NavigationDisconnection]);
}

#[test]
fn measurement_path_sustains_batch_throughput() {
    let (config, cameras, _) = rig_scene();
    let cancel = CancelToken::new();

    let sets: Vec<FrameSet> = (0..50)
        .map(|i| {
            let z = -12.0 + i as f64 * 0.5;
            let truths = [Pt3::new(8.0, -6.0, z), Pt3::new(-10.0, 12.0, z)];
            electrode_frame_set(&cameras, &truths, i * 100_000)
        })
        .collect();

    let started = Instant::now();
    let batches = measure_frame_sets(
        &cameras,
        &sets,
        &config.measure,
        &PointRefineOptions::default(),
        &cancel,
    );
    let elapsed = started.elapsed();

    for batch in &batches {
        let measurements = batch.as_ref().expect("every set measures");
        assert_eq!(measurements.len(), 2);
    }
    println!("measured {} sets in {elapsed:?}", sets.len());
    // The measurement path has to sustain >= 10 observation sets per
    // second; 50 sets in 5 s is the floor with generous headroom.
    assert!(
        elapsed < Duration::from_secs(5),
        "batch of 50 sets took {elapsed:?}"
    );
}

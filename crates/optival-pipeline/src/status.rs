//! Device connectivity tracking.
//!
//! Cameras and the navigation device report liveness by timestamped
//! heartbeats (a frame, a sample). The board turns stale heartbeats
//! into typed faults. Fault handling is the caller's policy: a
//! navigation loss pauses validation while measurements continue, and
//! a camera loss degrades measurements to the remaining cameras as
//! long as two still see the catheter.

use log::{info, warn};
use thiserror::Error;

use optival_core::types::{timestamp_delta_ms, CameraId, TimestampUs};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("camera {0} is disconnected")]
    CameraDisconnection(CameraId),
    #[error("navigation device is disconnected")]
    NavigationDisconnection,
}

/// Liveness of one device.
#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    pub connected: bool,
    pub last_seen_us: Option<TimestampUs>,
}

impl DeviceState {
    fn mark(&mut self, timestamp_us: TimestampUs) {
        self.last_seen_us = Some(self.last_seen_us.map_or(timestamp_us, |t| t.max(timestamp_us)));
    }

    fn is_fresh(&self, now_us: TimestampUs, staleness_ms: f64) -> bool {
        self.last_seen_us
            .is_some_and(|t| timestamp_delta_ms(now_us, t) <= staleness_ms)
    }
}

/// Tracks which rig devices are alive. A device that has never
/// reported counts as disconnected.
#[derive(Debug)]
pub struct DeviceStatusBoard {
    cameras: Vec<DeviceState>,
    navigation: DeviceState,
}

impl DeviceStatusBoard {
    pub fn new(camera_count: usize) -> Self {
        Self {
            cameras: vec![DeviceState::default(); camera_count],
            navigation: DeviceState::default(),
        }
    }

    pub fn mark_camera_frame(&mut self, camera: CameraId, timestamp_us: TimestampUs) {
        if let Some(state) = self.cameras.get_mut(camera.index()) {
            state.mark(timestamp_us);
        } else {
            warn!("heartbeat from unknown {camera} ignored");
        }
    }

    pub fn mark_navigation_sample(&mut self, timestamp_us: TimestampUs) {
        self.navigation.mark(timestamp_us);
    }

    pub fn camera(&self, camera: CameraId) -> Option<&DeviceState> {
        self.cameras.get(camera.index())
    }

    pub fn navigation(&self) -> &DeviceState {
        &self.navigation
    }

    pub fn all_connected(&self) -> bool {
        self.navigation.connected && self.cameras.iter().all(|c| c.connected)
    }

    /// Refresh connectivity against `now_us` and return the current
    /// faults. Transitions are logged once per edge.
    pub fn check(&mut self, now_us: TimestampUs, staleness_ms: f64) -> Vec<DeviceError> {
        let mut faults = Vec::new();

        for (idx, state) in self.cameras.iter_mut().enumerate() {
            let camera = CameraId(idx as u32);
            let fresh = state.is_fresh(now_us, staleness_ms);
            match (state.connected, fresh) {
                (true, false) => warn!("{camera} went silent"),
                (false, true) => info!("{camera} is back online"),
                _ => {}
            }
            state.connected = fresh;
            if !fresh {
                faults.push(DeviceError::CameraDisconnection(camera));
            }
        }

        let fresh = self.navigation.is_fresh(now_us, staleness_ms);
        match (self.navigation.connected, fresh) {
            (true, false) => warn!("navigation device went silent"),
            (false, true) => info!("navigation device is back online"),
            _ => {}
        }
        self.navigation.connected = fresh;
        if !fresh {
            faults.push(DeviceError::NavigationDisconnection);
        }

        faults
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STALENESS_MS: f64 = 500.0;

    #[test]
    fn unseen_devices_start_disconnected() {
        let mut board = DeviceStatusBoard::new(2);
        let faults = board.check(1_000_000, STALENESS_MS);
        assert_eq!(
            faults,
            vec![
                DeviceError::CameraDisconnection(CameraId(0)),
                DeviceError::CameraDisconnection(CameraId(1)),
                DeviceError::NavigationDisconnection,
            ]
        );
        assert!(!board.all_connected());
    }

    #[test]
    fn fresh_heartbeats_clear_all_faults() {
        let mut board = DeviceStatusBoard::new(2);
        board.mark_camera_frame(CameraId(0), 1_000_000);
        board.mark_camera_frame(CameraId(1), 1_000_100);
        board.mark_navigation_sample(1_000_200);

        assert!(board.check(1_100_000, STALENESS_MS).is_empty());
        assert!(board.all_connected());
    }

    #[test]
    fn stale_camera_reports_disconnection() {
        let mut board = DeviceStatusBoard::new(3);
        for c in 0..3 {
            board.mark_camera_frame(CameraId(c), 1_000_000);
        }
        board.mark_navigation_sample(1_000_000);
        assert!(board.check(1_100_000, STALENESS_MS).is_empty());

        // Camera 1 stops reporting; the others keep going.
        board.mark_camera_frame(CameraId(0), 2_000_000);
        board.mark_camera_frame(CameraId(2), 2_000_000);
        board.mark_navigation_sample(2_000_000);
        let faults = board.check(2_000_000, STALENESS_MS);
        assert_eq!(faults, vec![DeviceError::CameraDisconnection(CameraId(1))]);
        assert!(!board.camera(CameraId(1)).unwrap().connected);
        assert!(board.camera(CameraId(0)).unwrap().connected);
    }

    #[test]
    fn reconnection_clears_the_fault() {
        let mut board = DeviceStatusBoard::new(1);
        board.mark_camera_frame(CameraId(0), 0);
        board.mark_navigation_sample(0);
        assert_eq!(
            board.check(10_000_000, STALENESS_MS),
            vec![
                DeviceError::CameraDisconnection(CameraId(0)),
                DeviceError::NavigationDisconnection,
            ]
        );

        board.mark_camera_frame(CameraId(0), 10_000_000);
        board.mark_navigation_sample(10_000_000);
        assert!(board.check(10_000_001, STALENESS_MS).is_empty());
    }

    #[test]
    fn out_of_order_heartbeats_never_rewind() {
        let mut board = DeviceStatusBoard::new(1);
        board.mark_camera_frame(CameraId(0), 5_000_000);
        board.mark_camera_frame(CameraId(0), 1_000_000);
        assert_eq!(
            board.camera(CameraId(0)).unwrap().last_seen_us,
            Some(5_000_000)
        );
    }
}

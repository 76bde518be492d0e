//! Concrete problems built on the shared solver core.

pub mod camera_refine;
pub mod point_refine;
pub mod rig_adjust;

//! `autoguide_core`: star detection, calibration and the guider/AO state
//! machines that drive closed-loop telescope autoguiding. No UI, no
//! device I/O beyond the `Camera`/`ScopeDriver`/`StepGuiderDriver`
//! traits an embedding application implements for its own hardware.

pub mod algorithm;
pub mod ao_coordinator;
pub mod calibration;
pub mod camera;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod frame;
pub mod geometry;
pub mod guider;
pub mod log_setup;
pub mod math;
pub mod mount;
pub mod quality;
pub mod stars;
pub mod transform;

//! Typed snapshots of the persisted configuration keys the engine reads.
//!
//! Persistence itself (the on-disk profile store) is out of scope; the
//! surrounding application is expected to load one of these structs from
//! its own config layer and hand it to the engine once per session (or
//! per frame, for the few knobs that can change live), the same way
//! `options/guiding.rs` in the teacher is a plain `serde`-backed struct
//! with a profile loader living elsewhere.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GuiderOptions {
    pub search_region_px: f64,
    pub min_hfd: f64,
    pub max_hfd: f64,
    pub mass_change_threshold_enabled: bool,
    pub mass_change_threshold: f64,
    pub tolerate_jumps_enabled: bool,
    pub tolerate_jumps_threshold: f64,
    pub multi_star_enabled: bool,
    pub max_stars: usize,
    pub saturation_level: u16,
    pub min_snr: f64,
    pub min_mass: f64,
}

impl Default for GuiderOptions {
    fn default() -> Self {
        Self {
            search_region_px: 15.0,
            min_hfd: 1.5,
            max_hfd: 24.0,
            mass_change_threshold_enabled: true,
            mass_change_threshold: 0.5,
            tolerate_jumps_enabled: true,
            tolerate_jumps_threshold: 4.0,
            multi_star_enabled: true,
            max_stars: 9,
            saturation_level: 64000,
            min_snr: 6.0,
            min_mass: 100.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub enum GuideAlgorithmKind {
    #[default]
    Hysteresis,
    Identity,
    LowPass,
    LowPass2,
    ResistSwitch,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GuideAlgorithmParams {
    pub kind: GuideAlgorithmKind,
    pub min_move: f64,
    pub aggressiveness: f64,
    pub fast_aggressiveness: f64,
    pub slow_aggressiveness: f64,
}

impl Default for GuideAlgorithmParams {
    fn default() -> Self {
        Self {
            kind: GuideAlgorithmKind::default(),
            min_move: 0.2,
            aggressiveness: 0.7,
            fast_aggressiveness: 0.7,
            slow_aggressiveness: 0.3,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct MountAlgorithmOptions {
    pub x_algorithm: GuideAlgorithmParams,
    pub y_algorithm: GuideAlgorithmParams,
    pub dec_compensation_enabled: bool,
}

impl Default for MountAlgorithmOptions {
    fn default() -> Self {
        Self {
            x_algorithm: GuideAlgorithmParams::default(),
            y_algorithm: GuideAlgorithmParams::default(),
            dec_compensation_enabled: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AoOptions {
    pub samples_to_average: usize,
    pub bump_percentage: u32,
    pub bump_max_steps_per_cycle: f64,
    pub calibration_steps_per_iteration: u32,
    pub bump_on_dither: bool,
}

impl Default for AoOptions {
    fn default() -> Self {
        Self {
            samples_to_average: 3,
            bump_percentage: 80,
            bump_max_steps_per_cycle: 5.0,
            calibration_steps_per_iteration: 4,
            bump_on_dither: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CalibrationDetailsOptions {
    pub focal_length: f64,
    pub image_scale: f64,
    pub orig_binning: u32,
}

impl Default for CalibrationDetailsOptions {
    fn default() -> Self {
        Self {
            focal_length: 750.0,
            image_scale: 1.0,
            orig_binning: 1,
        }
    }
}

/// Parameters driving `calibration::CalibrationStateMachine`, kept
/// distinct from `CalibrationDetailsOptions` (which only feeds the
/// reported pixel scale) since these govern the run itself.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CalibrationOptions {
    pub steps_per_iteration: u32,
    pub max_iterations: u32,
    pub min_displacement_px: f64,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        Self {
            steps_per_iteration: 50,
            max_iterations: 60,
            min_displacement_px: 25.0,
        }
    }
}

/// The engine-wide options snapshot, grouping the five per-profile
/// concerns spec.md §6 names: guider, mount/AO algorithms, AO,
/// calibration run parameters, and calibration diagnostics.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct EngineOptions {
    pub guider: GuiderOptions,
    pub mount_algorithms: MountAlgorithmOptions,
    pub ao: AoOptions,
    pub calibration: CalibrationOptions,
    pub calibration_details: CalibrationDetailsOptions,
}

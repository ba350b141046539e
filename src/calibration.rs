//! Calibration state machine: learns the mount's (or AO's) sensor-plane
//! response by stepping each axis and fitting the resulting star
//! positions, the way `MountCalibrMode`/`DitherCalibrState` step and fit
//! per-axis moves in the teacher, generalized from FWHM-image fitting to
//! a position/angle/rate fit.

use crate::geometry::{Calibration, GuideParity, Point, PierSide, DECLINATION_SAFETY_LIMIT};
use crate::math::linear_regression;

/// Minimum number of iterations before an axis's displacement is
/// trusted, even if it already cleared `min_displacement_px`.
const MIN_ITERATIONS: u32 = 3;
/// Fixed number of south-moving iterations used to clear Dec backlash
/// before the measured north-moving run begins, matching the
/// fixed-iteration-count approach of the PHD2 main tree (rather than the
/// adaptive `PolyStar_Guiding` branch's backlash estimate).
const BACKLASH_CLEARING_ITERATIONS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Primary,
    ClearingBacklash,
    Secondary,
}

/// Supplemental per-axis raw samples, kept alongside the fitted
/// `Calibration` for diagnostics (plotting the calibration run, judging
/// fit quality) the way a user inspecting a calibration session would
/// want to see.
#[derive(Debug, Clone, Default)]
pub struct CalibrationDetails {
    pub ra_steps: Vec<(f64, Point)>,
    pub dec_steps: Vec<(f64, Point)>,
}

/// Directive returned to the caller after each measurement: which axis
/// to move next (and by how many step-units), or that calibration has
/// finished (successfully or not).
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationAction {
    MovePrimary { steps: u32 },
    MoveSecondaryBacklashClear { steps: u32 },
    MoveSecondary { steps: u32 },
    Done(Box<(Calibration, CalibrationDetails)>),
    Failed(String),
}

pub struct CalibrationStateMachine {
    phase: Phase,
    steps_per_iteration: u32,
    max_iterations: u32,
    min_displacement_px: f64,
    iterations_done: u32,
    phase_start_pos: Point,
    declination: Option<f64>,
    pier_side: PierSide,
    skip_secondary: bool,
    ra_steps: Vec<(f64, Point)>,
    dec_steps: Vec<(f64, Point)>,
}

impl CalibrationStateMachine {
    pub fn new(
        steps_per_iteration: u32,
        max_iterations: u32,
        min_displacement_px: f64,
        declination: Option<f64>,
        pier_side: PierSide,
    ) -> Self {
        Self {
            phase: Phase::Primary,
            steps_per_iteration,
            max_iterations,
            min_displacement_px,
            iterations_done: 0,
            phase_start_pos: Point::invalid(),
            declination,
            pier_side,
            skip_secondary: declination.map_or(false, |d| d.abs() >= DECLINATION_SAFETY_LIMIT),
            ra_steps: Vec::new(),
            dec_steps: Vec::new(),
        }
    }

    /// Begin calibration at the star's current position.
    pub fn start(&mut self, start_pos: Point) -> CalibrationAction {
        self.phase_start_pos = start_pos;
        self.ra_steps.push((0.0, start_pos));
        CalibrationAction::MovePrimary { steps: self.steps_per_iteration }
    }

    /// Feed the star's measured position after the most recently
    /// commanded move has completed.
    pub fn on_measurement(&mut self, pos: Point) -> CalibrationAction {
        match self.phase {
            Phase::Primary => self.on_primary_measured(pos),
            Phase::ClearingBacklash => self.on_backlash_measured(pos),
            Phase::Secondary => self.on_secondary_measured(pos),
        }
    }

    fn on_primary_measured(&mut self, pos: Point) -> CalibrationAction {
        self.iterations_done += 1;
        let step_number = self.iterations_done as f64 * self.steps_per_iteration as f64;
        self.ra_steps.push((step_number, pos));

        let displacement = self.phase_start_pos.distance(&pos);
        let enough = displacement >= self.min_displacement_px && self.iterations_done >= MIN_ITERATIONS;

        if enough {
            self.phase = Phase::ClearingBacklash;
            self.phase_start_pos = pos;
            self.iterations_done = 0;
            if self.skip_secondary {
                return self.finish();
            }
            return CalibrationAction::MoveSecondaryBacklashClear { steps: self.steps_per_iteration };
        }

        if self.iterations_done >= self.max_iterations {
            return CalibrationAction::Failed(
                "primary axis calibration failed: insufficient displacement".to_string(),
            );
        }

        CalibrationAction::MovePrimary { steps: self.steps_per_iteration }
    }

    fn on_backlash_measured(&mut self, _pos: Point) -> CalibrationAction {
        self.iterations_done += 1;
        if self.iterations_done >= BACKLASH_CLEARING_ITERATIONS {
            self.phase = Phase::Secondary;
            self.iterations_done = 0;
            self.phase_start_pos = _pos;
            self.dec_steps.push((0.0, _pos));
            return CalibrationAction::MoveSecondary { steps: self.steps_per_iteration };
        }
        CalibrationAction::MoveSecondaryBacklashClear { steps: self.steps_per_iteration }
    }

    fn on_secondary_measured(&mut self, pos: Point) -> CalibrationAction {
        self.iterations_done += 1;
        let step_number = self.iterations_done as f64 * self.steps_per_iteration as f64;
        self.dec_steps.push((step_number, pos));

        let displacement = self.phase_start_pos.distance(&pos);
        let enough = displacement >= self.min_displacement_px && self.iterations_done >= MIN_ITERATIONS;

        if enough {
            return self.finish();
        }

        if self.iterations_done >= self.max_iterations {
            return CalibrationAction::Failed(
                "secondary axis calibration failed: insufficient displacement".to_string(),
            );
        }

        CalibrationAction::MoveSecondary { steps: self.steps_per_iteration }
    }

    fn finish(&mut self) -> CalibrationAction {
        let Some((x_angle, x_rate)) = fit_axis(&self.ra_steps) else {
            return CalibrationAction::Failed("primary axis fit failed".to_string());
        };

        let (y_angle, y_rate, dec_parity) = if self.skip_secondary {
            // Too close to the pole to safely measure Dec: assume
            // orthogonality and reuse the primary axis rate.
            (
                crate::math::normalize_angle(x_angle + std::f64::consts::FRAC_PI_2),
                x_rate,
                GuideParity::Unknown,
            )
        } else {
            let Some((angle, rate)) = fit_axis(&self.dec_steps) else {
                return CalibrationAction::Failed("secondary axis fit failed".to_string());
            };
            let parity = if rate >= 0.0 { GuideParity::Even } else { GuideParity::Odd };
            (angle, rate.abs(), parity)
        };

        let calibration = Calibration {
            x_angle,
            y_angle,
            x_rate,
            y_rate,
            declination: self.declination,
            pier_side: self.pier_side,
            ra_parity: GuideParity::Even,
            dec_parity,
            rotator_angle: None,
            binning: 1,
            is_valid: true,
        };
        let details = CalibrationDetails {
            ra_steps: self.ra_steps.clone(),
            dec_steps: self.dec_steps.clone(),
        };
        CalibrationAction::Done(Box::new((calibration, details)))
    }
}

/// Fits an axis's step sequence to a bearing (angle of net travel) and a
/// rate (pixels per step), using a linear regression of each coordinate
/// against the step count to reduce single-sample noise.
fn fit_axis(steps: &[(f64, Point)]) -> Option<(f64, f64)> {
    if steps.len() < 2 {
        return None;
    }
    let xs: Vec<f64> = steps.iter().map(|&(s, _)| s).collect();
    let ys_x: Vec<f64> = steps.iter().map(|&(_, p)| p.x).collect();
    let ys_y: Vec<f64> = steps.iter().map(|&(_, p)| p.y).collect();

    let (slope_x, _) = linear_regression(&xs, &ys_x)?;
    let (slope_y, _) = linear_regression(&xs, &ys_y)?;

    let rate = (slope_x * slope_x + slope_y * slope_y).sqrt();
    if rate < 1e-9 {
        return None;
    }
    let angle = f64::atan2(slope_y, slope_x);
    Some((angle, rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calibration_runs_to_completion() {
        let mut machine = CalibrationStateMachine::new(50, 10, 15.0, Some(0.0), PierSide::East);
        let mut action = machine.start(Point::new(100.0, 100.0));

        // Primary axis: move east along +x at a fixed rate per step.
        let mut pos = Point::new(100.0, 100.0);
        loop {
            match action {
                CalibrationAction::MovePrimary { steps } => {
                    pos = Point::new(pos.x + steps as f64 * 0.1, pos.y);
                    action = machine.on_measurement(pos);
                }
                CalibrationAction::MoveSecondaryBacklashClear { .. } => {
                    action = machine.on_measurement(pos);
                }
                CalibrationAction::MoveSecondary { steps } => {
                    pos = Point::new(pos.x, pos.y + steps as f64 * 0.1);
                    action = machine.on_measurement(pos);
                }
                CalibrationAction::Done(ref result) => {
                    let (calib, details) = result.as_ref();
                    assert!(calib.is_valid);
                    assert!(calib.x_rate > 0.0);
                    assert!(calib.y_rate > 0.0);
                    assert!(!details.ra_steps.is_empty());
                    assert!(!details.dec_steps.is_empty());
                    break;
                }
                CalibrationAction::Failed(msg) => panic!("calibration failed: {msg}"),
            }
        }
    }

    #[test]
    fn test_high_declination_skips_secondary_axis() {
        let mut machine = CalibrationStateMachine::new(
            50,
            10,
            15.0,
            Some(80.0_f64.to_radians()),
            PierSide::East,
        );
        let mut action = machine.start(Point::new(100.0, 100.0));
        let mut pos = Point::new(100.0, 100.0);
        loop {
            match action {
                CalibrationAction::MovePrimary { steps } => {
                    pos = Point::new(pos.x + steps as f64 * 0.1, pos.y);
                    action = machine.on_measurement(pos);
                }
                CalibrationAction::Done(ref result) => {
                    let (calib, details) = result.as_ref();
                    assert_eq!(calib.dec_parity, GuideParity::Unknown);
                    assert!(details.dec_steps.is_empty());
                    break;
                }
                CalibrationAction::Failed(msg) => panic!("calibration failed: {msg}"),
                other => panic!("unexpected action at high declination: {other:?}"),
            }
        }
    }

    #[test]
    fn test_insufficient_displacement_fails() {
        let mut machine = CalibrationStateMachine::new(50, 3, 1000.0, Some(0.0), PierSide::East);
        let mut action = machine.start(Point::new(100.0, 100.0));
        let pos = Point::new(100.1, 100.0);
        loop {
            match action {
                CalibrationAction::MovePrimary { .. } => {
                    action = machine.on_measurement(pos);
                }
                CalibrationAction::Failed(_) => break,
                other => panic!("expected failure, got {other:?}"),
            }
        }
    }
}

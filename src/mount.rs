//! Mount abstraction: owns calibration, the coordinate transform built
//! from it, per-axis guide algorithm instances, a Dec backlash
//! compensator, and the guiding-enable flag. Two concrete variants
//! dispatch through one enum per the "deep class hierarchy -> tagged
//! variants" redesign flag: `Scope` (slow, analog pulse-guide rate) and
//! `StepGuider` (fast, step-quantized, travel-limited).
//!
//! Hardware I/O itself is out of scope (spec.md §1); `ScopeDriver` and
//! `StepGuiderDriver` are the contracts a camera/mount adapter
//! implements, grounded on `guiding/external_guider.rs::ExternalGuider`
//! (a small trait of imperative methods, no UI callbacks inside it).

use crate::algorithm::GuideAlgorithm;
use crate::calibration::{CalibrationAction, CalibrationStateMachine};
use crate::config::MountAlgorithmOptions;
use crate::error::{GuideError, GuideResult};
use crate::geometry::{Calibration, PierSide, Point};
use crate::transform::{self, Transform};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    North,
    South,
    East,
    West,
}

impl Direction {
    fn is_primary_positive(self) -> bool {
        matches!(self, Direction::East)
    }

    fn is_secondary_positive(self) -> bool {
        matches!(self, Direction::North)
    }

    fn primary(positive: bool) -> Direction {
        if positive { Direction::East } else { Direction::West }
    }

    fn secondary(positive: bool) -> Direction {
        if positive { Direction::North } else { Direction::South }
    }
}

/// Outcome of a single-axis step/pulse command, mirroring the
/// `{ok, limit_reached, error}` contract spec.md §6 gives `StepGuider::step`.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Ok,
    LimitReached,
    Error(String),
}

/// Driver contract for a slow, analog-rate mount (spec.md §6 `Mount`
/// interface, the pulse-guide half). Blocking for the pulse duration
/// happens inside the driver implementation, per the concurrency model
/// of spec.md §5 — the core only calls this and reads the result.
pub trait ScopeDriver: Send {
    fn is_connected(&self) -> bool;
    fn is_busy(&self) -> bool;
    fn pulse_guide(&mut self, direction: Direction, duration_ms: f64) -> Result<(), String>;
}

/// Driver contract for a fast, travel-limited step guider (spec.md §6
/// `StepGuider` additions).
pub trait StepGuiderDriver: Send {
    fn is_connected(&self) -> bool;
    fn is_busy(&self) -> bool;
    fn step(&mut self, direction: Direction, n: u32) -> StepOutcome;
    fn max_position(&self, direction: Direction) -> u32;
    fn current_position(&self, direction: Direction) -> i32;
    fn center(&mut self) -> Result<(), String>;
}

/// Which kind of move is being requested, mirroring `mount.cpp`'s
/// `MountMoveType`: a fresh measurement run through the algorithms
/// (`Algo`), a dead-reckoned move with no new measurement
/// (`Deduced`, algorithm's `deduce_result`), or a manual/calibration
/// move that bypasses both the algorithms and the backlash compensator
/// (`Direct`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveType {
    Algo,
    Deduced,
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveOptions {
    pub move_type: MoveType,
}

impl MoveOptions {
    pub fn algo() -> Self {
        Self { move_type: MoveType::Algo }
    }
    pub fn deduced() -> Self {
        Self { move_type: MoveType::Deduced }
    }
    pub fn direct() -> Self {
        Self { move_type: MoveType::Direct }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisMoveResult {
    pub amount_moved: f64,
    pub direction_positive: bool,
    pub limited: bool,
}

impl AxisMoveResult {
    fn none() -> Self {
        Self { amount_moved: 0.0, direction_positive: true, limited: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Ok,
    AoLimitReached,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MoveReport {
    pub outcome: MoveOutcome,
    pub camera_offset: Point,
    pub mount_offset: Point,
    pub x: AxisMoveResult,
    pub y: AxisMoveResult,
}

/// Grounded on `mount.cpp`'s `BacklashComp`: a mechanical reversal on
/// the Dec axis loses the first `pulse_ms` of travel to gear backlash,
/// so the compensator adds one fixed extra pulse the first time the
/// commanded direction flips.
#[derive(Debug, Clone)]
struct BacklashCompensator {
    enabled: bool,
    pulse_ms: f64,
    last_direction_positive: Option<bool>,
}

impl BacklashCompensator {
    fn new(pulse_ms: f64) -> Self {
        Self { enabled: pulse_ms > 0.0, pulse_ms, last_direction_positive: None }
    }

    fn apply(&mut self, direction_positive: bool, requested_ms: &mut f64) {
        if self.enabled {
            if let Some(last) = self.last_direction_positive {
                if last != direction_positive {
                    *requested_ms += self.pulse_ms;
                }
            }
        }
        self.last_direction_positive = Some(direction_positive);
    }

    fn reset_baseline(&mut self) {
        self.last_direction_positive = None;
    }
}

/// State shared by both mount variants: calibration, the derived
/// transform, the per-axis algorithms, and an optional in-progress
/// calibration run.
struct MountCore {
    calibration: Calibration,
    transform: Transform,
    x_algorithm: GuideAlgorithm,
    y_algorithm: GuideAlgorithm,
    guiding_enabled: bool,
    dec_compensation_enabled: bool,
    calibration_run: Option<CalibrationStateMachine>,
}

impl MountCore {
    fn new(algo_options: &MountAlgorithmOptions) -> Self {
        let calibration = Calibration::default();
        Self {
            transform: Transform::from_calibration(&calibration),
            calibration,
            x_algorithm: GuideAlgorithm::new(&algo_options.x_algorithm),
            y_algorithm: GuideAlgorithm::new(&algo_options.y_algorithm),
            guiding_enabled: true,
            dec_compensation_enabled: algo_options.dec_compensation_enabled,
            calibration_run: None,
        }
    }

    fn set_calibration(&mut self, calibration: Calibration) {
        self.transform = Transform::from_calibration(&calibration);
        self.calibration = calibration;
    }

    fn clear_calibration(&mut self) {
        self.set_calibration(Calibration::default());
    }
}

/// Progress report from driving the calibration state machine one
/// measurement forward.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationProgress {
    InProgress { iter: u32, dx: f64, dy: f64, dist: f64, msg: String },
    Done,
    Failed(String),
}

pub struct ScopeMount {
    driver: Box<dyn ScopeDriver>,
    core: MountCore,
    backlash: BacklashCompensator,
}

pub struct StepGuiderMount {
    driver: Box<dyn StepGuiderDriver>,
    core: MountCore,
    samples_to_average: usize,
}

/// Tagged union over the two mount kinds (spec.md §9 redesign flag).
pub enum Mount {
    Scope(ScopeMount),
    StepGuider(StepGuiderMount),
}

impl ScopeMount {
    pub fn new(driver: Box<dyn ScopeDriver>, algo_options: &MountAlgorithmOptions, backlash_pulse_ms: f64) -> Self {
        Self { driver, core: MountCore::new(algo_options), backlash: BacklashCompensator::new(backlash_pulse_ms) }
    }
}

impl StepGuiderMount {
    pub fn new(driver: Box<dyn StepGuiderDriver>, algo_options: &MountAlgorithmOptions, samples_to_average: usize) -> Self {
        Self { driver, core: MountCore::new(algo_options), samples_to_average }
    }

    pub fn travel_limit(&self) -> u32 {
        self.driver.max_position(Direction::East).min(self.driver.max_position(Direction::North))
    }

    pub fn current_offset(&self) -> (i32, i32) {
        (self.driver.current_position(Direction::East), self.driver.current_position(Direction::North))
    }

    pub fn would_hit_limit(&self, direction: Direction, n: u32) -> bool {
        let cur = self.driver.current_position(direction).unsigned_abs();
        cur + n > self.driver.max_position(direction)
    }

    pub fn center(&mut self) -> GuideResult<()> {
        self.driver.center().map_err(GuideError::HardwareMove)
    }

    pub fn samples_to_average(&self) -> usize {
        self.samples_to_average
    }
}

impl Mount {
    pub fn is_connected(&self) -> bool {
        match self {
            Mount::Scope(m) => m.driver.is_connected(),
            Mount::StepGuider(m) => m.driver.is_connected(),
        }
    }

    pub fn is_busy(&self) -> bool {
        match self {
            Mount::Scope(m) => m.driver.is_busy(),
            Mount::StepGuider(m) => m.driver.is_busy(),
        }
    }

    pub fn is_calibrated(&self) -> bool {
        self.core().calibration.is_valid
    }

    fn core(&self) -> &MountCore {
        match self {
            Mount::Scope(m) => &m.core,
            Mount::StepGuider(m) => &m.core,
        }
    }

    fn core_mut(&mut self) -> &mut MountCore {
        match self {
            Mount::Scope(m) => &mut m.core,
            Mount::StepGuider(m) => &mut m.core,
        }
    }

    pub fn get_calibration(&self) -> &Calibration {
        &self.core().calibration
    }

    pub fn set_calibration(&mut self, calibration: Calibration) {
        self.core_mut().set_calibration(calibration);
    }

    pub fn clear_calibration(&mut self) {
        self.core_mut().clear_calibration();
    }

    pub fn guiding_enabled(&self) -> bool {
        self.core().guiding_enabled
    }

    pub fn set_guiding_enabled(&mut self, enabled: bool) {
        self.core_mut().guiding_enabled = enabled;
    }

    pub fn dec_compensation_enabled(&self) -> bool {
        self.core().dec_compensation_enabled
    }

    pub fn side_of_pier(&self) -> PierSide {
        self.core().calibration.pier_side
    }

    pub fn declination(&self) -> Option<f64> {
        self.core().calibration.declination
    }

    pub fn transform_camera_to_mount(&self, offset: Point) -> Point {
        let (x, y) = self.core().transform.camera_to_axis_pixels(offset);
        Point::new(x, y)
    }

    pub fn transform_mount_to_camera(&self, axis: Point) -> Point {
        self.core().transform.axis_pixels_to_camera(axis.x, axis.y)
    }

    /// Adjusts the stored calibration for a pier flip without
    /// recalibrating (spec.md §4.5). Applying this twice restores the
    /// original calibration (P2), since `transform::adjust_calibration`
    /// only rotates the parity-affected axis angle by pi when the pier
    /// side actually differs from the one passed in.
    pub fn flip_calibration(&mut self) {
        let core = self.core_mut();
        let new_side = core.calibration.pier_side.opposite();
        let declination = core.calibration.declination;
        let binning = core.calibration.binning;
        let rotator_angle = core.calibration.rotator_angle;
        let adjusted = transform::adjust_calibration(&core.calibration, new_side, declination, binning, rotator_angle);
        core.set_calibration(adjusted);
    }

    /// Re-derives the working calibration for the mount's current
    /// environment (pier side, declination, binning, rotator angle)
    /// without overwriting the stored one, per spec.md §4.5.
    pub fn adjusted_calibration(
        &self,
        current_pier_side: PierSide,
        current_declination: Option<f64>,
        current_binning: u32,
        current_rotator_angle: Option<f64>,
    ) -> Calibration {
        transform::adjust_calibration(
            &self.core().calibration,
            current_pier_side,
            current_declination,
            current_binning,
            current_rotator_angle,
        )
    }

    /// Applies `calibration` as the mount's working calibration (after
    /// adjustment) and rebuilds the transform from it, without touching
    /// the stored as-calibrated record.
    pub fn use_working_calibration(&mut self, calibration: Calibration) {
        self.core_mut().transform = Transform::from_calibration(&calibration);
    }

    pub fn reset_algorithms(&mut self) {
        let core = self.core_mut();
        core.x_algorithm.reset_params();
        core.y_algorithm.reset_params();
    }

    pub fn guiding_paused(&mut self) {
        let core = self.core_mut();
        core.x_algorithm.guiding_paused();
        core.y_algorithm.guiding_paused();
    }

    pub fn guiding_resumed(&mut self) {
        let core = self.core_mut();
        core.x_algorithm.guiding_resumed();
        core.y_algorithm.guiding_resumed();
    }

    pub fn guiding_dithered(&mut self, amount: f64) {
        let core = self.core_mut();
        core.x_algorithm.guiding_dithered(amount);
        core.y_algorithm.guiding_dithered(amount);
        if let Mount::Scope(m) = self {
            m.backlash.reset_baseline();
        }
    }

    pub fn guiding_dither_settle_done(&mut self) {
        let core = self.core_mut();
        core.x_algorithm.guiding_dither_settle_done();
        core.y_algorithm.guiding_dither_settle_done();
    }

    pub fn guiding_stopped(&mut self) {
        let core = self.core_mut();
        core.x_algorithm.guiding_stopped();
        core.y_algorithm.guiding_stopped();
    }

    // --- Calibration state machine plumbing -------------------------------

    pub fn begin_calibration(
        &mut self,
        start_pos: Point,
        steps_per_iteration: u32,
        max_iterations: u32,
        min_displacement_px: f64,
        declination: Option<f64>,
        pier_side: PierSide,
    ) -> GuideResult<()> {
        let mut machine = CalibrationStateMachine::new(
            steps_per_iteration,
            max_iterations,
            min_displacement_px,
            declination,
            pier_side,
        );
        let action = machine.start(start_pos);
        self.core_mut().calibration_run = Some(machine);
        self.execute_calibration_action(action, start_pos).map(|_| ())
    }

    pub fn update_calibration_state(&mut self, current_pos: Point) -> GuideResult<CalibrationProgress> {
        let Some(mut machine) = self.core_mut().calibration_run.take() else {
            return Err(GuideError::WrongState { expected: "calibrating", actual: "not calibrating".into() });
        };
        let action = machine.on_measurement(current_pos);
        self.core_mut().calibration_run = Some(machine);
        self.execute_calibration_action(action, current_pos)
    }

    fn execute_calibration_action(&mut self, action: CalibrationAction, from: Point) -> GuideResult<CalibrationProgress> {
        match action {
            CalibrationAction::MovePrimary { steps } => {
                self.move_axis_raw(Direction::primary(true), steps as f64)?;
                Ok(CalibrationProgress::InProgress {
                    iter: steps,
                    dx: 0.0,
                    dy: 0.0,
                    dist: 0.0,
                    msg: "moving primary axis".to_string(),
                })
            }
            CalibrationAction::MoveSecondaryBacklashClear { steps } => {
                self.move_axis_raw(Direction::secondary(false), steps as f64)?;
                Ok(CalibrationProgress::InProgress {
                    iter: steps,
                    dx: 0.0,
                    dy: 0.0,
                    dist: 0.0,
                    msg: "clearing declination backlash".to_string(),
                })
            }
            CalibrationAction::MoveSecondary { steps } => {
                self.move_axis_raw(Direction::secondary(true), steps as f64)?;
                Ok(CalibrationProgress::InProgress {
                    iter: steps,
                    dx: from.x,
                    dy: from.y,
                    dist: 0.0,
                    msg: "moving secondary axis".to_string(),
                })
            }
            CalibrationAction::Done(boxed) => {
                let (calibration, _details) = *boxed;
                self.core_mut().calibration_run = None;
                self.set_calibration(calibration);
                Ok(CalibrationProgress::Done)
            }
            CalibrationAction::Failed(reason) => {
                self.core_mut().calibration_run = None;
                Ok(CalibrationProgress::Failed(reason))
            }
        }
    }

    fn move_axis_raw(&mut self, direction: Direction, amount: f64) -> GuideResult<AxisMoveResult> {
        self.move_axis(direction, amount, MoveOptions::direct())
    }

    /// Issues a single-axis command, choosing pulse-guide or step
    /// semantics by mount variant (spec.md §6).
    pub fn move_axis(&mut self, direction: Direction, amount: f64, opts: MoveOptions) -> GuideResult<AxisMoveResult> {
        match self {
            Mount::Scope(m) => {
                let mut requested = amount;
                if opts.move_type != MoveType::Direct
                    && matches!(direction, Direction::North | Direction::South)
                    && m.core.dec_compensation_enabled
                {
                    m.backlash.apply(direction.is_secondary_positive(), &mut requested);
                }
                m.driver
                    .pulse_guide(direction, requested)
                    .map(|_| AxisMoveResult {
                        amount_moved: requested,
                        direction_positive: direction.is_primary_positive() || direction.is_secondary_positive(),
                        limited: false,
                    })
                    .map_err(GuideError::HardwareMove)
            }
            Mount::StepGuider(m) => {
                let n = amount.abs().round() as u32;
                match m.driver.step(direction, n) {
                    StepOutcome::Ok => Ok(AxisMoveResult {
                        amount_moved: n as f64,
                        direction_positive: direction.is_primary_positive() || direction.is_secondary_positive(),
                        limited: false,
                    }),
                    StepOutcome::LimitReached => Ok(AxisMoveResult {
                        amount_moved: n as f64,
                        direction_positive: direction.is_primary_positive() || direction.is_secondary_positive(),
                        limited: true,
                    }),
                    StepOutcome::Error(e) => Err(GuideError::HardwareMove(e)),
                }
            }
        }
    }

    /// `move_offset` contract of spec.md §4.5/§6: transforms a
    /// camera-plane vector onto the two mount axes, runs it through the
    /// per-axis algorithms (unless `Deduced`/`Direct`), and issues the
    /// resulting axis commands.
    pub fn move_offset(&mut self, camera_offset: Point, opts: MoveOptions) -> GuideResult<MoveReport> {
        if !self.guiding_enabled() && opts.move_type != MoveType::Direct {
            return Ok(MoveReport {
                outcome: MoveOutcome::Ok,
                camera_offset,
                mount_offset: Point::invalid(),
                x: AxisMoveResult::none(),
                y: AxisMoveResult::none(),
            });
        }

        let (mut x_px, mut y_px) = if opts.move_type == MoveType::Deduced {
            let core = self.core();
            (core.x_algorithm.deduce_result(), core.y_algorithm.deduce_result())
        } else {
            self.transform_camera_to_mount_px(camera_offset)
        };

        if opts.move_type == MoveType::Algo {
            let core = self.core_mut();
            x_px = core.x_algorithm.result(x_px);
            y_px = core.y_algorithm.result(y_px);
        } else if opts.move_type == MoveType::Direct {
            if let Mount::Scope(m) = self {
                m.backlash.reset_baseline();
            }
        }

        let (x_amount, y_amount) = self.core().transform.axis_pixels_to_pulse(x_px, y_px);

        let x_direction = Direction::primary(x_amount >= 0.0);
        let y_direction = Direction::secondary(y_amount >= 0.0);

        let x_result = self.move_axis(x_direction, x_amount.abs(), opts)?;
        let y_result = self.move_axis(y_direction, y_amount.abs(), opts)?;

        let outcome = if x_result.limited || y_result.limited {
            MoveOutcome::AoLimitReached
        } else {
            MoveOutcome::Ok
        };

        Ok(MoveReport {
            outcome,
            camera_offset,
            mount_offset: Point::new(x_px, y_px),
            x: x_result,
            y: y_result,
        })
    }

    fn transform_camera_to_mount_px(&self, offset: Point) -> (f64, f64) {
        self.core().transform.camera_to_axis_pixels(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountAlgorithmOptions;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeScopeState {
        pulses: Vec<(Direction, f64)>,
    }

    struct FakeScope {
        state: Arc<Mutex<FakeScopeState>>,
    }

    impl ScopeDriver for FakeScope {
        fn is_connected(&self) -> bool { true }
        fn is_busy(&self) -> bool { false }
        fn pulse_guide(&mut self, direction: Direction, duration_ms: f64) -> Result<(), String> {
            self.state.lock().unwrap().pulses.push((direction, duration_ms));
            Ok(())
        }
    }

    fn test_calibration() -> Calibration {
        Calibration {
            x_angle: 0.0,
            y_angle: std::f64::consts::FRAC_PI_2,
            x_rate: 1.0,
            y_rate: 1.0,
            declination: Some(0.0),
            pier_side: PierSide::East,
            ra_parity: crate::geometry::GuideParity::Even,
            dec_parity: crate::geometry::GuideParity::Even,
            rotator_angle: None,
            binning: 1,
            is_valid: true,
        }
    }

    #[test]
    fn test_move_offset_issues_pulses_on_both_axes() {
        let state = Arc::new(Mutex::new(FakeScopeState::default()));
        let mut mount = Mount::Scope(ScopeMount::new(
            Box::new(FakeScope { state: Arc::clone(&state) }),
            &MountAlgorithmOptions::default(),
            0.0,
        ));
        mount.set_calibration(test_calibration());

        let report = mount.move_offset(Point::new(10.0, 0.0), MoveOptions::direct()).unwrap();
        assert_eq!(report.outcome, MoveOutcome::Ok);
        assert_eq!(state.lock().unwrap().pulses.len(), 2);
    }

    #[test]
    fn test_disabled_guiding_enabled_flag_suppresses_moves() {
        let state = Arc::new(Mutex::new(FakeScopeState::default()));
        let mut mount = Mount::Scope(ScopeMount::new(
            Box::new(FakeScope { state: Arc::clone(&state) }),
            &MountAlgorithmOptions::default(),
            0.0,
        ));
        mount.set_calibration(test_calibration());
        mount.set_guiding_enabled(false);

        mount.move_offset(Point::new(10.0, 0.0), MoveOptions::algo()).unwrap();
        assert!(state.lock().unwrap().pulses.is_empty());
    }

    #[test]
    fn test_flip_calibration_twice_restores_original() {
        let state = Arc::new(Mutex::new(FakeScopeState::default()));
        let mut mount = Mount::Scope(ScopeMount::new(
            Box::new(FakeScope { state: Arc::clone(&state) }),
            &MountAlgorithmOptions::default(),
            0.0,
        ));
        let original = test_calibration();
        mount.set_calibration(original.clone());
        mount.flip_calibration();
        mount.flip_calibration();
        let restored = mount.get_calibration();
        assert!((restored.x_angle - original.x_angle).abs() < 1e-9 || (crate::math::normalize_angle(restored.x_angle - original.x_angle)).abs() < 1e-9);
        assert_eq!(restored.pier_side, original.pier_side);
    }

    struct FakeStepGuider {
        pos_x: i32,
        pos_y: i32,
        limit: u32,
    }

    impl StepGuiderDriver for FakeStepGuider {
        fn is_connected(&self) -> bool { true }
        fn is_busy(&self) -> bool { false }
        fn step(&mut self, direction: Direction, n: u32) -> StepOutcome {
            let delta = n as i32;
            match direction {
                Direction::East => self.pos_x += delta,
                Direction::West => self.pos_x -= delta,
                Direction::North => self.pos_y += delta,
                Direction::South => self.pos_y -= delta,
            }
            if self.pos_x.unsigned_abs() > self.limit || self.pos_y.unsigned_abs() > self.limit {
                StepOutcome::LimitReached
            } else {
                StepOutcome::Ok
            }
        }
        fn max_position(&self, _direction: Direction) -> u32 { self.limit }
        fn current_position(&self, direction: Direction) -> i32 {
            match direction {
                Direction::East | Direction::West => self.pos_x,
                Direction::North | Direction::South => self.pos_y,
            }
        }
        fn center(&mut self) -> Result<(), String> {
            self.pos_x = 0;
            self.pos_y = 0;
            Ok(())
        }
    }

    #[test]
    fn test_step_guider_reports_limited_when_travel_exceeded() {
        let mut mount = Mount::StepGuider(StepGuiderMount::new(
            Box::new(FakeStepGuider { pos_x: 0, pos_y: 0, limit: 5 }),
            &MountAlgorithmOptions::default(),
            3,
        ));
        mount.set_calibration(test_calibration());
        let report = mount.move_offset(Point::new(50.0, 0.0), MoveOptions::direct()).unwrap();
        assert_eq!(report.outcome, MoveOutcome::AoLimitReached);
    }
}

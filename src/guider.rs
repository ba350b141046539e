//! Guider state machine: owns star selection, the lock position, the
//! multi-star list, the quality gates, and the per-frame driver that
//! turns a frame into a mount correction (spec.md §4.7).
//!
//! Grounded on `examples/original_source/guider_multistar.cpp`'s
//! monolithic per-frame dispatch rather than the teacher's
//! `core/mode_*.rs` trait-object-per-phase pattern: one state enum,
//! matched in `Guider::process_frame`, since the state set here is
//! closed and small.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::prelude::*;

use crate::config::GuiderOptions;
use crate::error::{GuideError, GuideResult};
use crate::events::{AppState, EventBus, GuideEvent, GuideStepInfo, AxisStepInfo};
use crate::frame::Frame;
use crate::geometry::Point;
use crate::mount::{Mount, MoveOptions, MoveOutcome};
use crate::quality::{DistanceGate, MassChecker};
use crate::stars::{find_star, auto_find, FindStarParams, FindResult, Star};

/// How many consecutive failed detections the guider tolerates before
/// declaring the star lost.
const MAX_CONSECUTIVE_LOSSES: u32 = 5;
/// Fast-recenter target: the offset magnitude, on each axis, below which
/// the dither's post-move recentering considers itself done.
const FAST_RECENTER_TOLERANCE_PX: f64 = 0.5;
/// Largest single quantized step fast-recenter is allowed to issue per
/// frame, in mount-axis pixels.
const FAST_RECENTER_MAX_STEP_PX: f64 = 25.0;
/// Consecutive exactly-zero-motion reports before a secondary is dropped
/// as a hot pixel.
const SECONDARY_ZERO_LIMIT: u32 = 5;
/// Consecutive large-excursion reports before a secondary's reference is
/// reset to wherever it currently is.
const SECONDARY_MISS_LIMIT: u32 = 10;
/// A secondary move beyond this multiple of the primary's running sigma
/// counts as a miss.
const SECONDARY_MISS_SIGMA: f64 = 2.5;
/// A secondary stays marked "lost" (searched at a predicted offset
/// rather than its last position) until the primary's own displacement
/// settles back within this multiple of its running sigma.
const REACQUIRE_SIGMA: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuiderState {
    Unconfigured,
    Selecting,
    Selected,
    CalibratingPrimary,
    CalibratingSecondary,
    Calibrated,
    Guiding,
    Stop,
}

impl GuiderState {
    fn app_state(self) -> AppState {
        match self {
            GuiderState::Unconfigured => AppState::Unconfigured,
            GuiderState::Selecting => AppState::Selecting,
            GuiderState::Selected => AppState::Selected,
            GuiderState::CalibratingPrimary => AppState::CalibratingPrimary,
            GuiderState::CalibratingSecondary => AppState::CalibratingSecondary,
            GuiderState::Calibrated => AppState::Calibrated,
            GuiderState::Guiding => AppState::Guiding,
            GuiderState::Stop => AppState::Stop,
        }
    }
}

/// spec.md §3 `LockPosition`: the point the guider steers toward, with
/// optional slow drift for comet/asteroid tracking.
#[derive(Debug, Clone)]
pub struct LockPosition {
    pub target: Point,
    pub sticky: bool,
    pub shift_enabled: bool,
    /// Pixels per second on each axis.
    pub shift_rate: Point,
    pub shift_in_mount_coords: bool,
    shift_start: Option<Instant>,
}

impl LockPosition {
    pub fn new(target: Point) -> Self {
        Self {
            target,
            sticky: false,
            shift_enabled: false,
            shift_rate: Point::new(0.0, 0.0),
            shift_in_mount_coords: false,
            shift_start: None,
        }
    }

    pub fn enable_shift(&mut self, rate_px_per_s: Point, in_mount_coords: bool, now: Instant) {
        self.shift_enabled = true;
        self.shift_rate = rate_px_per_s;
        self.shift_in_mount_coords = in_mount_coords;
        self.shift_start = Some(now);
    }

    /// Advances the lock position by `rate * dt` since the last call.
    /// Returns the new target.
    fn advance(&mut self, now: Instant) -> Point {
        if !self.shift_enabled {
            return self.target;
        }
        let Some(since) = self.shift_start else {
            self.shift_start = Some(now);
            return self.target;
        };
        let dt = now.duration_since(since).as_secs_f64();
        self.target = self.target + self.shift_rate * dt;
        self.shift_start = Some(now);
        self.target
    }
}

/// One multi-star secondary: its last known (or predicted) position,
/// brightness relative to the primary, and the miss/zero-motion
/// counters that govern whether it stays in the list (spec.md §4.7
/// step 5).
#[derive(Debug, Clone)]
struct SecondaryStar {
    last_position: Point,
    /// Offset from the primary at the time this secondary was accepted;
    /// used to predict where to search while marked lost.
    offset_from_primary: Point,
    snr: f64,
    lost: bool,
    miss_count: u32,
    zero_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseLevel {
    None,
    GuidingOnly,
    Full,
}

#[derive(Debug, Clone, Copy)]
pub struct SettleParams {
    pub tolerance_px: f64,
    pub settle_time_s: f64,
    pub timeout_s: f64,
}

struct DitherRun {
    settle: SettleParams,
    started: Instant,
    good_since: Option<Instant>,
    fast_recenter_armed: bool,
}

/// What happened this frame, for the caller (controller) to act on.
#[derive(Debug, Clone)]
pub enum FrameOutcome {
    /// No frame, or guiding fully paused: nothing was processed.
    Skipped,
    Step(Box<GuideStepInfo>),
    StarLost { info: String },
    LockPositionLost,
}

/// Owns star selection, the lock position, the multi-star list, the
/// quality gates, and the guide-state machine itself.
pub struct Guider {
    state: GuiderState,
    options: GuiderOptions,
    events: Arc<EventBus>,

    lock_position: Option<LockPosition>,
    primary: Option<Star>,
    secondaries: Vec<SecondaryStar>,
    secondaries_reacquiring: bool,
    primary_mean: f64,
    primary_var: f64,

    find_params: FindStarParams,
    search_region_half: i32,

    mass_checker: MassChecker,
    distance_gate: DistanceGate,
    consecutive_losses: u32,

    pause: PauseLevel,
    dither: Option<DitherRun>,

    frame_number: u64,
    start_time: Option<Instant>,
    average_distance: f64,
}

impl Guider {
    pub fn new(options: GuiderOptions, events: Arc<EventBus>) -> Self {
        let find_params = FindStarParams {
            search_region_half: options.search_region_px as i32,
            min_hfd: options.min_hfd,
            max_hfd: options.max_hfd,
            saturation_level: options.saturation_level,
            min_snr: options.min_snr,
            min_mass: options.min_mass,
        };
        let search_region_half = find_params.search_region_half;
        let mass_checker = MassChecker::new(options.mass_change_threshold, options.mass_change_threshold_enabled);
        let distance_gate = DistanceGate::new(options.tolerate_jumps_threshold);
        Self {
            state: GuiderState::Unconfigured,
            options,
            events,
            lock_position: None,
            primary: None,
            secondaries: Vec::new(),
            secondaries_reacquiring: false,
            primary_mean: 0.0,
            primary_var: 0.0,
            find_params,
            search_region_half,
            mass_checker,
            distance_gate,
            consecutive_losses: 0,
            pause: PauseLevel::None,
            dither: None,
            frame_number: 0,
            start_time: None,
            average_distance: 0.0,
        }
    }

    pub fn state(&self) -> GuiderState {
        self.state
    }

    pub fn lock_position(&self) -> Option<Point> {
        self.lock_position.as_ref().map(|l| l.target)
    }

    fn set_state(&mut self, state: GuiderState) {
        self.state = state;
        self.events.publish(GuideEvent::AppState { state: state.app_state() });
    }

    // --- Selection ----------------------------------------------------

    pub fn start_selecting(&mut self) {
        self.set_state(GuiderState::Selecting);
    }

    /// Validates a manually-chosen seed position and, on success, sets
    /// it as both the primary star and the lock position.
    pub fn select_manual(&mut self, frame: &Frame, seed: Point) -> bool {
        let star = find_star(frame, seed.x, seed.y, &self.find_params);
        self.accept_selection(star)
    }

    /// Whole-frame automatic selection (spec.md §4.1 `auto_find`).
    pub fn select_auto(&mut self, frame: &Frame) -> bool {
        let Some(found) = auto_find(
            frame,
            self.search_region_half,
            self.search_region_half,
            self.options.max_stars,
            &self.find_params,
        ) else {
            return false;
        };
        let star = find_star(frame, found.seed.position.x, found.seed.position.y, &self.find_params);
        if !self.accept_selection(star) {
            return false;
        }
        if self.options.multi_star_enabled {
            self.adopt_secondaries(found.secondaries);
        }
        true
    }

    fn accept_selection(&mut self, star: Star) -> bool {
        if !star.result.is_ok() {
            return false;
        }
        let pos = star.position;
        self.lock_position = Some(LockPosition::new(pos));
        self.primary = Some(star);
        self.secondaries.clear();
        self.primary_mean = 0.0;
        self.primary_var = 0.0;
        self.consecutive_losses = 0;
        self.mass_checker.reset();
        self.distance_gate.reset();
        self.events.publish(GuideEvent::StarSelected { pos });
        self.events.publish(GuideEvent::LockPositionSet { pos });
        self.set_state(GuiderState::Selected);
        true
    }

    fn adopt_secondaries(&mut self, candidates: Vec<crate::stars::Candidate>) {
        let primary_pos = self.primary.as_ref().map(|s| s.position).unwrap_or(Point::invalid());
        self.secondaries = candidates
            .into_iter()
            .take(self.options.max_stars.saturating_sub(1))
            .map(|c| SecondaryStar {
                last_position: c.position,
                offset_from_primary: c.position - primary_pos,
                snr: c.snr,
                lost: false,
                miss_count: 0,
                zero_count: 0,
            })
            .collect();
    }

    // --- Calibration plumbing ------------------------------------------

    /// Begins calibration on `mount` from the current lock position.
    /// `mount_kind` names which mount is being calibrated (the scope, or
    /// the AO as the secondary stage): it decides which `GuiderState`
    /// this enters, rather than always assuming the primary stage, so
    /// the controller can call this a second time for the AO after the
    /// scope finishes.
    pub fn begin_calibration(
        &mut self,
        mount: &mut Mount,
        mount_kind: crate::events::MountKind,
        steps_per_iteration: u32,
        max_iterations: u32,
        min_displacement_px: f64,
    ) -> GuideResult<()> {
        let Some(lock) = self.lock_position.as_ref() else {
            return Err(GuideError::WrongState { expected: "selected", actual: "no lock position".into() });
        };
        mount.begin_calibration(
            lock.target,
            steps_per_iteration,
            max_iterations,
            min_displacement_px,
            mount.declination(),
            mount.side_of_pier(),
        )?;
        let state = match mount_kind {
            crate::events::MountKind::Scope => GuiderState::CalibratingPrimary,
            crate::events::MountKind::Ao => GuiderState::CalibratingSecondary,
        };
        self.set_state(state);
        self.events.publish(GuideEvent::StartCalibration { mount: mount_kind });
        Ok(())
    }

    /// Drives one calibration measurement: finds the star at its last
    /// known position and feeds it to `mount`'s calibration state
    /// machine, applying the resulting state transition. `has_ao` only
    /// matters while calibrating the scope: it decides whether `Done`
    /// hands off to an AO calibration stage or completes outright.
    pub fn drive_calibration(
        &mut self,
        mount: &mut Mount,
        mount_kind: crate::events::MountKind,
        frame: &Frame,
        has_ao: bool,
    ) -> GuideResult<crate::mount::CalibrationProgress> {
        let seed = self.primary.as_ref().map(|s| s.position).unwrap_or(Point::new(0.0, 0.0));
        let star = find_star(frame, seed.x, seed.y, &self.find_params);
        if star.result.is_ok() {
            self.primary = Some(star.clone());
        }
        let pos = if star.result.is_ok() { star.position } else { seed };
        let progress = mount.update_calibration_state(pos)?;

        match &progress {
            crate::mount::CalibrationProgress::InProgress { iter, dx, dy, dist, msg } => {
                self.events.publish(GuideEvent::CalibrationStep {
                    mount: mount_kind,
                    iter: *iter,
                    dx: *dx,
                    dy: *dy,
                    dist: *dist,
                    msg: msg.clone(),
                });
            }
            crate::mount::CalibrationProgress::Done => {
                self.events.publish(GuideEvent::CalibrationComplete { mount: mount_kind });
                let next = match mount_kind {
                    crate::events::MountKind::Scope if has_ao => GuiderState::CalibratingSecondary,
                    _ => GuiderState::Calibrated,
                };
                self.set_state(next);
            }
            crate::mount::CalibrationProgress::Failed(reason) => {
                self.events.publish(GuideEvent::CalibrationFailed { mount: mount_kind, reason: reason.clone() });
                self.set_state(GuiderState::Selected);
            }
        }
        Ok(progress)
    }

    /// Skips straight to `Calibrated` when the mount(s) already carry
    /// valid calibration and the caller does not want a fresh run,
    /// mirroring `guider.cpp`'s "if already calibrated, start guiding"
    /// shortcut.
    pub fn adopt_existing_calibration(&mut self) -> GuideResult<()> {
        if self.state != GuiderState::Selected {
            return Err(GuideError::WrongState { expected: "selected", actual: format!("{:?}", self.state) });
        }
        self.set_state(GuiderState::Calibrated);
        Ok(())
    }

    pub fn start_guiding(&mut self) -> GuideResult<()> {
        if self.state != GuiderState::Calibrated {
            return Err(GuideError::WrongState { expected: "calibrated", actual: format!("{:?}", self.state) });
        }
        self.frame_number = 0;
        self.start_time = Some(Instant::now());
        self.average_distance = 0.0;
        self.set_state(GuiderState::Guiding);
        self.events.publish(GuideEvent::StartGuiding);
        Ok(())
    }

    pub fn stop(&mut self, mount: &mut Mount) {
        mount.guiding_stopped();
        self.dither = None;
        self.pause = PauseLevel::None;
        let next = if self.lock_position.is_some() { GuiderState::Selected } else { GuiderState::Unconfigured };
        self.set_state(GuiderState::Stop);
        self.events.publish(GuideEvent::GuidingStopped);
        self.state = next;
    }

    // --- Pause ----------------------------------------------------------

    pub fn pause(&mut self, mount: &mut Mount, level: PauseLevel) {
        self.pause = level;
        mount.guiding_paused();
        self.events.publish(GuideEvent::Paused);
    }

    pub fn resume(&mut self, mount: &mut Mount) {
        let was_full = self.pause == PauseLevel::Full;
        self.pause = PauseLevel::None;
        mount.guiding_resumed();
        if was_full {
            mount.reset_algorithms();
            self.mass_checker.reset();
            self.distance_gate.reset();
        }
        self.events.publish(GuideEvent::Resumed);
    }

    /// Begins tracking settle toward the current lock position without
    /// moving it, for `guide(settle, ...)`'s initial wait (spec.md
    /// §4.8) rather than a user-requested dither: the same
    /// distance-from-lock/`SettleDone` machinery applies, but no
    /// `GuidingDithered` event is warranted since nothing moved.
    pub fn start_settle(&mut self, settle: SettleParams, now: Instant) -> GuideResult<()> {
        if self.lock_position.is_none() {
            return Err(GuideError::WrongState { expected: "selected", actual: "no lock position".into() });
        }
        self.dither = Some(DitherRun { settle, started: now, good_since: None, fast_recenter_armed: false });
        Ok(())
    }

    // --- Dither -----------------------------------------------------------

    pub fn dither(&mut self, mount: &mut Mount, amplitude_px: f64, ra_only: bool, settle: SettleParams, fast_recenter: bool, now: Instant) -> GuideResult<()> {
        let Some(lock) = self.lock_position.as_mut() else {
            return Err(GuideError::WrongState { expected: "selected", actual: "no lock position".into() });
        };
        let mut rng = rand::thread_rng();
        let angle = rng.gen_range(0.0..std::f64::consts::TAU);
        let radius = amplitude_px * rng.gen::<f64>().sqrt();
        let dx = radius * angle.cos();
        let dy = if ra_only { 0.0 } else { radius * angle.sin() };
        lock.target = lock.target + Point::new(dx, dy);

        mount.guiding_dithered(amplitude_px);
        self.secondaries_reacquiring = true;

        self.dither = Some(DitherRun {
            settle,
            started: now,
            good_since: None,
            fast_recenter_armed: fast_recenter,
        });

        self.events.publish(GuideEvent::GuidingDithered { dx, dy });
        Ok(())
    }

    fn update_dither_settle(&mut self, now: Instant, distance_px: f64) -> Option<bool> {
        let Some(run) = self.dither.as_mut() else { return None };
        let elapsed = now.duration_since(run.started).as_secs_f64();
        let ok = if distance_px <= run.settle.tolerance_px {
            let since = *run.good_since.get_or_insert(now);
            let good_for = now.duration_since(since).as_secs_f64();
            self.events.publish(GuideEvent::Settling { dist: distance_px, time_s: good_for, settle_time_s: run.settle.settle_time_s });
            if good_for >= run.settle.settle_time_s {
                Some(true)
            } else {
                None
            }
        } else {
            run.good_since = None;
            self.events.publish(GuideEvent::Settling { dist: distance_px, time_s: 0.0, settle_time_s: run.settle.settle_time_s });
            None
        };

        if ok.is_none() && elapsed >= run.settle.timeout_s {
            return Some(false);
        }
        ok
    }

    // --- Per-frame driver -------------------------------------------------

    /// Runs one full guide step (spec.md §4.7 steps 1-10). `mount` is
    /// the mount currently receiving corrections (the AO if present,
    /// otherwise the scope).
    pub fn process_frame(&mut self, mount: &mut Mount, frame: Option<&Frame>, now: Instant) -> GuideResult<FrameOutcome> {
        if self.state != GuiderState::Guiding || self.pause == PauseLevel::Full {
            return Ok(FrameOutcome::Skipped);
        }
        let Some(frame) = frame else {
            return Ok(FrameOutcome::Skipped);
        };
        if self.lock_position.is_none() {
            return Err(GuideError::WrongState { expected: "lock position set", actual: "none".into() });
        }

        // Step 2: lock position shift.
        let mut shift_lost = false;
        let target = {
            let lock_mut = self.lock_position.as_mut().expect("checked above");
            let t = lock_mut.advance(now);
            if lock_mut.shift_enabled && !point_in_frame(t, frame) {
                lock_mut.shift_enabled = false;
                shift_lost = true;
            }
            lock_mut.target
        };
        if shift_lost {
            self.events.publish(GuideEvent::LockPositionLost);
        }

        // Step 3: find the primary at its previous position.
        let seed = self.primary.as_ref().map(|s| s.position).unwrap_or(target);
        let star = find_star(frame, seed.x, seed.y, &self.find_params);

        if !star.result.is_ok() {
            self.consecutive_losses += 1;
            if self.consecutive_losses >= MAX_CONSECUTIVE_LOSSES {
                let info = format!("star not found: {:?}", star.result);
                self.events.publish(GuideEvent::StarLost { info: info.clone() });
                return Ok(FrameOutcome::StarLost { info });
            }
            // Dead-reckon this frame rather than chase noise.
            if self.pause != PauseLevel::GuidingOnly {
                mount.move_offset(Point::invalid(), MoveOptions::deduced())?;
            }
            self.frame_number += 1;
            return Ok(FrameOutcome::Skipped);
        }
        self.consecutive_losses = 0;

        let mass_result = self.mass_checker.add_sample(now, star.mass, frame.exposure_s);
        let distance_px = star.position.distance(&target);
        self.update_primary_stats(distance_px);

        // The gate itself switches to accepting large-magnitude frames
        // once the wait timeout elapses (spec.md §4.2/§7): it never
        // declares the star lost on our behalf, only suppresses moves
        // during the initial wait.
        let admitted = self.distance_gate.admit(now, distance_px);
        if !admitted {
            self.primary = Some(star.clone());
            self.frame_number += 1;
            return Ok(FrameOutcome::Skipped);
        }

        let mut camera_offset = star.position - target;

        // Step 5: multi-star refinement.
        if self.options.multi_star_enabled && !self.secondaries.is_empty() {
            camera_offset = self.refine_with_secondaries(frame, star.position, camera_offset);
        }

        if self.secondaries_reacquiring && distance_px <= REACQUIRE_SIGMA * self.primary_sigma() {
            self.secondaries_reacquiring = false;
        }

        self.primary = Some(star.clone());

        // Steps 6-9: transform, algorithm, hand to mount. Bypassed by
        // fast-recenter while a dither is settling far from lock.
        let fast_recenter = self.dither.as_ref().map(|d| d.fast_recenter_armed).unwrap_or(false);
        let report = if self.pause == PauseLevel::GuidingOnly {
            None
        } else if fast_recenter {
            let step = Point::new(
                clamp_step(camera_offset.x, FAST_RECENTER_MAX_STEP_PX),
                clamp_step(camera_offset.y, FAST_RECENTER_MAX_STEP_PX),
            );
            let r = mount.move_offset(step, MoveOptions::direct())?;
            if camera_offset.x.abs() < FAST_RECENTER_TOLERANCE_PX && camera_offset.y.abs() < FAST_RECENTER_TOLERANCE_PX {
                if let Some(run) = self.dither.as_mut() {
                    run.fast_recenter_armed = false;
                }
            }
            Some(r)
        } else {
            Some(mount.move_offset(camera_offset, MoveOptions::algo())?)
        };

        // Dither settle tracking.
        if self.dither.is_some() {
            if let Some(settled) = self.update_dither_settle(now, camera_offset.magnitude()) {
                mount.guiding_dither_settle_done();
                self.dither = None;
                let err = if settled { None } else { Some("dither settle timed out".to_string()) };
                self.events.publish(GuideEvent::SettleDone { ok: settled, error: err });
            }
        }

        self.frame_number += 1;
        self.average_distance = (self.average_distance * (self.frame_number - 1) as f64 + distance_px) / self.frame_number as f64;

        let step_info = self.build_step_info(camera_offset, report, &star, mass_result);
        self.events.publish(GuideEvent::GuideStep { step_info: Box::new(step_info.clone()) });
        Ok(FrameOutcome::Step(Box::new(step_info)))
    }

    fn primary_sigma(&self) -> f64 {
        self.primary_var.sqrt().max(0.1)
    }

    fn update_primary_stats(&mut self, distance_px: f64) {
        const ALPHA: f64 = 0.1;
        let delta = distance_px - self.primary_mean;
        self.primary_mean += ALPHA * delta;
        self.primary_var = (1.0 - ALPHA) * (self.primary_var + ALPHA * delta * delta);
    }

    /// Searches for each secondary near its predicted location, computes
    /// an SNR-weighted mean offset, and accepts it only when it is
    /// strictly smaller in magnitude than the primary-only offset.
    fn refine_with_secondaries(&mut self, frame: &Frame, primary_pos: Point, primary_offset: Point) -> Point {
        let primary_snr = self.primary.as_ref().map(|s| s.snr).unwrap_or(1.0).max(1e-6);
        let sigma = self.primary_sigma();
        let target = primary_pos - primary_offset;

        let mut weighted = primary_offset;
        let mut total_weight = 1.0;
        let mut to_drop = Vec::new();

        for (idx, sec) in self.secondaries.iter_mut().enumerate() {
            let search_at = if sec.lost || self.secondaries_reacquiring {
                primary_pos + sec.offset_from_primary
            } else {
                sec.last_position
            };
            let found = find_star(frame, search_at.x, search_at.y, &self.find_params);
            if !found.result.is_ok() {
                sec.miss_count += 1;
                if sec.miss_count >= SECONDARY_MISS_LIMIT {
                    sec.offset_from_primary = search_at - primary_pos;
                    sec.miss_count = 0;
                }
                sec.lost = true;
                continue;
            }

            let motion = found.position.distance(&sec.last_position);
            if motion == 0.0 {
                sec.zero_count += 1;
                if sec.zero_count >= SECONDARY_ZERO_LIMIT {
                    to_drop.push(idx);
                    continue;
                }
            } else {
                sec.zero_count = 0;
            }

            if motion > SECONDARY_MISS_SIGMA * sigma {
                sec.miss_count += 1;
                if sec.miss_count >= SECONDARY_MISS_LIMIT {
                    sec.offset_from_primary = found.position - primary_pos;
                    sec.miss_count = 0;
                }
                sec.lost = true;
                continue;
            }
            sec.miss_count = 0;
            sec.lost = false;
            sec.last_position = found.position;

            // Displacement from this secondary's own expected position
            // (lock + its offset from the primary at auto-select time),
            // not from the primary's lock directly: that would bake the
            // primary/secondary spacing in as a constant bias.
            let sec_offset = found.position - (target + sec.offset_from_primary);
            let weight = found.snr / primary_snr;
            weighted = weighted + sec_offset * weight;
            total_weight += weight;
        }

        for &idx in to_drop.iter().rev() {
            self.secondaries.remove(idx);
        }

        let refined = weighted / total_weight;
        if refined.magnitude() < primary_offset.magnitude() {
            refined
        } else {
            primary_offset
        }
    }

    fn build_step_info(&self, camera_offset: Point, report: Option<crate::mount::MoveReport>, star: &Star, mass_result: crate::quality::MassCheckResult) -> GuideStepInfo {
        let (mount_offset, x_axis, y_axis, ao_position, limited) = match report {
            Some(r) => (
                r.mount_offset,
                AxisStepInfo { duration_ms: r.x.amount_moved, direction_positive: r.x.direction_positive, limited: r.x.limited },
                AxisStepInfo { duration_ms: r.y.amount_moved, direction_positive: r.y.direction_positive, limited: r.y.limited },
                None,
                r.outcome == MoveOutcome::AoLimitReached,
            ),
            None => (
                Point::invalid(),
                AxisStepInfo { duration_ms: 0.0, direction_positive: true, limited: false },
                AxisStepInfo { duration_ms: 0.0, direction_positive: true, limited: false },
                None,
                false,
            ),
        };
        let _ = mass_result;
        let _ = limited;
        GuideStepInfo {
            frame_number: self.frame_number,
            time_since_start_s: self.start_time.map(|t| t.elapsed().as_secs_f64()).unwrap_or(0.0),
            camera_offset,
            mount_offset,
            x_axis,
            y_axis,
            ao_position,
            star_mass: star.mass,
            star_snr: star.snr,
            average_distance: self.average_distance,
        }
    }
}

fn point_in_frame(p: Point, frame: &Frame) -> bool {
    p.is_valid() && p.x >= 0.0 && p.y >= 0.0 && p.x < frame.width as f64 && p.y < frame.height as f64
}

fn clamp_step(value: f64, max_abs: f64) -> f64 {
    value.clamp(-max_abs, max_abs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountAlgorithmOptions;
    use crate::geometry::{Calibration, GuideParity, PierSide};
    use crate::mount::{Direction, ScopeDriver, ScopeMount, StepOutcome};
    use std::sync::{Arc as StdArc, Mutex};

    struct FakeScope {
        pulses: StdArc<Mutex<Vec<(Direction, f64)>>>,
    }

    impl ScopeDriver for FakeScope {
        fn is_connected(&self) -> bool { true }
        fn is_busy(&self) -> bool { false }
        fn pulse_guide(&mut self, direction: Direction, duration_ms: f64) -> Result<(), String> {
            self.pulses.lock().unwrap().push((direction, duration_ms));
            Ok(())
        }
    }

    fn gaussian_frame(width: usize, height: usize, cx: f64, cy: f64, peak: f64) -> Frame {
        let mut pixels = vec![0u16; width * height];
        for y in 0..height {
            for x in 0..width {
                let dx = x as f64 - cx;
                let dy = y as f64 - cy;
                let r2 = dx * dx + dy * dy;
                let v = 200.0 + peak * (-r2 / (2.0 * 1.6 * 1.6)).exp();
                pixels[y * width + x] = v.round().clamp(0.0, 65000.0) as u16;
            }
        }
        Frame::new(pixels, width, height, 1.0)
    }

    fn two_star_frame(width: usize, height: usize, p1: (f64, f64), p2: (f64, f64), peak: f64) -> Frame {
        let mut pixels = vec![0u16; width * height];
        for y in 0..height {
            for x in 0..width {
                let mut v = 200.0_f64;
                for &(cx, cy) in &[p1, p2] {
                    let dx = x as f64 - cx;
                    let dy = y as f64 - cy;
                    let r2 = dx * dx + dy * dy;
                    v += peak * (-r2 / (2.0 * 1.6 * 1.6)).exp();
                }
                pixels[y * width + x] = v.round().clamp(0.0, 65000.0) as u16;
            }
        }
        Frame::new(pixels, width, height, 1.0)
    }

    fn test_mount() -> Mount {
        let pulses = StdArc::new(Mutex::new(Vec::new()));
        let mut mount = Mount::Scope(ScopeMount::new(Box::new(FakeScope { pulses }), &MountAlgorithmOptions::default(), 0.0));
        mount.set_calibration(Calibration {
            x_angle: 0.0,
            y_angle: std::f64::consts::FRAC_PI_2,
            x_rate: 1.0,
            y_rate: 1.0,
            declination: Some(0.0),
            pier_side: PierSide::East,
            ra_parity: GuideParity::Even,
            dec_parity: GuideParity::Even,
            rotator_angle: None,
            binning: 1,
            is_valid: true,
        });
        mount
    }

    #[test]
    fn test_select_auto_sets_lock_position_and_state() {
        let frame = gaussian_frame(200, 200, 100.0, 100.0, 4000.0);
        let events = StdArc::new(EventBus::new());
        let mut guider = Guider::new(GuiderOptions::default(), events);
        assert!(guider.select_auto(&frame));
        assert_eq!(guider.state(), GuiderState::Selected);
        assert!(guider.lock_position().is_some());
    }

    #[test]
    fn test_process_frame_requires_guiding_state() {
        let frame = gaussian_frame(200, 200, 100.0, 100.0, 4000.0);
        let events = StdArc::new(EventBus::new());
        let mut guider = Guider::new(GuiderOptions::default(), events);
        guider.select_auto(&frame);
        let mut mount = test_mount();
        let outcome = guider.process_frame(&mut mount, Some(&frame), Instant::now()).unwrap();
        assert!(matches!(outcome, FrameOutcome::Skipped));
    }

    #[test]
    fn test_process_frame_emits_step_when_guiding() {
        let frame = gaussian_frame(200, 200, 100.0, 100.0, 4000.0);
        let events = StdArc::new(EventBus::new());
        let mut guider = Guider::new(GuiderOptions::default(), events);
        guider.select_auto(&frame);
        // Force straight to Calibrated/Guiding for this unit test; the
        // calibration state machine itself is exercised in mount.rs/
        // calibration.rs.
        guider.state = GuiderState::Calibrated;
        guider.start_guiding().unwrap();

        let mut mount = test_mount();
        let shifted = gaussian_frame(200, 200, 103.0, 100.0, 4000.0);
        let outcome = guider.process_frame(&mut mount, Some(&shifted), Instant::now()).unwrap();
        match outcome {
            FrameOutcome::Step(info) => assert!(info.camera_offset.x.abs() > 1.0),
            other => panic!("expected a guide step, got {other:?}"),
        }
    }

    #[test]
    fn test_dither_moves_lock_position() {
        let frame = gaussian_frame(200, 200, 100.0, 100.0, 4000.0);
        let events = StdArc::new(EventBus::new());
        let mut guider = Guider::new(GuiderOptions::default(), events);
        guider.select_auto(&frame);
        let before = guider.lock_position().unwrap();
        let mut mount = test_mount();
        let settle = SettleParams { tolerance_px: 1.5, settle_time_s: 5.0, timeout_s: 30.0 };
        guider.dither(&mut mount, 10.0, false, settle, true, Instant::now()).unwrap();
        let after = guider.lock_position().unwrap();
        assert!(before.distance(&after) > 0.0 || before.distance(&after) == 0.0);
        assert!(guider.dither.is_some());
    }

    #[test]
    fn test_pause_guiding_only_suppresses_moves_but_keeps_state() {
        let frame = gaussian_frame(200, 200, 100.0, 100.0, 4000.0);
        let events = StdArc::new(EventBus::new());
        let mut guider = Guider::new(GuiderOptions::default(), events);
        guider.select_auto(&frame);
        guider.state = GuiderState::Calibrated;
        guider.start_guiding().unwrap();
        let mut mount = test_mount();
        guider.pause(&mut mount, PauseLevel::GuidingOnly);
        let outcome = guider.process_frame(&mut mount, Some(&frame), Instant::now()).unwrap();
        match outcome {
            FrameOutcome::Step(info) => assert!(!info.mount_offset.is_valid()),
            other => panic!("expected a step with no move, got {other:?}"),
        }
    }

    #[test]
    fn test_refine_with_secondaries_measures_from_own_reference_p7() {
        // P7: the refined offset must be accepted (and thus <= the
        // primary-only magnitude) for a secondary that is genuinely
        // tracking, measured from its own expected position rather than
        // the primary's lock.
        let events = StdArc::new(EventBus::new());
        let mut guider = Guider::new(GuiderOptions::default(), events);

        let primary_start = Point::new(100.0, 100.0);
        let secondary_start = Point::new(140.0, 100.0);
        guider.lock_position = Some(LockPosition::new(primary_start));
        guider.primary = Some(Star {
            position: primary_start,
            mass: 5000.0,
            snr: 50.0,
            hfd: 3.0,
            saturated: false,
            result: crate::stars::FindResult::Ok,
        });
        guider.secondaries = vec![SecondaryStar {
            last_position: secondary_start,
            offset_from_primary: secondary_start - primary_start,
            snr: 30.0,
            lost: false,
            miss_count: 0,
            zero_count: 0,
        }];
        // Give the primary's running sigma enough spread that the
        // secondary's 1px motion isn't flagged as an outlier excursion.
        guider.primary_var = 4.0;

        // Primary moves by (2, 0) from the lock; the secondary, measured
        // from its own expected position (lock + its stored offset),
        // moves by only (1, 0).
        let frame = two_star_frame(200, 200, (102.0, 100.0), (141.0, 100.0), 4000.0);
        let primary_offset = Point::new(2.0, 0.0);
        let refined = guider.refine_with_secondaries(&frame, Point::new(102.0, 100.0), primary_offset);

        assert!(refined.magnitude() < primary_offset.magnitude());
        assert!((refined.x - 1.5).abs() < 0.2, "refined={refined:?}");
    }
}

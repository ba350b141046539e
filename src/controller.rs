//! Top-level synchronous sequencer: owns the camera, the mount(s), and
//! the `Guider`, and exposes the blocking operations external
//! orchestration drives directly (spec.md §4.8).
//!
//! Grounded on `guiding/phd2/guider.rs`'s `start_guiding`/
//! `start_dithering`, which issue a command and block on an event
//! rather than poll; here the controller owns the `Guider` itself and
//! blocks on its own channel subscription instead of a socket
//! round-trip to an external process.

use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::ao_coordinator::{issue_bump, AoCoordinator};
use crate::camera::Camera;
use crate::config::{CalibrationOptions, EngineOptions};
use crate::error::{GuideError, GuideResult};
use crate::events::{AlertSeverity, EventBus, GuideEvent, MountKind};
use crate::geometry::Point;
use crate::guider::{FrameOutcome, Guider, PauseLevel, SettleParams};
use crate::mount::{CalibrationProgress, Mount};

/// How long a calibration step or settle loop may go without a usable
/// camera frame/event before giving up; distinct from a dither's own
/// settle timeout, this guards against a stalled camera or a closed
/// event bus rather than a stalled star.
const FRAME_STALL_TIMEOUT: Duration = Duration::from_secs(60);

/// The AO (step guider) rig, paired with the coordinator that decides
/// when to bump the slow mount to keep it centered.
pub struct AoRig {
    pub mount: Mount,
    pub coordinator: AoCoordinator,
}

/// Picks which mount receives frame-to-frame corrections: the AO if
/// one is rigged, otherwise the scope. A free function rather than a
/// method, so callers can borrow it disjointly from `self.guider`.
fn correction_mount<'a>(ao: &'a mut Option<AoRig>, scope: &'a mut Mount) -> &'a mut Mount {
    match ao {
        Some(rig) => &mut rig.mount,
        None => scope,
    }
}

/// Owns everything needed to run the guiding loop end to end: the
/// camera, the scope (and optional AO), and the `Guider` state
/// machine. The surrounding application talks to this, not to `Guider`
/// directly, matching spec.md §4.8's "never touch the frame buffer"
/// contract for the sequencer operations.
pub struct Controller {
    camera: Box<dyn Camera>,
    scope: Mount,
    ao: Option<AoRig>,
    guider: Guider,
    events: Arc<EventBus>,
    calibration: CalibrationOptions,
}

impl Controller {
    pub fn new(camera: Box<dyn Camera>, scope: Mount, ao: Option<AoRig>, options: EngineOptions, events: Arc<EventBus>) -> Self {
        let guider = Guider::new(options.guider, Arc::clone(&events));
        Self { camera, scope, ao, guider, events, calibration: options.calibration }
    }

    pub fn guider(&self) -> &Guider {
        &self.guider
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    fn capture(&mut self) -> GuideResult<crate::frame::Frame> {
        self.camera.capture().map_err(|e| GuideError::HardwareMove(e.to_string()))
    }

    /// Selects a guide star automatically from the next available
    /// frame.
    pub fn select_auto(&mut self) -> GuideResult<bool> {
        self.guider.start_selecting();
        let frame = self.capture()?;
        Ok(self.guider.select_auto(&frame))
    }

    /// Runs scope calibration to completion, then AO calibration if an
    /// AO is rigged, driving each measurement off a fresh camera frame.
    fn run_calibration(&mut self) -> GuideResult<()> {
        let opts = self.calibration.clone();
        let has_ao = self.ao.is_some();

        self.guider.begin_calibration(
            &mut self.scope,
            MountKind::Scope,
            opts.steps_per_iteration,
            opts.max_iterations,
            opts.min_displacement_px,
        )?;
        self.drive_calibration_stage(MountKind::Scope, has_ao)?;

        if self.ao.is_some() {
            {
                let rig = self.ao.as_mut().expect("checked above");
                self.guider.begin_calibration(
                    &mut rig.mount,
                    MountKind::Ao,
                    opts.steps_per_iteration,
                    opts.max_iterations,
                    opts.min_displacement_px,
                )?;
            }
            self.drive_calibration_stage(MountKind::Ao, false)?;
        }
        Ok(())
    }

    fn drive_calibration_stage(&mut self, mount_kind: MountKind, has_ao: bool) -> GuideResult<()> {
        loop {
            let frame = self.capture()?;
            let progress = match mount_kind {
                MountKind::Scope => self.guider.drive_calibration(&mut self.scope, mount_kind, &frame, has_ao)?,
                MountKind::Ao => {
                    let rig = self.ao.as_mut().expect("ao calibration requires a rigged ao");
                    self.guider.drive_calibration(&mut rig.mount, mount_kind, &frame, has_ao)?
                }
            };
            match progress {
                CalibrationProgress::Done => return Ok(()),
                CalibrationProgress::Failed(reason) => return Err(GuideError::CalibrationFailed(reason)),
                CalibrationProgress::InProgress { .. } => continue,
            }
        }
    }

    /// Blocks, capturing and processing frames, until the event bus
    /// reports `SettleDone`. Shared by `guide` (settling onto the lock
    /// position right after calibration) and `dither`.
    ///
    /// Each `process_frame` call may publish several events (`Settling`,
    /// `SettleDone`, `GuideStep`); the channel is drained fully and
    /// non-blockingly after every frame rather than one event per frame,
    /// so a backlog of uninteresting events can never bury a `SettleDone`
    /// that already arrived.
    fn drive_until_settled(&mut self, rx: &Receiver<GuideEvent>) -> GuideResult<()> {
        let stall_deadline = Instant::now() + FRAME_STALL_TIMEOUT;
        loop {
            let frame = self.capture()?;
            let now = Instant::now();
            let outcome = self.guider.process_frame(correction_mount(&mut self.ao, &mut self.scope), Some(&frame), now)?;
            if let FrameOutcome::StarLost { info } = outcome {
                return Err(GuideError::CalibrationFailed(format!("star lost while settling: {info}")));
            }
            self.maybe_bump_ao(now);

            loop {
                match rx.try_recv() {
                    Ok(GuideEvent::SettleDone { ok: true, .. }) => return Ok(()),
                    Ok(GuideEvent::SettleDone { ok: false, error }) => {
                        return Err(GuideError::CalibrationFailed(error.unwrap_or_else(|| "settle failed".to_string())));
                    }
                    Ok(_) => continue,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        return Err(GuideError::PersistentHardwareError("event bus closed".into()))
                    }
                }
            }
            if Instant::now() > stall_deadline {
                return Err(GuideError::Timeout(FRAME_STALL_TIMEOUT));
            }
        }
    }

    /// If an AO is rigged, feeds its current offset to the coordinator
    /// and issues a bump on the scope when it calls for one
    /// (spec.md §4.6).
    fn maybe_bump_ao(&mut self, now: Instant) {
        let Some(rig) = &mut self.ao else { return };
        let Mount::StepGuider(sg) = &rig.mount else { return };
        let (x, y) = sg.current_offset();
        let ao_offset = Point::new(x as f64, y as f64);
        let travel = sg.travel_limit() as f64;
        let calibration = rig.mount.get_calibration().clone();
        let mount_busy = self.scope.is_busy();

        let (bump, warn) = rig.coordinator.update(
            now,
            ao_offset,
            travel,
            false,
            ao_offset,
            calibration.x_rate,
            calibration.y_rate,
            mount_busy,
            false,
        );
        if warn {
            self.events.alert("AO has been bumping the mount for a long time", AlertSeverity::Warning);
        }
        if let Some(bump) = bump {
            let _ = issue_bump(&mut self.scope, bump);
        }
    }

    /// spec.md §4.8 `guide(settle, recalibrate?)`: starts guiding,
    /// optionally clearing calibration (forcing a fresh run) first, and
    /// returns only once the initial settle onto the lock position
    /// completes or times out.
    pub fn guide(&mut self, settle: SettleParams, recalibrate: bool) -> GuideResult<()> {
        if recalibrate {
            self.scope.clear_calibration();
            if let Some(rig) = &mut self.ao {
                rig.mount.clear_calibration();
            }
        }
        let ao_calibrated = self.ao.as_ref().map(|rig| rig.mount.is_calibrated()).unwrap_or(true);
        if !self.scope.is_calibrated() || !ao_calibrated {
            self.run_calibration()?;
        } else {
            self.guider.adopt_existing_calibration()?;
        }
        self.guider.start_guiding()?;

        let rx = self.events.subscribe_channel();
        self.guider.start_settle(settle, Instant::now())?;
        self.drive_until_settled(&rx)
    }

    /// spec.md §4.8 `dither(amount, ra_only, settle)`: moves the lock
    /// position by a random offset and returns once the subsequent
    /// settle completes or times out.
    pub fn dither(&mut self, amplitude_px: f64, ra_only: bool, settle: SettleParams) -> GuideResult<()> {
        let rx = self.events.subscribe_channel();
        let now = Instant::now();
        self.guider
            .dither(correction_mount(&mut self.ao, &mut self.scope), amplitude_px, ra_only, settle, true, now)?;
        self.drive_until_settled(&rx)
    }

    /// The third sequencer operation (not named in spec.md §4.8 but
    /// implied by §4.7's `any state -> stop` transition): unconditionally
    /// stops guiding and returns the scope (and AO, if any) to an idle
    /// state.
    pub fn stop_guiding(&mut self) {
        self.guider.stop(&mut self.scope);
        if let Some(rig) = &mut self.ao {
            rig.mount.guiding_stopped();
        }
    }

    pub fn pause(&mut self, level: PauseLevel) {
        self.guider.pause(&mut self.scope, level);
    }

    pub fn resume(&mut self) {
        self.guider.resume(&mut self.scope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountAlgorithmOptions;
    use crate::frame::Frame;
    use crate::geometry::{Calibration, GuideParity, PierSide};
    use crate::mount::{Direction, ScopeDriver, ScopeMount};
    use std::sync::Mutex;

    struct FixedCamera {
        width: usize,
        height: usize,
        star: Point,
    }

    impl Camera for FixedCamera {
        fn connect(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        fn disconnect(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn set_exposure(&mut self, _ms: u32) -> anyhow::Result<()> {
            Ok(())
        }
        fn set_binning(&mut self, _binning: crate::camera::Binning) -> anyhow::Result<()> {
            Ok(())
        }
        fn set_subframe(&mut self, _subframe: crate::camera::Subframe) -> anyhow::Result<()> {
            Ok(())
        }
        fn capture(&mut self) -> anyhow::Result<Frame> {
            let (w, h) = (self.width, self.height);
            let mut pixels = vec![0u16; w * h];
            for y in 0..h {
                for x in 0..w {
                    let dx = x as f64 - self.star.x;
                    let dy = y as f64 - self.star.y;
                    let r2 = dx * dx + dy * dy;
                    let v = 200.0 + 4000.0 * (-r2 / (2.0 * 1.6 * 1.6)).exp();
                    pixels[y * w + x] = v.round().clamp(0.0, 65000.0) as u16;
                }
            }
            Ok(Frame::new(pixels, w, h, 1.0))
        }
        fn supports_subframe(&self) -> bool {
            false
        }
        fn pixel_scale_um(&self) -> f64 {
            3.76
        }
        fn saturation_adu(&self) -> u32 {
            65000
        }
    }

    struct FakeScope {
        pulses: Arc<Mutex<Vec<(Direction, f64)>>>,
    }

    impl ScopeDriver for FakeScope {
        fn is_connected(&self) -> bool {
            true
        }
        fn is_busy(&self) -> bool {
            false
        }
        fn pulse_guide(&mut self, direction: Direction, duration_ms: f64) -> Result<(), String> {
            self.pulses.lock().unwrap().push((direction, duration_ms));
            Ok(())
        }
    }

    fn calibrated_scope() -> Mount {
        let pulses = Arc::new(Mutex::new(Vec::new()));
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
    fn test_guide_settles_with_an_already_calibrated_scope() {
        let camera = Box::new(FixedCamera { width: 200, height: 200, star: Point::new(100.0, 100.0) });
        let events = Arc::new(EventBus::new());
        let mut controller = Controller::new(camera, calibrated_scope(), None, EngineOptions::default(), events);

        assert!(controller.select_auto().unwrap());
        let settle = SettleParams { tolerance_px: 2.0, settle_time_s: 0.01, timeout_s: 5.0 };
        controller.guide(settle, false).unwrap();
        assert_eq!(controller.guider().state(), crate::guider::GuiderState::Guiding);
    }

    #[test]
    fn test_stop_guiding_returns_to_selected() {
        let camera = Box::new(FixedCamera { width: 200, height: 200, star: Point::new(100.0, 100.0) });
        let events = Arc::new(EventBus::new());
        let mut controller = Controller::new(camera, calibrated_scope(), None, EngineOptions::default(), events);
        controller.select_auto().unwrap();
        let settle = SettleParams { tolerance_px: 2.0, settle_time_s: 0.01, timeout_s: 5.0 };
        controller.guide(settle, false).unwrap();
        controller.stop_guiding();
        assert_eq!(controller.guider().state(), crate::guider::GuiderState::Selected);
    }
}

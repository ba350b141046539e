//! Frame-to-frame quality gates: the mass checker (catches seeing
//! excursions and transient obstructions) and the distance gate (catches
//! momentary large excursions without abandoning the lock position).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::math::median_f64;

/// Verdict of a single mass sample against the running window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MassCheckResult {
    Ok,
    TooLow,
    TooHigh,
}

/// Sliding-window mass checker, grounded on PHD2's `StarProfile`/mass-change
/// detector described in spec.md §4.2: a running median over roughly the
/// last 45s of exposure-normalized mass (double the nominal 22.5s window,
/// so the median lags an abrupt change by about half a window), plus a
/// slowly-rising low watermark and a monotonically-rising high watermark
/// that bound how far a single sample may depart from history.
pub struct MassChecker {
    /// (timestamp, mass/exposure) — normalized so an exposure-length
    /// change alone never looks like a mass change.
    window: VecDeque<(Instant, f64)>,
    window_duration: Duration,
    threshold: f64,
    enabled: bool,
    min_samples: usize,
    low_watermark: Option<f64>,
    high_watermark: Option<f64>,
}

/// Per-sample EMA rate at which the low watermark is allowed to rise back
/// up after a transient dip (a passing cloud should not permanently
/// depress the rejection floor).
const LOW_WATERMARK_RISE_RATE: f64 = 0.05;

impl MassChecker {
    pub fn new(threshold: f64, enabled: bool) -> Self {
        Self {
            window: VecDeque::new(),
            window_duration: Duration::from_secs(45),
            threshold,
            enabled,
            min_samples: 3,
            low_watermark: None,
            high_watermark: None,
        }
    }

    fn evict_stale(&mut self, now: Instant) {
        while let Some(&(t, _)) = self.window.front() {
            if now.duration_since(t) > self.window_duration {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Feed one sample (raw mass plus the exposure it was measured
    /// under) and get back its verdict. The sample is always added to
    /// the window, even when flagged, so a sustained shift in mass (e.g.
    /// thin cloud passing) is absorbed rather than flagged forever.
    pub fn add_sample(&mut self, now: Instant, mass: f64, exposure_s: f64) -> MassCheckResult {
        self.evict_stale(now);
        let normalized = if exposure_s > 1e-9 { mass / exposure_s } else { mass };

        let result = if !self.enabled || self.window.len() < self.min_samples {
            MassCheckResult::Ok
        } else {
            let mut samples: Vec<f64> = self.window.iter().map(|&(_, m)| m).collect();
            let median = median_f64(&mut samples);
            self.bump_watermarks(median);

            let low = self.low_watermark.unwrap_or(median);
            let high = self.high_watermark.unwrap_or(median);
            let t = self.threshold;
            if median <= 0.0 {
                MassCheckResult::Ok
            } else if normalized < (1.0 - t) * low {
                MassCheckResult::TooLow
            } else if normalized > (1.0 + t) * high || normalized > (1.0 + 2.0 * t) * median {
                MassCheckResult::TooHigh
            } else {
                MassCheckResult::Ok
            }
        };

        self.window.push_back((now, normalized));
        result
    }

    /// High watermark only ever rises; low watermark rises back toward
    /// the current median at `LOW_WATERMARK_RISE_RATE` per sample but
    /// snaps down instantly to a new, lower median (spec.md §4.2).
    fn bump_watermarks(&mut self, median: f64) {
        self.high_watermark = Some(self.high_watermark.map_or(median, |h| h.max(median)));
        self.low_watermark = Some(match self.low_watermark {
            None => median,
            Some(low) if median < low => median,
            Some(low) => low + LOW_WATERMARK_RISE_RATE * (median - low),
        });
    }

    /// Notify the checker that the exposure length changed this frame
    /// (spec.md §4.2 "saturation and exposure coupling"). Per-sample
    /// normalization already accounts for each sample's own exposure, but
    /// the window is cleared so the first post-change median is not
    /// diluted by pre-change history taken under a different light level.
    pub fn notify_exposure_changed(&mut self) {
        self.window.clear();
        self.low_watermark = None;
        self.high_watermark = None;
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.low_watermark = None;
        self.high_watermark = None;
    }
}

/// Distance-gate state: tracks whether the star's measured offset is
/// within the recoverable range, and whether guiding has been suspended
/// waiting for it to come back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceState {
    Guiding,
    Waiting,
    Recovering,
}

/// How many consecutive in-range frames it takes to leave `Recovering`
/// and resume normal guiding.
const RECOVERY_FRAMES: u32 = 10;
/// How long `Recovering` is tolerated before giving up and reporting a
/// star-lost condition.
const RECOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Gate on frame-to-frame distance jumps: a single large excursion
/// (cosmic ray, passing satellite, brief loss of lock) suspends mount
/// corrections rather than chasing it, and only resumes once the star
/// has been back in range for `RECOVERY_FRAMES` consecutive frames.
pub struct DistanceGate {
    state: DistanceState,
    threshold_px: f64,
    recovering_since: Option<Instant>,
    consecutive_good: u32,
    /// Set once the 5s wait elapses with the star still out of range:
    /// from then on `Recovering` admits every frame, even large ones,
    /// until a fresh good streak brings the gate back to `Guiding`.
    accepting_large: bool,
}

impl DistanceGate {
    pub fn new(threshold_px: f64) -> Self {
        Self {
            state: DistanceState::Guiding,
            threshold_px,
            recovering_since: None,
            consecutive_good: 0,
            accepting_large: false,
        }
    }

    pub fn state(&self) -> DistanceState {
        self.state
    }

    /// Feed one frame's distance from the lock position. Returns `true`
    /// if the mount should be moved this frame, `false` if the frame
    /// should be recorded but the move suppressed.
    pub fn admit(&mut self, now: Instant, distance_px: f64) -> bool {
        let in_range = distance_px <= self.threshold_px;
        match self.state {
            DistanceState::Guiding => {
                if in_range {
                    true
                } else {
                    self.state = DistanceState::Waiting;
                    self.recovering_since = Some(now);
                    self.consecutive_good = 0;
                    false
                }
            }
            DistanceState::Waiting => {
                if in_range {
                    self.consecutive_good += 1;
                    self.state = DistanceState::Recovering;
                    if self.consecutive_good >= RECOVERY_FRAMES {
                        self.state = DistanceState::Guiding;
                        self.recovering_since = None;
                        self.consecutive_good = 0;
                        true
                    } else {
                        false
                    }
                } else if self.timed_out(now) {
                    // The 5s wait has elapsed and the star is still out
                    // of range: start accepting frames again, even at
                    // large magnitude, so tracking can recover.
                    self.state = DistanceState::Recovering;
                    self.accepting_large = true;
                    self.consecutive_good = 0;
                    true
                } else {
                    false
                }
            }
            DistanceState::Recovering => {
                if in_range {
                    self.consecutive_good += 1;
                    if self.consecutive_good >= RECOVERY_FRAMES {
                        self.state = DistanceState::Guiding;
                        self.recovering_since = None;
                        self.consecutive_good = 0;
                        self.accepting_large = false;
                        return true;
                    }
                } else {
                    self.consecutive_good = 0;
                }
                self.accepting_large
            }
        }
    }

    /// `true` once the recovery wait has elapsed without the star coming
    /// back in range. `admit` consults this itself to switch into
    /// accepting-large-frames mode; callers no longer need to treat this
    /// as star-lost.
    pub fn timed_out(&self, now: Instant) -> bool {
        match self.recovering_since {
            Some(since) => now.duration_since(since) > RECOVERY_TIMEOUT,
            None => false,
        }
    }

    pub fn reset(&mut self) {
        self.state = DistanceState::Guiding;
        self.recovering_since = None;
        self.consecutive_good = 0;
        self.accepting_large = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mass_checker_flags_drop() {
        let mut checker = MassChecker::new(0.5, true);
        let base = Instant::now();
        for i in 0..5 {
            let t = base + Duration::from_secs(i);
            assert_eq!(checker.add_sample(t, 1000.0, 1.0), MassCheckResult::Ok);
        }
        let t = base + Duration::from_secs(6);
        assert_eq!(checker.add_sample(t, 200.0, 1.0), MassCheckResult::TooLow);
    }

    #[test]
    fn test_mass_checker_flags_spike() {
        let mut checker = MassChecker::new(0.5, true);
        let base = Instant::now();
        for i in 0..5 {
            let t = base + Duration::from_secs(i);
            assert_eq!(checker.add_sample(t, 1000.0, 1.0), MassCheckResult::Ok);
        }
        let t = base + Duration::from_secs(6);
        assert_eq!(checker.add_sample(t, 5000.0, 1.0), MassCheckResult::TooHigh);
    }

    #[test]
    fn test_mass_checker_disabled_always_ok() {
        let mut checker = MassChecker::new(0.5, false);
        let base = Instant::now();
        for i in 0..5 {
            let t = base + Duration::from_secs(i);
            checker.add_sample(t, 1000.0, 1.0);
        }
        assert_eq!(checker.add_sample(base + Duration::from_secs(6), 1.0, 1.0), MassCheckResult::Ok);
    }

    #[test]
    fn test_mass_checker_exposure_change_does_not_trigger_rejection() {
        // A doubled exposure alone (double the mass, same sky) must not
        // look like a mass-change event once normalized.
        let mut checker = MassChecker::new(0.5, true);
        let base = Instant::now();
        for i in 0..5 {
            let t = base + Duration::from_secs(i);
            checker.add_sample(t, 1000.0, 1.0);
        }
        checker.notify_exposure_changed();
        let mut result = MassCheckResult::TooLow;
        for i in 0..5 {
            let t = base + Duration::from_secs(10 + i);
            result = checker.add_sample(t, 2000.0, 2.0);
        }
        assert_eq!(result, MassCheckResult::Ok);
    }

    #[test]
    fn test_mass_checker_watermarks_bound_running_median_p4() {
        // P4: the running median never exceeds the high watermark and
        // never falls below the low watermark; for stationary input the
        // low watermark is non-decreasing in the long run.
        let mut checker = MassChecker::new(0.5, true);
        let base = Instant::now();
        let mut rng_state: u64 = 42;
        let mut next = || {
            rng_state = rng_state.wrapping_mul(6364136223846793005).wrapping_add(1);
            ((rng_state >> 33) as f64 / u32::MAX as f64) * 40.0 - 20.0
        };
        let mut last_low = 0.0;
        for i in 0..60 {
            let t = base + Duration::from_secs(i);
            let mass = 1000.0 + next();
            checker.add_sample(t, mass, 1.0);
            if let (Some(low), Some(high)) = (checker.low_watermark, checker.high_watermark) {
                assert!(low <= high);
                assert!(low >= last_low - 1e-9);
                last_low = low;
            }
        }
    }

    #[test]
    fn test_distance_gate_suspends_and_recovers() {
        let mut gate = DistanceGate::new(5.0);
        let base = Instant::now();
        assert!(gate.admit(base, 1.0));
        assert_eq!(gate.state(), DistanceState::Guiding);

        assert!(!gate.admit(base + Duration::from_millis(100), 50.0));
        assert_eq!(gate.state(), DistanceState::Waiting);

        for i in 0..RECOVERY_FRAMES - 1 {
            let t = base + Duration::from_millis(200 + 100 * i as u64);
            assert!(!gate.admit(t, 1.0));
            assert_eq!(gate.state(), DistanceState::Recovering);
        }
        let t = base + Duration::from_millis(200 + 100 * RECOVERY_FRAMES as u64);
        assert!(gate.admit(t, 1.0));
        assert_eq!(gate.state(), DistanceState::Guiding);
    }

    #[test]
    fn test_distance_gate_times_out() {
        let mut gate = DistanceGate::new(5.0);
        let base = Instant::now();
        gate.admit(base, 1.0);
        gate.admit(base + Duration::from_millis(10), 50.0);
        assert!(!gate.timed_out(base + Duration::from_millis(100)));
        assert!(gate.timed_out(base + Duration::from_secs(6)));
    }

    #[test]
    fn test_distance_gate_admits_large_frames_after_timeout() {
        // spec.md §4.2/§7: once the wait times out with the star still
        // out of range, the gate must resume admitting frames (even
        // large ones) rather than rejecting forever.
        let mut gate = DistanceGate::new(5.0);
        let base = Instant::now();
        assert!(gate.admit(base, 1.0));
        assert!(!gate.admit(base + Duration::from_millis(10), 50.0));
        assert_eq!(gate.state(), DistanceState::Waiting);

        assert!(gate.admit(base + Duration::from_secs(6), 50.0));
        assert_eq!(gate.state(), DistanceState::Recovering);

        // Still out of range the next frame: keeps admitting.
        assert!(gate.admit(base + Duration::from_millis(6100), 40.0));
        assert_eq!(gate.state(), DistanceState::Recovering);
    }
}

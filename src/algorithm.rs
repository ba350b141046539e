//! One-dimensional guide algorithms: turn a measured offset into a
//! correction, per axis. `Hysteresis` is the default, matching the
//! teacher's default choice of algorithm for its own offset-correction
//! loop; the others are simpler/more aggressive alternatives offered by
//! the same contract.

use crate::config::{GuideAlgorithmKind, GuideAlgorithmParams};

/// Shared contract every one-dimensional algorithm variant implements.
/// `result` is the only required step each guiding frame; the rest are
/// notifications the controller fires on state transitions so an
/// algorithm with internal memory (hysteresis, resist-switch) can reset
/// or adapt.
pub trait GuideAlgorithmOps {
    fn result(&mut self, raw_distance: f64) -> f64;
    fn reset_params(&mut self);
    fn guiding_paused(&mut self) {}
    fn guiding_resumed(&mut self) {}
    fn guiding_dithered(&mut self, _amount: f64) {}
    fn guiding_dither_settle_done(&mut self) {}
    fn guiding_stopped(&mut self) {
        self.reset_params();
    }
    fn min_move(&self) -> f64;
    fn set_min_move(&mut self, min_move: f64);

    /// Best predicted correction for this step when no new measurement
    /// is available (e.g. the star was not found this frame). Default
    /// is no correction; algorithms with persisted state override this
    /// with their last output or current filter value.
    fn deduce_result(&self) -> f64 {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Identity {
    min_move: f64,
}

impl Identity {
    pub fn new(min_move: f64) -> Self {
        Self { min_move }
    }
}

impl GuideAlgorithmOps for Identity {
    fn result(&mut self, raw_distance: f64) -> f64 {
        if raw_distance.abs() < self.min_move {
            0.0
        } else {
            raw_distance
        }
    }

    fn reset_params(&mut self) {}

    fn min_move(&self) -> f64 {
        self.min_move
    }

    fn set_min_move(&mut self, min_move: f64) {
        self.min_move = min_move;
    }
}

/// Blends the raw measurement with the previous output, on the theory
/// that a lone frame-to-frame swing is more likely noise than a real
/// drift change: `output = (1 - aggressiveness)*input + aggressiveness*last_move`.
#[derive(Debug, Clone)]
pub struct Hysteresis {
    min_move: f64,
    aggressiveness: f64,
    last_move: f64,
}

impl Hysteresis {
    pub fn new(params: &GuideAlgorithmParams) -> Self {
        Self {
            min_move: params.min_move,
            aggressiveness: params.aggressiveness,
            last_move: 0.0,
        }
    }
}

impl GuideAlgorithmOps for Hysteresis {
    fn result(&mut self, raw_distance: f64) -> f64 {
        if raw_distance.abs() < self.min_move {
            return 0.0;
        }
        let move_amount = (1.0 - self.aggressiveness) * raw_distance + self.aggressiveness * self.last_move;
        self.last_move = move_amount;
        move_amount
    }

    fn reset_params(&mut self) {
        self.last_move = 0.0;
    }

    fn min_move(&self) -> f64 {
        self.min_move
    }

    fn set_min_move(&mut self, min_move: f64) {
        self.min_move = min_move;
    }

    fn deduce_result(&self) -> f64 {
        self.last_move
    }
}

/// Exponentially-weighted low-pass filter on the raw distance; smooths
/// single-frame noise at the cost of lag.
#[derive(Debug, Clone)]
pub struct LowPass {
    min_move: f64,
    aggressiveness: f64,
    filtered: f64,
}

impl LowPass {
    pub fn new(params: &GuideAlgorithmParams) -> Self {
        Self {
            min_move: params.min_move,
            aggressiveness: params.aggressiveness,
            filtered: 0.0,
        }
    }
}

impl GuideAlgorithmOps for LowPass {
    fn result(&mut self, raw_distance: f64) -> f64 {
        self.filtered += self.aggressiveness * (raw_distance - self.filtered);
        if self.filtered.abs() < self.min_move {
            0.0
        } else {
            self.filtered
        }
    }

    fn reset_params(&mut self) {
        self.filtered = 0.0;
    }

    fn min_move(&self) -> f64 {
        self.min_move
    }

    fn set_min_move(&mut self, min_move: f64) {
        self.min_move = min_move;
    }

    fn deduce_result(&self) -> f64 {
        self.filtered
    }
}

/// Second-order low-pass: filters the already-filtered signal again,
/// trading further noise rejection for more lag. Used on axes with a
/// noisy seeing-dominated error signal (typically Dec).
#[derive(Debug, Clone)]
pub struct LowPass2 {
    min_move: f64,
    aggressiveness: f64,
    stage1: f64,
    stage2: f64,
}

impl LowPass2 {
    pub fn new(params: &GuideAlgorithmParams) -> Self {
        Self {
            min_move: params.min_move,
            aggressiveness: params.aggressiveness,
            stage1: 0.0,
            stage2: 0.0,
        }
    }
}

impl GuideAlgorithmOps for LowPass2 {
    fn result(&mut self, raw_distance: f64) -> f64 {
        self.stage1 += self.aggressiveness * (raw_distance - self.stage1);
        self.stage2 += self.aggressiveness * (self.stage1 - self.stage2);
        if self.stage2.abs() < self.min_move {
            0.0
        } else {
            self.stage2
        }
    }

    fn reset_params(&mut self) {
        self.stage1 = 0.0;
        self.stage2 = 0.0;
    }

    fn min_move(&self) -> f64 {
        self.min_move
    }

    fn set_min_move(&mut self, min_move: f64) {
        self.min_move = min_move;
    }

    fn deduce_result(&self) -> f64 {
        self.stage2
    }
}

/// Suppresses corrections until enough same-direction error has built up
/// to suggest a persistent drift rather than seeing noise, then moves
/// with `fast_aggressiveness`; afterwards settles into
/// `slow_aggressiveness` tracking. Intended for a periodic-error-heavy
/// RA axis.
#[derive(Debug, Clone)]
pub struct ResistSwitch {
    min_move: f64,
    fast_aggressiveness: f64,
    slow_aggressiveness: f64,
    accumulated: f64,
    switched: bool,
    last_move: f64,
}

impl ResistSwitch {
    pub fn new(params: &GuideAlgorithmParams) -> Self {
        Self {
            min_move: params.min_move,
            fast_aggressiveness: params.fast_aggressiveness,
            slow_aggressiveness: params.slow_aggressiveness,
            accumulated: 0.0,
            switched: false,
            last_move: 0.0,
        }
    }
}

impl GuideAlgorithmOps for ResistSwitch {
    fn result(&mut self, raw_distance: f64) -> f64 {
        if raw_distance.signum() != self.accumulated.signum() && self.accumulated != 0.0 {
            self.accumulated = 0.0;
            self.switched = false;
        }
        self.accumulated += raw_distance;

        if !self.switched && self.accumulated.abs() >= self.min_move * 3.0 {
            self.switched = true;
        }

        if !self.switched {
            self.last_move = 0.0;
            return 0.0;
        }

        let aggressiveness = if self.accumulated.abs() >= self.min_move * 3.0 {
            self.fast_aggressiveness
        } else {
            self.slow_aggressiveness
        };
        let move_amount = raw_distance * aggressiveness;
        let move_amount = if move_amount.abs() < self.min_move { 0.0 } else { move_amount };
        self.last_move = move_amount;
        move_amount
    }

    fn reset_params(&mut self) {
        self.accumulated = 0.0;
        self.switched = false;
        self.last_move = 0.0;
    }

    fn min_move(&self) -> f64 {
        self.min_move
    }

    fn set_min_move(&mut self, min_move: f64) {
        self.min_move = min_move;
    }
}

/// A tagged union over the five algorithm variants, matching the
/// teacher's preference for enum dispatch over boxed trait objects when
/// the variant set is closed and known at compile time.
#[derive(Debug, Clone)]
pub enum GuideAlgorithm {
    Identity(Identity),
    Hysteresis(Hysteresis),
    LowPass(LowPass),
    LowPass2(LowPass2),
    ResistSwitch(ResistSwitch),
}

impl GuideAlgorithm {
    pub fn new(params: &GuideAlgorithmParams) -> Self {
        match params.kind {
            GuideAlgorithmKind::Identity => GuideAlgorithm::Identity(Identity::new(params.min_move)),
            GuideAlgorithmKind::Hysteresis => GuideAlgorithm::Hysteresis(Hysteresis::new(params)),
            GuideAlgorithmKind::LowPass => GuideAlgorithm::LowPass(LowPass::new(params)),
            GuideAlgorithmKind::LowPass2 => GuideAlgorithm::LowPass2(LowPass2::new(params)),
            GuideAlgorithmKind::ResistSwitch => GuideAlgorithm::ResistSwitch(ResistSwitch::new(params)),
        }
    }

    fn ops(&mut self) -> &mut dyn GuideAlgorithmOps {
        match self {
            GuideAlgorithm::Identity(a) => a,
            GuideAlgorithm::Hysteresis(a) => a,
            GuideAlgorithm::LowPass(a) => a,
            GuideAlgorithm::LowPass2(a) => a,
            GuideAlgorithm::ResistSwitch(a) => a,
        }
    }

    fn ops_ref(&self) -> &dyn GuideAlgorithmOps {
        match self {
            GuideAlgorithm::Identity(a) => a,
            GuideAlgorithm::Hysteresis(a) => a,
            GuideAlgorithm::LowPass(a) => a,
            GuideAlgorithm::LowPass2(a) => a,
            GuideAlgorithm::ResistSwitch(a) => a,
        }
    }

    pub fn result(&mut self, raw_distance: f64) -> f64 {
        self.ops().result(raw_distance)
    }

    pub fn reset_params(&mut self) {
        self.ops().reset_params();
    }

    pub fn guiding_paused(&mut self) {
        self.ops().guiding_paused();
    }

    pub fn guiding_resumed(&mut self) {
        self.ops().guiding_resumed();
    }

    pub fn guiding_dithered(&mut self, amount: f64) {
        self.ops().guiding_dithered(amount);
    }

    pub fn guiding_dither_settle_done(&mut self) {
        self.ops().guiding_dither_settle_done();
    }

    pub fn guiding_stopped(&mut self) {
        self.ops().guiding_stopped();
    }

    pub fn min_move(&mut self) -> f64 {
        self.ops().min_move()
    }

    pub fn set_min_move(&mut self, min_move: f64) {
        self.ops().set_min_move(min_move);
    }

    /// Best predicted correction when no new measurement is available
    /// this frame (spec.md §4.3 `deduce_result`); the mount layer uses
    /// this for a dead-reckoned move.
    pub fn deduce_result(&self) -> f64 {
        self.ops_ref().deduce_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_deadband() {
        let mut algo = Identity::new(0.2);
        assert_eq!(algo.result(0.1), 0.0);
        assert_eq!(algo.result(1.0), 1.0);
    }

    #[test]
    fn test_hysteresis_blends_with_previous_output() {
        let params = GuideAlgorithmParams {
            kind: GuideAlgorithmKind::Hysteresis,
            min_move: 0.1,
            aggressiveness: 0.5,
            fast_aggressiveness: 0.7,
            slow_aggressiveness: 0.3,
        };
        let mut algo = Hysteresis::new(&params);
        // last_move starts at 0, so the first output is half the input.
        let first = algo.result(2.0);
        assert!((first - 1.0).abs() < 1e-9);
        // A reversal is damped by the previous output, not the raw input.
        let reversed = algo.result(-2.0);
        assert!((reversed - (-0.5)).abs() < 1e-9);
    }

    #[test]
    fn test_lowpass_smooths_toward_input() {
        let params = GuideAlgorithmParams {
            kind: GuideAlgorithmKind::LowPass,
            min_move: 0.01,
            aggressiveness: 0.5,
            fast_aggressiveness: 0.7,
            slow_aggressiveness: 0.3,
        };
        let mut algo = LowPass::new(&params);
        let first = algo.result(10.0);
        let second = algo.result(10.0);
        assert!(second > first);
        assert!(second < 10.0);
    }

    #[test]
    fn test_resist_switch_requires_accumulation() {
        let params = GuideAlgorithmParams {
            kind: GuideAlgorithmKind::ResistSwitch,
            min_move: 0.3,
            aggressiveness: 0.5,
            fast_aggressiveness: 0.9,
            slow_aggressiveness: 0.2,
        };
        let mut algo = ResistSwitch::new(&params);
        assert_eq!(algo.result(0.2), 0.0);
        let moved = algo.result(0.2);
        assert!(moved != 0.0);
    }

    #[test]
    fn test_enum_dispatch_matches_kind() {
        let params = GuideAlgorithmParams {
            kind: GuideAlgorithmKind::Identity,
            min_move: 0.2,
            aggressiveness: 0.0,
            fast_aggressiveness: 0.0,
            slow_aggressiveness: 0.0,
        };
        let mut algo = GuideAlgorithm::new(&params);
        assert_eq!(algo.result(1.0), 1.0);
        assert_eq!(algo.deduce_result(), 0.0);
    }

    #[test]
    fn test_hysteresis_deduce_result_returns_last_move() {
        let params = GuideAlgorithmParams {
            kind: GuideAlgorithmKind::Hysteresis,
            min_move: 0.1,
            aggressiveness: 0.5,
            fast_aggressiveness: 0.7,
            slow_aggressiveness: 0.3,
        };
        let mut algo = GuideAlgorithm::new(&params);
        algo.result(2.0);
        assert_eq!(algo.deduce_result(), 2.0);
    }
}

//! AO/Mount coordinator: when a fast `StepGuider` (AO) and a slow
//! `Scope` are both present, routes per-frame corrections to the AO and
//! separately schedules "bump" moves on the mount to keep the AO near
//! the center of its travel (spec.md §4.6).
//!
//! Directly grounded on `examples/original_source/stepguider.cpp`'s
//! `StepGuider::MoveOffset`: the `m_avgOffset` EMA (alpha = 0.33), the
//! `m_bumpStepWeight` escalation (+1.0 far outside, +1/6 just outside),
//! the ×0.5-per-frame decay floored at 1.0, the `BumpWarnTime` = 240s
//! warning, and the `MOVEOPT_AO_LIMIT_HIT` 70%-of-offset override.

use crate::geometry::Point;
use crate::mount::{Mount, MoveOptions, MoveOutcome};
use std::time::{Duration, Instant};

const EMA_ALPHA: f64 = 0.33;
const BUMP_WARN_TIME: Duration = Duration::from_secs(240);
/// Weight applied to a bump move issued during dither settling, boosting
/// recentering speed while the star is expected to still be moving.
const SETTLING_BOOST_WEIGHT: f64 = 3.0;

#[derive(Debug, Clone, Copy)]
pub struct AoCoordinatorOptions {
    /// Percentage of full AO travel at which a bump becomes in-progress.
    pub bump_threshold_pct: f64,
    /// Percentage of full AO travel, as a fraction of half-travel, at
    /// which the bump weight escalates by the larger +1.0 step instead
    /// of the gentler +1/6.
    pub bump_far_threshold_pct: f64,
    /// Percentage of full AO travel treated as "centered" (bump ends).
    pub center_tolerance_pct: f64,
    /// Pixel-equivalent distance (in mount-axis units) a single bump
    /// cycle may move, before the 50%-of-search-region cap.
    pub bump_max_steps_per_cycle: f64,
    pub search_region_px: f64,
}

impl Default for AoCoordinatorOptions {
    fn default() -> Self {
        Self {
            bump_threshold_pct: 80.0,
            bump_far_threshold_pct: 90.0,
            center_tolerance_pct: 10.0,
            bump_max_steps_per_cycle: 5.0,
            search_region_px: 15.0,
        }
    }
}

/// A mount move the coordinator wants issued this frame, in camera-plane
/// pixels, on behalf of the slow mount.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BumpMove {
    pub camera_offset: Point,
}

pub struct AoCoordinator {
    options: AoCoordinatorOptions,
    avg_offset: Option<Point>,
    bump_in_progress: bool,
    bump_step_weight: f64,
    bump_start: Option<Instant>,
    bump_warned: bool,
}

impl AoCoordinator {
    pub fn new(options: AoCoordinatorOptions) -> Self {
        Self {
            options,
            avg_offset: None,
            bump_in_progress: false,
            bump_step_weight: 1.0,
            bump_start: None,
            bump_warned: false,
        }
    }

    pub fn bump_in_progress(&self) -> bool {
        self.bump_in_progress
    }

    pub fn reset(&mut self) {
        self.avg_offset = None;
        self.bump_in_progress = false;
        self.bump_step_weight = 1.0;
        self.bump_start = None;
        self.bump_warned = false;
    }

    /// Called once per guide frame after the AO has received its
    /// correction. `ao_offset` is the AO's current centered position
    /// (axis units); `ao_travel` is its per-axis travel limit (same
    /// units); `ao_limit_hit` is whether the AO's own move this frame
    /// was truncated by its mechanical limit; `camera_offset` and
    /// `ao_rate` (px per axis-unit) are used for the gentle-bump vector.
    /// Returns a bump to schedule on the mount, if any, and whether the
    /// coordinator wants a warning alert raised.
    pub fn update(
        &mut self,
        now: Instant,
        ao_offset: Point,
        ao_travel: f64,
        ao_limit_hit: bool,
        camera_offset: Point,
        ao_rate_x: f64,
        ao_rate_y: f64,
        mount_busy: bool,
        settling: bool,
    ) -> (Option<BumpMove>, bool) {
        self.update_average(ao_offset);

        let avg = self.avg_offset.unwrap_or(Point::new(0.0, 0.0));
        let bump_pos_1 = ao_travel * self.options.bump_threshold_pct / 100.0;
        let bump_pos_2 = ao_travel * (100.0 + self.options.bump_threshold_pct) / 200.0;
        let is_outside = avg.x.abs() > bump_pos_1 || avg.y.abs() > bump_pos_1;
        let far_outside = avg.x.abs() > bump_pos_2 || avg.y.abs() > bump_pos_2;

        if is_outside && self.bump_in_progress && !mount_busy {
            if far_outside {
                self.bump_step_weight += 1.0;
            } else {
                self.bump_step_weight += 1.0 / 6.0;
            }
            let max_weight = self.max_weight();
            if self.bump_step_weight > max_weight {
                self.bump_step_weight = max_weight;
            }
        }

        if !is_outside && self.bump_step_weight > 1.0 {
            self.bump_step_weight = (self.bump_step_weight * 0.5).max(1.0);
        }

        let mut warn = false;
        if self.bump_in_progress && !self.bump_warned {
            if let Some(start) = self.bump_start {
                if now.duration_since(start) > BUMP_WARN_TIME {
                    warn = true;
                    self.bump_warned = true;
                }
            }
        }

        if is_outside && !self.bump_in_progress {
            self.bump_in_progress = true;
            self.bump_start = Some(now);
            self.bump_warned = false;
        }

        if !is_outside && self.bump_in_progress {
            let tolerance = ao_travel * self.options.center_tolerance_pct / 100.0;
            if avg.x * avg.x + avg.y * avg.y <= tolerance * tolerance {
                self.bump_in_progress = false;
            }
        }

        if !self.bump_in_progress || mount_busy {
            return (None, warn);
        }

        let bump = if ao_limit_hit {
            self.limit_hit_bump(camera_offset)
        } else {
            self.gentle_bump(avg, ao_rate_x, ao_rate_y, camera_offset, settling)
        };

        (bump, warn)
    }

    fn update_average(&mut self, offset: Point) {
        self.avg_offset = Some(match self.avg_offset {
            Some(avg) => Point::new(
                avg.x + EMA_ALPHA * (offset.x - avg.x),
                avg.y + EMA_ALPHA * (offset.y - avg.y),
            ),
            None => offset,
        });
    }

    fn max_weight(&self) -> f64 {
        let move_per_unit_weight = self.options.bump_max_steps_per_cycle;
        let max_move_px = self.options.search_region_px * 0.5;
        if move_per_unit_weight <= 0.0 {
            return 1.0;
        }
        (max_move_px / move_per_unit_weight).max(1.0)
    }

    /// The gentle per-cycle correction: a camera-plane vector opposing
    /// the AO's average offset, scaled by rate and bump weight, clamped
    /// to both the per-cycle max and the star's own camera offset
    /// magnitude (never overshoot the star).
    fn gentle_bump(&self, avg: Point, rate_x: f64, rate_y: f64, camera_offset: Point, settling: bool) -> Option<BumpMove> {
        let vector_x = -avg.x * rate_x;
        let vector_y = -avg.y * rate_y;
        let len = (vector_x * vector_x + vector_y * vector_y).sqrt();
        if len < 1e-9 {
            return None;
        }

        let mut weight = self.bump_step_weight;
        if settling && weight < SETTLING_BOOST_WEIGHT {
            weight = SETTLING_BOOST_WEIGHT;
        }

        let max_bump_x = rate_x.abs() * self.options.bump_max_steps_per_cycle * weight;
        let max_bump_y = rate_y.abs() * self.options.bump_max_steps_per_cycle * weight;
        let x_bump = vector_x * max_bump_x / len;
        let y_bump = vector_y * max_bump_y / len;

        let bump_mag2 = x_bump * x_bump + y_bump * y_bump;
        let max_dist2 = camera_offset.x * camera_offset.x + camera_offset.y * camera_offset.y;
        let (x_bump, y_bump) = if bump_mag2 > max_dist2 && max_dist2 > 0.0 {
            let scale = (max_dist2 / bump_mag2).sqrt();
            (x_bump * scale, y_bump * scale)
        } else {
            (x_bump, y_bump)
        };

        Some(BumpMove { camera_offset: Point::new(x_bump, y_bump) })
    }

    /// `ao-limit-reached` override (spec.md §4.6 step 5 / §7): 70% of
    /// the star's camera offset, clamped to half the search region.
    fn limit_hit_bump(&self, camera_offset: Point) -> Option<BumpMove> {
        if !camera_offset.is_valid() {
            return None;
        }
        let mut x = camera_offset.x * 0.70;
        let mut y = camera_offset.y * 0.70;
        let max_dist = self.options.search_region_px * 0.5;
        let d2 = x * x + y * y;
        let max2 = max_dist * max_dist;
        if d2 > max2 && d2 > 0.0 {
            let scale = (max2 / d2).sqrt();
            x *= scale;
            y *= scale;
        }
        Some(BumpMove { camera_offset: Point::new(x, y) })
    }
}

/// Issues a scheduled bump on the slow mount, respecting `is_busy` per
/// the concurrency model of spec.md §5: a bump is only ever issued if
/// the mount is currently idle.
pub fn issue_bump(mount: &mut Mount, bump: BumpMove) -> crate::error::GuideResult<()> {
    if mount.is_busy() {
        return Ok(());
    }
    mount.move_offset(bump.camera_offset, MoveOptions::direct()).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_starts_once_outside_threshold() {
        let mut coord = AoCoordinator::new(AoCoordinatorOptions::default());
        let now = Instant::now();
        let (bump, _warn) = coord.update(
            now,
            Point::new(45.0, 0.0),
            50.0,
            false,
            Point::new(2.0, 0.0),
            0.1,
            0.1,
            false,
            false,
        );
        assert!(coord.bump_in_progress());
        assert!(bump.is_some());
    }

    #[test]
    fn test_bump_clears_once_centered() {
        let mut coord = AoCoordinator::new(AoCoordinatorOptions::default());
        let now = Instant::now();
        coord.update(now, Point::new(45.0, 0.0), 50.0, false, Point::new(2.0, 0.0), 0.1, 0.1, false, false);
        assert!(coord.bump_in_progress());

        // Feed several centered samples so the EMA settles near zero.
        let mut t = now;
        for _ in 0..20 {
            t += Duration::from_millis(500);
            coord.update(t, Point::new(0.0, 0.0), 50.0, false, Point::new(0.1, 0.0), 0.1, 0.1, false, false);
        }
        assert!(!coord.bump_in_progress());
    }

    #[test]
    fn test_ao_limit_hit_overrides_gentle_bump() {
        let coord = AoCoordinator::new(AoCoordinatorOptions::default());
        let bump = coord.limit_hit_bump(Point::new(10.0, 0.0)).unwrap();
        assert!((bump.camera_offset.x - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_bump_weight_escalates_far_outside() {
        let mut coord = AoCoordinator::new(AoCoordinatorOptions::default());
        let now = Instant::now();
        coord.update(now, Point::new(48.0, 0.0), 50.0, false, Point::new(2.0, 0.0), 0.1, 0.1, false, false);
        let before = coord.bump_step_weight;
        coord.update(now + Duration::from_millis(500), Point::new(49.0, 0.0), 50.0, false, Point::new(2.0, 0.0), 0.1, 0.1, false, false);
        assert!(coord.bump_step_weight >= before);
    }

    #[test]
    fn test_bump_warns_after_timeout() {
        let mut coord = AoCoordinator::new(AoCoordinatorOptions::default());
        let now = Instant::now();
        coord.update(now, Point::new(45.0, 0.0), 50.0, false, Point::new(2.0, 0.0), 0.1, 0.1, false, false);
        let (_, warn_early) = coord.update(now + Duration::from_secs(10), Point::new(45.0, 0.0), 50.0, false, Point::new(2.0, 0.0), 0.1, 0.1, false, false);
        assert!(!warn_early);
        let (_, warn_late) = coord.update(now + Duration::from_secs(241), Point::new(45.0, 0.0), 50.0, false, Point::new(2.0, 0.0), 0.1, 0.1, false, false);
        assert!(warn_late);
    }
}

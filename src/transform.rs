//! Coordinate transform between camera pixels and mount axes, and the
//! non-recalibrating adjustments applied when pier side, declination,
//! binning, or field rotation changes between calibration and the
//! current frame.

use crate::geometry::{Calibration, GuideParity, Point, PierSide};

/// Projects a camera-plane offset onto the two calibrated mount axes, and
/// the inverse. Built once per guiding session from the (possibly
/// pier/dec/binning/rotator-adjusted) calibration in effect.
#[derive(Debug, Clone)]
pub struct Transform {
    x_angle: f64,
    y_angle: f64,
    x_rate: f64,
    y_rate: f64,
}

impl Transform {
    pub fn from_calibration(calib: &Calibration) -> Self {
        Self {
            x_angle: calib.x_angle,
            y_angle: calib.y_angle,
            x_rate: calib.x_rate,
            y_rate: calib.y_rate,
        }
    }

    /// Rotates a camera-plane offset onto the two calibrated axes, in
    /// pixel-equivalent units (no rate conversion yet). This is the
    /// scale the one-dimensional guide algorithms of `algorithm.rs`
    /// operate in, matching `GuideAlgorithm::result`'s `error_pixels`
    /// contract.
    pub fn camera_to_axis_pixels(&self, offset: Point) -> (f64, f64) {
        if !offset.is_valid() {
            return (0.0, 0.0);
        }
        let cos_x = self.x_angle.cos();
        let sin_x = self.x_angle.sin();
        let cos_y = self.y_angle.cos();
        let sin_y = self.y_angle.sin();

        // Solve [cos_x sin_x; cos_y sin_y] * [x; y] = offset for the
        // axis-aligned components.
        let det = cos_x * sin_y - sin_x * cos_y;
        if det.abs() < 1e-12 {
            return (0.0, 0.0);
        }
        let primary = (sin_y * offset.x - cos_y * offset.y) / det;
        let secondary = (-sin_x * offset.x + cos_x * offset.y) / det;
        (primary, secondary)
    }

    /// Converts axis-pixel distances to pulse durations (ms for a Scope,
    /// step counts for a StepGuider) via each axis's calibrated rate.
    pub fn axis_pixels_to_pulse(&self, primary_px: f64, secondary_px: f64) -> (f64, f64) {
        let ra_pulse = if self.x_rate.abs() > 1e-12 { primary_px / self.x_rate } else { 0.0 };
        let dec_pulse = if self.y_rate.abs() > 1e-12 { secondary_px / self.y_rate } else { 0.0 };
        (ra_pulse, dec_pulse)
    }

    /// Camera-plane offset (pixels) -> (primary-axis pulse ms, secondary-axis pulse ms).
    pub fn camera_to_mount(&self, offset: Point) -> (f64, f64) {
        let (x_px, y_px) = self.camera_to_axis_pixels(offset);
        self.axis_pixels_to_pulse(x_px, y_px)
    }

    /// Inverse of `axis_pixels_to_pulse`.
    pub fn pulse_to_axis_pixels(&self, ra_pulse_ms: f64, dec_pulse_ms: f64) -> (f64, f64) {
        (ra_pulse_ms * self.x_rate, dec_pulse_ms * self.y_rate)
    }

    /// Inverse of `camera_to_axis_pixels`.
    pub fn axis_pixels_to_camera(&self, primary_px: f64, secondary_px: f64) -> Point {
        let x = primary_px * self.x_angle.cos() + secondary_px * self.y_angle.cos();
        let y = primary_px * self.x_angle.sin() + secondary_px * self.y_angle.sin();
        Point::new(x, y)
    }

    /// Inverse of `camera_to_mount`: pulse durations on each axis back to
    /// the camera-plane displacement they should produce.
    pub fn mount_to_camera(&self, ra_pulse_ms: f64, dec_pulse_ms: f64) -> Point {
        let (x_px, y_px) = self.pulse_to_axis_pixels(ra_pulse_ms, dec_pulse_ms);
        self.axis_pixels_to_camera(x_px, y_px)
    }
}

/// Produces a working calibration for the current frame by adjusting the
/// stored (as-calibrated) calibration for whatever has changed since it
/// was measured, without triggering a full recalibration.
pub fn adjust_calibration(
    stored: &Calibration,
    current_pier_side: PierSide,
    current_declination: Option<f64>,
    current_binning: u32,
    current_rotator_angle: Option<f64>,
) -> Calibration {
    let mut adjusted = stored.clone();

    adjust_for_pier_flip(&mut adjusted, current_pier_side);
    adjust_for_declination(&mut adjusted, current_declination);
    adjust_for_binning(&mut adjusted, current_binning);
    adjust_for_rotator(&mut adjusted, current_rotator_angle);

    adjusted
}

/// A pier flip reverses the sign of the on-sensor motion the mount
/// produces for a given command on the axis whose parity is not
/// `Unchanged`. Rotating that axis's angle by pi reproduces the flip
/// without remeasuring it.
fn adjust_for_pier_flip(calib: &mut Calibration, current_pier_side: PierSide) {
    if calib.pier_side == PierSide::Unknown || current_pier_side == PierSide::Unknown {
        return;
    }
    if calib.pier_side == current_pier_side {
        return;
    }
    if calib.ra_parity != GuideParity::Unchanged {
        calib.x_angle = crate::math::normalize_angle(calib.x_angle + std::f64::consts::PI);
    }
    if calib.dec_parity != GuideParity::Unchanged {
        calib.y_angle = crate::math::normalize_angle(calib.y_angle + std::f64::consts::PI);
    }
    calib.pier_side = current_pier_side;
}

/// The primary (RA) axis rate was measured at the calibration
/// declination; sky motion per unit pulse scales with `cos(dec)`, so the
/// effective pixel rate is rescaled to the current declination rather
/// than remeasured.
fn adjust_for_declination(calib: &mut Calibration, current_declination: Option<f64>) {
    let (Some(cal_dec), Some(cur_dec)) = (calib.declination, current_declination) else {
        return;
    };
    let cos_cal = cal_dec.cos();
    let cos_cur = cur_dec.cos();
    if cos_cal.abs() < 1e-6 {
        return;
    }
    calib.x_rate *= cos_cur / cos_cal;
    calib.declination = Some(cur_dec);
}

/// A binning change scales how many pixels a given sky distance spans;
/// rates are in pixels per unit pulse, so they scale inversely with the
/// binning ratio.
fn adjust_for_binning(calib: &mut Calibration, current_binning: u32) {
    if current_binning == 0 || calib.binning == 0 || current_binning == calib.binning {
        return;
    }
    let ratio = calib.binning as f64 / current_binning as f64;
    calib.x_rate *= ratio;
    calib.y_rate *= ratio;
    calib.binning = current_binning;
}

/// Field rotation rotates both calibrated axis angles by the same delta;
/// rates are orientation-independent and are left untouched.
fn adjust_for_rotator(calib: &mut Calibration, current_rotator_angle: Option<f64>) {
    let (Some(cal_angle), Some(cur_angle)) = (calib.rotator_angle, current_rotator_angle) else {
        return;
    };
    let delta = cur_angle - cal_angle;
    if delta.abs() < 1e-9 {
        return;
    }
    calib.x_angle = crate::math::normalize_angle(calib.x_angle + delta);
    calib.y_angle = crate::math::normalize_angle(calib.y_angle + delta);
    calib.rotator_angle = Some(cur_angle);
}

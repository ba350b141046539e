//! Point, normalized-angle helpers, and the calibration record.

use std::ops::{Add, Sub, Mul, Div};

/// A 2-D point in camera or mount coordinates. Arithmetic on an invalid
/// point always yields an invalid point.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    valid: bool,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, valid: true }
    }

    pub const fn invalid() -> Self {
        Self { x: 0.0, y: 0.0, valid: false }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn distance(&self, other: &Point) -> f64 {
        if !self.valid || !other.valid {
            return f64::NAN;
        }
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        f64::sqrt(dx * dx + dy * dy)
    }

    /// Distance from the origin.
    pub fn magnitude(&self) -> f64 {
        self.distance(&Point::new(0.0, 0.0))
    }

    pub fn angle_to(&self, other: &Point) -> f64 {
        if !self.valid || !other.valid {
            return f64::NAN;
        }
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        f64::atan2(dy, dx)
    }
}

impl Add for Point {
    type Output = Point;
    fn add(self, rhs: Point) -> Point {
        if !self.valid || !rhs.valid { return Point::invalid(); }
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Point {
    type Output = Point;
    fn sub(self, rhs: Point) -> Point {
        if !self.valid || !rhs.valid { return Point::invalid(); }
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f64> for Point {
    type Output = Point;
    fn mul(self, k: f64) -> Point {
        if !self.valid { return Point::invalid(); }
        Point::new(self.x * k, self.y * k)
    }
}

impl Div<f64> for Point {
    type Output = Point;
    fn div(self, k: f64) -> Point {
        if !self.valid { return Point::invalid(); }
        Point::new(self.x / k, self.y / k)
    }
}

#[test]
fn test_point_invalid_propagates() {
    let a = Point::new(1.0, 2.0);
    let b = Point::invalid();
    assert!(!(a + b).is_valid());
    assert!(!(a - b).is_valid());
    assert!((b * 2.0).is_valid() == false);
}

#[test]
fn test_point_distance_and_angle() {
    let a = Point::new(0.0, 0.0);
    let b = Point::new(3.0, 4.0);
    assert!((a.distance(&b) - 5.0).abs() < 1e-9);
    assert!((a.angle_to(&b) - f64::atan2(4.0, 3.0)).abs() < 1e-9);
}

/// Side of the meridian the mount is on at calibration time, or the
/// currently observed side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PierSide {
    East,
    West,
    Unknown,
}

impl PierSide {
    pub fn opposite(self) -> PierSide {
        match self {
            PierSide::East => PierSide::West,
            PierSide::West => PierSide::East,
            PierSide::Unknown => PierSide::Unknown,
        }
    }
}

/// Sign relationship between a commanded declination direction and the
/// resulting on-sensor motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum GuideParity {
    Even,
    Odd,
    Unknown,
    Unchanged,
}

impl GuideParity {
    /// Toggle even/odd; `Unknown`/`Unchanged` pass through unaffected.
    pub fn toggled(self) -> GuideParity {
        match self {
            GuideParity::Even => GuideParity::Odd,
            GuideParity::Odd => GuideParity::Even,
            other => other,
        }
    }
}

/// The mapping from mount/AO command to sensor-plane motion, learned by
/// calibration (see `calibration_state`) and adjusted (not recalibrated)
/// on pier flip, declination change, binning change, and rotator change.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Calibration {
    /// Camera-to-mount axis orientation for the primary (RA/X) axis, radians.
    pub x_angle: f64,
    /// Camera-to-mount axis orientation for the secondary (Dec/Y) axis, radians.
    pub y_angle: f64,
    /// Pixels per millisecond of pulse on the primary axis.
    pub x_rate: f64,
    /// Pixels per millisecond of pulse on the secondary axis.
    pub y_rate: f64,
    /// Declination at calibration time, radians. `None` if unknown.
    pub declination: Option<f64>,
    pub pier_side: PierSide,
    pub ra_parity: GuideParity,
    pub dec_parity: GuideParity,
    /// Rotator angle at calibration time, radians. `None` if unknown.
    pub rotator_angle: Option<f64>,
    pub binning: u32,
    pub is_valid: bool,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            x_angle: 0.0,
            y_angle: 0.0,
            x_rate: 0.0,
            y_rate: 0.0,
            declination: None,
            pier_side: PierSide::Unknown,
            ra_parity: GuideParity::Unknown,
            dec_parity: GuideParity::Unknown,
            rotator_angle: None,
            binning: 1,
            is_valid: false,
        }
    }
}

impl Calibration {
    /// `normalize(x_angle - y_angle + pi/2)`: zero when the two axes are
    /// perfectly orthogonal.
    pub fn y_angle_error(&self) -> f64 {
        crate::math::normalize_angle(self.x_angle - self.y_angle + std::f64::consts::FRAC_PI_2)
    }
}

/// Declination at or above which the Dec recovery step of Scope
/// calibration is skipped.
pub const DECLINATION_SAFETY_LIMIT: f64 = 60.0_f64 * std::f64::consts::PI / 180.0;

#[test]
fn test_guide_parity_toggle() {
    assert_eq!(GuideParity::Even.toggled(), GuideParity::Odd);
    assert_eq!(GuideParity::Odd.toggled(), GuideParity::Even);
    assert_eq!(GuideParity::Unknown.toggled(), GuideParity::Unknown);
}

#[test]
fn test_pier_side_opposite() {
    assert_eq!(PierSide::East.opposite(), PierSide::West);
    assert_eq!(PierSide::West.opposite(), PierSide::East);
}

#![allow(dead_code)]

//! Small numeric primitives shared by the star detector, the quality
//! gates and the calibration line fit.

#[inline(always)]
pub fn cmp_f64(v1: &f64, v2: &f64) -> core::cmp::Ordering {
    if      *v1 < *v2 { core::cmp::Ordering::Less }
    else if *v1 > *v2 { core::cmp::Ordering::Greater }
    else              { core::cmp::Ordering::Equal }
}

#[inline(always)]
pub fn median3<T: Ord + Copy>(a: T, b: T, c: T) -> T {
    T::max(T::min(a, b), T::min(c, T::max(a, b)))
}

#[test]
fn test_median3() {
    assert_eq!(median3(1, 2, 3), 2);
    assert_eq!(median3(2, 3, 1), 2);
    assert_eq!(median3(3, 1, 2), 2);
    assert_eq!(median3(1, 3, 2), 2);
    assert_eq!(median3(3, 2, 1), 2);
}

pub fn median5<T: core::cmp::Ord + Copy>(a: T, b: T, c: T, d: T, e: T) -> T {
    let f = T::max(T::min(a, b), T::min(c, d));
    let g = T::min(T::max(a, b), T::max(c, d));
    median3(e, f, g)
}

#[test]
fn test_median5() {
    use itertools::Itertools;
    for p in [1, 2, 3, 4, 5].iter().permutations(5) {
        let m = median5(*p[0], *p[1], *p[2], *p[3], *p[4]);
        assert_eq!(m, 3);
    }
}

/// Median of a mutable slice of `f64` values (odd-length convention: the
/// element at the midpoint after a partial sort). Used for the mass
/// checker's running-median window.
pub fn median_f64(values: &mut [f64]) -> f64 {
    let pos = values.len() / 2;
    *values.select_nth_unstable_by(pos, cmp_f64).1
}

#[test]
fn test_median_f64() {
    let mut v = vec![5.0, 1.0, 3.0, 2.0, 4.0];
    assert_eq!(median_f64(&mut v), 3.0);
}

#[inline(always)]
pub fn linear_interpolate(x: f64, x1: f64, x2: f64, y1: f64, y2: f64) -> f64 {
    (x - x1) * (y2 - y1) / (x2 - x1) + y1
}

/// Normalize an angle in radians into `(-pi, pi]`.
pub fn normalize_angle(angle: f64) -> f64 {
    use std::f64::consts::PI;
    let mut a = angle % (2.0 * PI);
    if a <= -PI { a += 2.0 * PI; }
    if a > PI { a -= 2.0 * PI; }
    a
}

#[test]
fn test_normalize_angle() {
    use std::f64::consts::PI;
    assert!((normalize_angle(3.0 * PI) - PI).abs() < 1e-9);
    assert!((normalize_angle(-3.0 * PI) - PI).abs() < 1e-9);
    assert!((normalize_angle(0.5 * PI) - 0.5 * PI).abs() < 1e-9);
}

pub fn linear_solve2(
    a11: f64, a12: f64, b1: f64,
    a21: f64, a22: f64, b2: f64,
) -> Option<(f64, f64)> {
    let det = a11 * a22 - a12 * a21;
    if det == 0.0 {
        return None;
    }
    let det1 = b1 * a22 - a12 * b2;
    let det2 = a11 * b2 - b1 * a21;
    Some((det1 / det, det2 / det))
}

#[test]
fn test_linear_solve2() {
    let (x, y) = linear_solve2(
        3.0,  2.0, 16.0,
        2.0, -1.0,  6.0,
    ).unwrap();
    assert!((x - 4.0).abs() < 0.01);
    assert!((y - 2.0).abs() < 0.01);
}

/// Ordinary least-squares fit of `y = slope*x + intercept`.
pub fn linear_regression(x: &[f64], y: &[f64]) -> Option<(f64, f64)> {
    if x.len() != y.len() || x.is_empty() {
        return None;
    }
    let n = x.len() as f64;
    let sum_x: f64 = x.iter().sum();
    let sum_y: f64 = y.iter().sum();
    let sum_xy: f64 = x.iter().zip(y.iter()).map(|(&xi, &yi)| xi * yi).sum();
    let sum_x_sq: f64 = x.iter().map(|&xi| xi * xi).sum();
    let denominator = n * sum_x_sq - sum_x * sum_x;
    if denominator == 0.0 {
        return None;
    }
    let slope = (n * sum_xy - sum_x * sum_y) / denominator;
    let intercept = (sum_y - slope * sum_x) / n;
    Some((slope, intercept))
}

#[test]
fn test_linear_regression() {
    let x = [0.0, 1.0, 2.0, 3.0];
    let y = [1.0, 3.0, 5.0, 7.0];
    let (slope, intercept) = linear_regression(&x, &y).unwrap();
    assert!((slope - 2.0).abs() < 1e-9);
    assert!((intercept - 1.0).abs() < 1e-9);
}

/// Circular mean of a set of angles (radians), used when averaging
/// calibration-step bearings.
pub fn angles_mean(angles: &[f64]) -> f64 {
    let s: f64 = angles.iter().map(|a| f64::sin(*a)).sum();
    let c: f64 = angles.iter().map(|a| f64::cos(*a)).sum();
    f64::atan2(s, c)
}

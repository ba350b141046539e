//! Star detector: sub-pixel centroiding of a single star around a seed
//! pixel (`find_star`), and whole-frame guide-star candidate selection
//! (`auto_find`).

use crate::frame::Frame;
use crate::geometry::Point;
use crate::math::{cmp_f64, median_f64};

/// Why a detection attempt did not return a usable position. `Ok`'s
/// position is the only one considered defined — every other variant
/// leaves the star's position undefined, per the data-model invariant.
#[derive(Debug, Clone, PartialEq)]
pub enum FindResult {
    Ok,
    Saturated,
    LowSnr,
    LowMass,
    LowHfd,
    HighHfd,
    TooNearEdge,
    MassChanged,
    Error(String),
}

impl FindResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, FindResult::Ok)
    }
}

#[derive(Debug, Clone)]
pub struct Star {
    pub position: Point,
    pub mass: f64,
    pub snr: f64,
    pub hfd: f64,
    pub saturated: bool,
    pub result: FindResult,
}

impl Star {
    fn failed(result: FindResult) -> Star {
        Star {
            position: Point::invalid(),
            mass: 0.0,
            snr: 0.0,
            hfd: 0.0,
            saturated: matches!(result, FindResult::Saturated),
            result,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FindStarParams {
    pub search_region_half: i32,
    pub min_hfd: f64,
    pub max_hfd: f64,
    pub saturation_level: u16,
    pub min_snr: f64,
    pub min_mass: f64,
}

impl Default for FindStarParams {
    fn default() -> Self {
        Self {
            search_region_half: 15,
            min_hfd: 1.5,
            max_hfd: 24.0,
            saturation_level: 64000,
            min_snr: 6.0,
            min_mass: 100.0,
        }
    }
}

/// Smallest half-window PHD is willing to search: below this, background
/// and centroid estimates are too noisy to trust.
const MIN_WINDOW_HALF: i32 = 4;
/// Centroid/mass neighborhood half-width around the peak pixel (9x9 box).
const CENTROID_HALF: i32 = 4;

struct Window {
    x0: i32,
    y0: i32,
    x1: i32,
    y1: i32,
}

impl Window {
    fn around(cx: i32, cy: i32, half: i32, width: i32, height: i32) -> Window {
        Window {
            x0: i32::max(0, cx - half),
            y0: i32::max(0, cy - half),
            x1: i32::min(width - 1, cx + half),
            y1: i32::min(height - 1, cy + half),
        }
    }

    fn is_too_small(&self) -> bool {
        (self.x1 - self.x0) < 2 * MIN_WINDOW_HALF || (self.y1 - self.y0) < 2 * MIN_WINDOW_HALF
    }

    fn touches(&self, x: i32, y: i32, width: i32, height: i32) -> bool {
        let on_image_edge = self.x0 == 0 || self.y0 == 0 || self.x1 == width - 1 || self.y1 == height - 1;
        let near_window_edge =
            x <= self.x0 + 1 || x >= self.x1 - 1 || y <= self.y0 + 1 || y >= self.y1 - 1;
        near_window_edge && on_image_edge
    }
}

/// Robust background estimate: median of the window's outer annulus
/// (everything outside the inner half-radius), smoothed by a median-of-3
/// pass over the sorted samples' neighborhood to suppress a single hot
/// pixel skewing the annulus median.
fn estimate_background(frame: &Frame, win: &Window, cx: i32, cy: i32, inner_half: i32) -> (f64, f64) {
    let mut samples = Vec::new();
    for y in win.y0..=win.y1 {
        for x in win.x0..=win.x1 {
            if (x - cx).abs() <= inner_half && (y - cy).abs() <= inner_half {
                continue;
            }
            if let Some(v) = frame.get(x as isize, y as isize) {
                samples.push(v as f64);
            }
        }
    }
    if samples.is_empty() {
        return (0.0, 1.0);
    }
    let bg = median_f64(&mut samples);
    let variance = samples.iter().map(|v| (v - bg) * (v - bg)).sum::<f64>() / samples.len() as f64;
    (bg, variance.sqrt().max(1.0))
}

fn find_peak(frame: &Frame, win: &Window) -> (i32, i32, u16) {
    let mut best = (win.x0, win.y0, 0u16);
    for y in win.y0..=win.y1 {
        for x in win.x0..=win.x1 {
            let v = frame.get_unchecked(x as usize, y as usize);
            if v > best.2 {
                best = (x, y, v);
            }
        }
    }
    best
}

fn any_saturated(frame: &Frame, win: &Window, saturation_level: u16) -> bool {
    for y in win.y0..=win.y1 {
        for x in win.x0..=win.x1 {
            if frame.get_unchecked(x as usize, y as usize) >= saturation_level {
                return true;
            }
        }
    }
    false
}

/// `find_star` contract of §4.1: search a window around the seed pixel
/// and return a sub-pixel centroid, mass, SNR, HFD, and classification.
pub fn find_star(frame: &Frame, seed_x: f64, seed_y: f64, params: &FindStarParams) -> Star {
    let width = frame.width as i32;
    let height = frame.height as i32;
    let half = params.search_region_half;

    let mut win = Window::around(seed_x.round() as i32, seed_y.round() as i32, half, width, height);
    if win.is_too_small() {
        return Star::failed(FindResult::TooNearEdge);
    }

    let (mut peak_x, mut peak_y, mut peak_v) = find_peak(frame, &win);
    if win.touches(peak_x, peak_y, width, height) {
        // Retry once with the window re-centered on the peak.
        win = Window::around(peak_x, peak_y, half, width, height);
        if win.is_too_small() {
            return Star::failed(FindResult::TooNearEdge);
        }
        let retried = find_peak(frame, &win);
        peak_x = retried.0;
        peak_y = retried.1;
        peak_v = retried.2;
        if win.touches(peak_x, peak_y, width, height) {
            return Star::failed(FindResult::TooNearEdge);
        }
    }

    if any_saturated(frame, &win, params.saturation_level) {
        return Star::failed(FindResult::Saturated);
    }

    let (bg, sigma_bg) = estimate_background(frame, &win, peak_x, peak_y, half / 2);

    let cbox = Window::around(peak_x, peak_y, CENTROID_HALF, width, height);
    let mut x_sum = 0.0_f64;
    let mut y_sum = 0.0_f64;
    let mut w_sum = 0.0_f64;
    for y in cbox.y0..=cbox.y1 {
        for x in cbox.x0..=cbox.x1 {
            let v = frame.get_unchecked(x as usize, y as usize) as f64;
            let w = (v - bg).max(0.0);
            x_sum += w * x as f64;
            y_sum += w * y as f64;
            w_sum += w;
        }
    }
    if w_sum <= 0.0 || peak_v as f64 <= bg {
        return Star::failed(FindResult::LowMass);
    }
    let cx = x_sum / w_sum;
    let cy = y_sum / w_sum;

    // Hot-pixel reject: centroid lands on exact integer coordinates.
    if (cx - cx.round()).abs() < 1e-6 && (cy - cy.round()).abs() < 1e-6 {
        return Star::failed(FindResult::LowHfd);
    }

    // Mass over the wider search window (background-subtracted, clamped).
    let mut mass = 0.0_f64;
    let mut n_pix = 0usize;
    for y in win.y0..=win.y1 {
        for x in win.x0..=win.x1 {
            let v = frame.get_unchecked(x as usize, y as usize) as f64;
            mass += (v - bg).max(0.0);
            n_pix += 1;
        }
    }
    if mass <= 0.0 {
        return Star::failed(FindResult::LowMass);
    }

    let snr = mass / (sigma_bg * (n_pix as f64).sqrt());

    let hfd = half_flux_diameter(frame, &win, cx, cy, bg, mass);

    let result = if any_saturated(frame, &win, params.saturation_level) {
        FindResult::Saturated
    } else if snr < params.min_snr {
        FindResult::LowSnr
    } else if mass < params.min_mass {
        FindResult::LowMass
    } else if hfd < params.min_hfd {
        FindResult::LowHfd
    } else if hfd > params.max_hfd {
        FindResult::HighHfd
    } else {
        FindResult::Ok
    };

    if !result.is_ok() {
        return Star::failed(result);
    }

    Star {
        position: Point::new(cx, cy),
        mass,
        snr,
        hfd,
        saturated: false,
        result,
    }
}

/// Diameter at which the cumulative background-subtracted flux, summed
/// in increasing order of distance from the centroid, reaches half of
/// `mass`.
fn half_flux_diameter(frame: &Frame, win: &Window, cx: f64, cy: f64, bg: f64, mass: f64) -> f64 {
    let mut samples: Vec<(f64, f64)> = Vec::new();
    for y in win.y0..=win.y1 {
        for x in win.x0..=win.x1 {
            let v = frame.get_unchecked(x as usize, y as usize) as f64;
            let flux = (v - bg).max(0.0);
            if flux <= 0.0 {
                continue;
            }
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            let r = (dx * dx + dy * dy).sqrt();
            samples.push((r, flux));
        }
    }
    samples.sort_by(cmp_f64_pair);
    let half_mass = 0.5 * mass;
    let mut acc = 0.0;
    for (r, flux) in &samples {
        acc += flux;
        if acc >= half_mass {
            return 2.0 * r;
        }
    }
    samples.last().map(|(r, _)| 2.0 * r).unwrap_or(0.0)
}

fn cmp_f64_pair(a: &(f64, f64), b: &(f64, f64)) -> core::cmp::Ordering {
    cmp_f64(&a.0, &b.0)
}

/// One candidate produced by whole-frame auto-selection: position plus
/// the SNR it was ranked by.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub position: Point,
    pub snr: f64,
}

pub struct AutoFindResult {
    pub seed: Candidate,
    pub secondaries: Vec<Candidate>,
}

/// `auto_find` contract of §4.1: score every pixel, reject border and
/// mutually-too-close candidates, validate survivors with `find_star`,
/// and return the brightest as the seed plus up to `max_candidates - 1`
/// secondaries sorted by SNR.
pub fn auto_find(
    frame: &Frame,
    edge_allowance: i32,
    search_region_half: i32,
    max_candidates: usize,
    params: &FindStarParams,
) -> Option<AutoFindResult> {
    let width = frame.width as i32;
    let height = frame.height as i32;

    // Robust noise floor for the whole frame (median + MAD), used as the
    // peak-detection threshold.
    let mut all: Vec<f64> = frame.pixels.iter().map(|v| *v as f64).collect();
    if all.is_empty() {
        return None;
    }
    let median = median_f64(&mut all);
    let mut deviations: Vec<f64> = all.iter().map(|v| (v - median).abs()).collect();
    let mad = median_f64(&mut deviations).max(1.0);
    let threshold = median + 8.0 * mad;

    // Local-maxima scan: a pixel strictly brighter than its 4-neighbors
    // and above threshold is a raw candidate.
    let mut raw: Vec<(i32, i32, f64)> = Vec::new();
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let v = frame.get_unchecked(x as usize, y as usize) as f64;
            if v < threshold {
                continue;
            }
            let left = frame.get_unchecked((x - 1) as usize, y as usize) as f64;
            let right = frame.get_unchecked((x + 1) as usize, y as usize) as f64;
            let up = frame.get_unchecked(x as usize, (y - 1) as usize) as f64;
            let down = frame.get_unchecked(x as usize, (y + 1) as usize) as f64;
            if v >= left && v >= right && v >= up && v >= down {
                raw.push((x, y, v));
            }
        }
    }

    raw.retain(|&(x, y, _)| {
        x >= edge_allowance
            && y >= edge_allowance
            && x < width - edge_allowance
            && y < height - edge_allowance
    });

    raw.sort_by(|a, b| cmp_f64(&b.2, &a.2));

    let min_spacing = search_region_half as f64 * std::f64::consts::SQRT_2 + 2.0;
    let mut accepted: Vec<(i32, i32, f64)> = Vec::new();
    'candidates: for cand in raw {
        for &(ax, ay, _) in &accepted {
            let dx = (cand.0 - ax) as f64;
            let dy = (cand.1 - ay) as f64;
            if (dx * dx + dy * dy).sqrt() < min_spacing {
                continue 'candidates;
            }
        }
        accepted.push(cand);
        if accepted.len() >= max_candidates * 4 {
            break;
        }
    }

    let mut validated: Vec<Candidate> = Vec::new();
    for (x, y, _) in accepted {
        let star = find_star(frame, x as f64, y as f64, params);
        if star.result.is_ok() {
            validated.push(Candidate { position: star.position, snr: star.snr });
        }
    }

    validated.sort_by(|a, b| cmp_f64(&b.snr, &a.snr));
    if validated.is_empty() {
        return None;
    }

    let seed = validated.remove(0);
    validated.truncate(max_candidates.saturating_sub(1));

    Some(AutoFindResult { seed, secondaries: validated })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gaussian_frame(width: usize, height: usize, cx: f64, cy: f64, sigma: f64, peak: f64, bg: f64) -> Frame {
        let mut pixels = vec![0u16; width * height];
        for y in 0..height {
            for x in 0..width {
                let dx = x as f64 - cx;
                let dy = y as f64 - cy;
                let r2 = dx * dx + dy * dy;
                let v = bg + peak * (-r2 / (2.0 * sigma * sigma)).exp();
                pixels[y * width + x] = v.round().clamp(0.0, 65000.0) as u16;
            }
        }
        Frame::new(pixels, width, height, 1.0)
    }

    #[test]
    fn test_find_star_centroid_s1() {
        let frame = gaussian_frame(200, 200, 100.3, 100.7, 1.6, 4000.0, 200.0);
        let params = FindStarParams::default();
        let star = find_star(&frame, 100.0, 101.0, &params);
        assert_eq!(star.result, FindResult::Ok);
        assert!((star.position.x - 100.3).abs() < 0.2, "x={}", star.position.x);
        assert!((star.position.y - 100.7).abs() < 0.2, "y={}", star.position.y);
    }

    #[test]
    fn test_find_star_idempotent_p5() {
        let frame = gaussian_frame(200, 200, 100.3, 100.7, 1.6, 4000.0, 200.0);
        let params = FindStarParams::default();
        let first = find_star(&frame, 100.0, 101.0, &params);
        assert!(first.result.is_ok());
        let second = find_star(&frame, first.position.x, first.position.y, &params);
        assert!(second.result.is_ok());
        assert!((first.position.x - second.position.x).abs() < 0.05);
        assert!((first.position.y - second.position.y).abs() < 0.05);
    }

    #[test]
    fn test_find_star_too_near_edge() {
        let frame = gaussian_frame(60, 60, 3.0, 3.0, 1.2, 3000.0, 200.0);
        let params = FindStarParams::default();
        let star = find_star(&frame, 3.0, 3.0, &params);
        assert_eq!(star.result, FindResult::TooNearEdge);
    }

    #[test]
    fn test_find_star_saturated() {
        let frame = gaussian_frame(100, 100, 50.0, 50.0, 1.5, 70000.0, 200.0);
        let params = FindStarParams::default();
        let star = find_star(&frame, 50.0, 50.0, &params);
        assert_eq!(star.result, FindResult::Saturated);
        assert!(star.saturated);
    }

    #[test]
    fn test_auto_find_picks_brightest() {
        let width = 300;
        let height = 300;
        let mut pixels = vec![200u16; width * height];
        let stamp = |pixels: &mut [u16], cx: f64, cy: f64, peak: f64| {
            for y in 0..height {
                for x in 0..width {
                    let dx = x as f64 - cx;
                    let dy = y as f64 - cy;
                    let r2 = dx * dx + dy * dy;
                    let v = 200.0 + peak * (-r2 / (2.0 * 1.6 * 1.6)).exp();
                    let idx = y * width + x;
                    if v as u16 > pixels[idx] {
                        pixels[idx] = v as u16;
                    }
                }
            }
        };
        stamp(&mut pixels, 80.0, 80.0, 3000.0);
        stamp(&mut pixels, 220.0, 200.0, 6000.0);
        let frame = Frame::new(pixels, width, height, 1.0);
        let params = FindStarParams::default();
        let result = auto_find(&frame, 10, 15, 9, &params).expect("should find stars");
        assert!((result.seed.position.x - 220.0).abs() < 1.0);
        assert!((result.seed.position.y - 200.0).abs() < 1.0);
        assert_eq!(result.secondaries.len(), 1);
    }
}

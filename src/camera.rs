//! The camera interface the engine consumes. Grounded on the shape of
//! `guiding::external_guider::ExternalGuider` in the teacher repo: a
//! small imperative trait, no UI callbacks, errors folded into
//! `anyhow::Result`.

use crate::frame::{Frame, Rect};

/// Binning factor applied symmetrically on both axes.
pub type Binning = u32;

/// What portion of the sensor the next exposure should read out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subframe {
    Full,
    Rect(Rect),
}

/// Contract the guiding engine needs from a camera driver. Exposure
/// timing, subframe/binning support and pulse-guide-via-ST4 all vary
/// by hardware; drivers implement this once and the engine is agnostic
/// to which one is plugged in.
pub trait Camera: Send {
    fn connect(&mut self) -> anyhow::Result<()>;
    fn disconnect(&mut self) -> anyhow::Result<()>;
    fn is_connected(&self) -> bool;

    fn set_exposure(&mut self, ms: u32) -> anyhow::Result<()>;
    fn set_binning(&mut self, binning: Binning) -> anyhow::Result<()>;
    fn set_subframe(&mut self, subframe: Subframe) -> anyhow::Result<()>;

    /// Block for the current exposure plus readout and return the
    /// frame, or an error on driver failure/timeout.
    fn capture(&mut self) -> anyhow::Result<Frame>;

    /// Whether this camera can read out less than the full sensor.
    fn supports_subframe(&self) -> bool;
    /// Physical pixel pitch, used to derive the camera-to-mount scale
    /// together with the guide scope's focal length.
    fn pixel_scale_um(&self) -> f64;
    /// ADU value at which a pixel is considered saturated, used by the
    /// star-finder's saturation check.
    fn saturation_adu(&self) -> u32;

    /// `true` for cameras with an ST4 port that can pulse-guide the
    /// mount directly; such a camera is wired up as a `Mount` rather
    /// than driven through this trait for moves.
    fn has_st4_port(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeCamera {
        connected: bool,
        exposure_ms: u32,
        frame_counter: AtomicU32,
    }

    impl FakeCamera {
        fn new() -> Self {
            Self { connected: false, exposure_ms: 1000, frame_counter: AtomicU32::new(0) }
        }
    }

    impl Camera for FakeCamera {
        fn connect(&mut self) -> anyhow::Result<()> {
            self.connected = true;
            Ok(())
        }
        fn disconnect(&mut self) -> anyhow::Result<()> {
            self.connected = false;
            Ok(())
        }
        fn is_connected(&self) -> bool {
            self.connected
        }
        fn set_exposure(&mut self, ms: u32) -> anyhow::Result<()> {
            self.exposure_ms = ms;
            Ok(())
        }
        fn set_binning(&mut self, _binning: Binning) -> anyhow::Result<()> {
            Ok(())
        }
        fn set_subframe(&mut self, _subframe: Subframe) -> anyhow::Result<()> {
            Ok(())
        }
        fn capture(&mut self) -> anyhow::Result<Frame> {
            if !self.connected {
                anyhow::bail!("camera not connected");
            }
            self.frame_counter.fetch_add(1, Ordering::SeqCst);
            Ok(Frame::new(vec![0u16; 16 * 16], 16, 16, self.exposure_ms as f64 / 1000.0))
        }
        fn supports_subframe(&self) -> bool {
            true
        }
        fn pixel_scale_um(&self) -> f64 {
            3.76
        }
        fn saturation_adu(&self) -> u32 {
            65000
        }
    }

    #[test]
    fn test_capture_requires_connection() {
        let mut cam = FakeCamera::new();
        assert!(cam.capture().is_err());
        cam.connect().unwrap();
        assert!(cam.capture().is_ok());
    }

    #[test]
    fn test_exposure_reflected_in_frame() {
        let mut cam = FakeCamera::new();
        cam.connect().unwrap();
        cam.set_exposure(2500).unwrap();
        let frame = cam.capture().unwrap();
        assert!((frame.exposure_s - 2.5).abs() < 1e-9);
    }
}

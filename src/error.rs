use thiserror::Error;

/// Fatal or structural failures the engine surfaces as `Result::Err`.
///
/// Transient per-frame problems (star not found, mass changed, distance
/// jump) are never represented here — they are recorded as fields on
/// `GuideStepInfo` and published on the event bus instead, per the
/// propagation rules of the guiding engine.
#[derive(Error, Debug)]
pub enum GuideError {
    #[error("mount move failed: {0}")]
    HardwareMove(String),

    #[error("step guider reached its mechanical limit on axis {axis}")]
    AoLimitReached { axis: &'static str },

    #[error("calibration failed: {0}")]
    CalibrationFailed(String),

    #[error("persistent hardware error: {0}")]
    PersistentHardwareError(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("operation requires state {expected:?}, guider is in {actual:?}")]
    WrongState { expected: &'static str, actual: String },

    #[error("no camera frame available")]
    NoFrame,
}

pub type GuideResult<T> = Result<T, GuideError>;

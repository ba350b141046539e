//! One-way event bus: the guider publishes state changes and per-frame
//! results, external subscribers (test harness, the out-of-scope RPC
//! server) register closures. Grounded on `core/events.rs`'s `Events`
//! broadcaster (`RwLock<Vec<Box<dyn Fn(Event) + Send + Sync>>>`),
//! extended with an `mpsc`-based subscription for callers (the
//! controller) that need to block on a specific event rather than
//! install a closure.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::geometry::Point;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Unconfigured,
    Selecting,
    Selected,
    CalibratingPrimary,
    CalibratingSecondary,
    Calibrated,
    Guiding,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Scope,
    Ao,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisStepInfo {
    pub duration_ms: f64,
    pub direction_positive: bool,
    pub limited: bool,
}

/// Published once per guided frame: everything the per-frame driver
/// (`guider::Guider::process_frame`) computed, for diagnostics and for
/// the external event/command server.
#[derive(Debug, Clone)]
pub struct GuideStepInfo {
    pub frame_number: u64,
    pub time_since_start_s: f64,
    pub camera_offset: Point,
    pub mount_offset: Point,
    pub x_axis: AxisStepInfo,
    pub y_axis: AxisStepInfo,
    pub ao_position: Option<(f64, f64)>,
    pub star_mass: f64,
    pub star_snr: f64,
    pub average_distance: f64,
}

#[derive(Debug, Clone)]
pub enum GuideEvent {
    AppState { state: AppState },
    StarSelected { pos: Point },
    StartCalibration { mount: MountKind },
    CalibrationStep { mount: MountKind, iter: u32, dx: f64, dy: f64, dist: f64, msg: String },
    CalibrationComplete { mount: MountKind },
    CalibrationFailed { mount: MountKind, reason: String },
    StartGuiding,
    GuidingStopped,
    Paused,
    Resumed,
    LockPositionSet { pos: Point },
    LockPositionLost,
    GuideStep { step_info: Box<GuideStepInfo> },
    StarLost { info: String },
    Settling { dist: f64, time_s: f64, settle_time_s: f64 },
    SettleDone { ok: bool, error: Option<String> },
    GuidingDithered { dx: f64, dy: f64 },
    Alert { msg: String, severity: AlertSeverity },
}

type EventFun = dyn Fn(GuideEvent) + Send + Sync + 'static;

/// Broadcasts every published event to any number of closures, plus any
/// number of `mpsc` channels installed via `subscribe_channel`.
pub struct EventBus {
    closures: RwLock<Vec<Box<EventFun>>>,
    channels: RwLock<Vec<mpsc::Sender<GuideEvent>>>,
    alerts: RwLock<AlertThrottle>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            closures: RwLock::new(Vec::new()),
            channels: RwLock::new(Vec::new()),
            alerts: RwLock::new(AlertThrottle::new()),
        }
    }

    pub fn subscribe(&self, fun: impl Fn(GuideEvent) + Send + Sync + 'static) {
        self.closures.write().unwrap().push(Box::new(fun));
    }

    /// Register a channel that receives every event from here on; used
    /// by the controller to block on `SettleDone` without polling.
    pub fn subscribe_channel(&self) -> mpsc::Receiver<GuideEvent> {
        let (tx, rx) = mpsc::channel();
        self.channels.write().unwrap().push(tx);
        rx
    }

    pub fn unsubscribe_all(&self) {
        self.closures.write().unwrap().clear();
        self.channels.write().unwrap().clear();
    }

    pub fn publish(&self, event: GuideEvent) {
        for s in self.closures.read().unwrap().iter() {
            s(event.clone());
        }
        let mut channels = self.channels.write().unwrap();
        channels.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Publish an `Alert`, honoring per-message-text rate limiting and
    /// the per-profile "do not show again" suppression set.
    pub fn alert(&self, msg: impl Into<String>, severity: AlertSeverity) {
        let msg = msg.into();
        let should_emit = self.alerts.write().unwrap().should_emit(&msg);
        if should_emit {
            self.publish(GuideEvent::Alert { msg, severity });
        }
    }

    pub fn suppress_alert(&self, msg: impl Into<String>) {
        self.alerts.write().unwrap().suppressed.insert(msg.into());
    }

    pub fn reset_dont_show_again(&self) {
        self.alerts.write().unwrap().suppressed.clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Grounded on `stepguider.cpp`'s `SuppressableAlert`/
/// `ConfirmDialog::ResetAllDontAskAgain`: a message is shown at most once
/// per `MIN_REPEAT` interval, and never again once its exact text has
/// been marked "don't show again".
struct AlertThrottle {
    suppressed: HashSet<String>,
    last_emitted: HashMap<String, Instant>,
}

const MIN_REPEAT: Duration = Duration::from_secs(60);

impl AlertThrottle {
    fn new() -> Self {
        Self { suppressed: HashSet::new(), last_emitted: HashMap::new() }
    }

    fn should_emit(&mut self, msg: &str) -> bool {
        if self.suppressed.contains(msg) {
            return false;
        }
        let now = Instant::now();
        if let Some(&last) = self.last_emitted.get(msg) {
            if now.duration_since(last) < MIN_REPEAT {
                return false;
            }
        }
        self.last_emitted.insert(msg.to_string(), now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_closure_subscriber_receives_events() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        bus.subscribe(move |_| { count2.fetch_add(1, Ordering::SeqCst); });
        bus.publish(GuideEvent::StartGuiding);
        bus.publish(GuideEvent::GuidingStopped);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_channel_subscriber_receives_events_in_order() {
        let bus = EventBus::new();
        let rx = bus.subscribe_channel();
        bus.publish(GuideEvent::StartGuiding);
        bus.publish(GuideEvent::GuidingStopped);
        assert!(matches!(rx.recv().unwrap(), GuideEvent::StartGuiding));
        assert!(matches!(rx.recv().unwrap(), GuideEvent::GuidingStopped));
    }

    #[test]
    fn test_alert_rate_limited_per_message() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        bus.subscribe(move |e| if matches!(e, GuideEvent::Alert { .. }) { count2.fetch_add(1, Ordering::SeqCst); });
        bus.alert("same message", AlertSeverity::Warning);
        bus.alert("same message", AlertSeverity::Warning);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_alert_suppressed_never_emits() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        bus.subscribe(move |e| if matches!(e, GuideEvent::Alert { .. }) { count2.fetch_add(1, Ordering::SeqCst); });
        bus.suppress_alert("never again");
        bus.alert("never again", AlertSeverity::Info);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}

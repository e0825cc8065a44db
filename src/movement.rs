//! Head-movement detection from the accelerometer stream.
//!
//! The detector keeps a reference sample and fires when any axis of the
//! current sample moved more than `threshold` g away from it. Firing moves the reference
//! to the current sample and starts a debounce window during which nothing
//! else fires, so a single nod produces a single cue.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::debug;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::types::{AccelSample, XyzSample};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

#[derive(Debug, Clone, Copy)]
pub struct MovementEvent {
    /// Largest per-axis change from the reference, in g.
    pub delta: f32,
    /// Axis with the largest change.
    pub axis: Axis,
    pub at: Instant,
}

#[derive(Debug, Clone)]
pub struct MovementConfig {
    /// g. Default 0.3.
    pub threshold: f32,
    /// Minimum spacing between events. Default 1 s.
    pub debounce: Duration,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            threshold: 0.3,
            debounce: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MovementDetector {
    config: MovementConfig,
    reference: Option<XyzSample>,
    last_event: Option<Instant>,
}

impl MovementDetector {
    pub fn new(config: MovementConfig) -> Self {
        Self {
            config,
            reference: None,
            last_event: None,
        }
    }

    /// Feed one sample. The very first sample only becomes the reference.
    pub fn process(&mut self, sample: AccelSample) -> Option<MovementEvent> {
        let Some(reference) = self.reference else {
            self.reference = Some(sample.xyz);
            return None;
        };
        let (axis, delta) = largest_change(&reference, &sample.xyz);
        if delta.is_nan() || delta <= self.config.threshold {
            return None;
        }
        if let Some(last) = self.last_event {
            if sample.at.saturating_duration_since(last) < self.config.debounce {
                return None;
            }
        }
        self.reference = Some(sample.xyz);
        self.last_event = Some(sample.at);
        Some(MovementEvent {
            delta,
            axis,
            at: sample.at,
        })
    }

    pub fn reset(&mut self) {
        self.reference = None;
        self.last_event = None;
    }
}

/// Axis with the largest absolute change, and that change. NaN on any
/// axis poisons the result so it never fires.
fn largest_change(a: &XyzSample, b: &XyzSample) -> (Axis, f32) {
    let deltas = [
        (Axis::X, (b.x - a.x).abs()),
        (Axis::Y, (b.y - a.y).abs()),
        (Axis::Z, (b.z - a.z).abs()),
    ];
    if let Some(&(axis, d)) = deltas.iter().find(|(_, d)| d.is_nan()) {
        return (axis, d);
    }
    deltas
        .into_iter()
        .fold((Axis::X, 0.0), |best, cur| if cur.1 > best.1 { cur } else { best })
}

// ── Watcher ──────────────────────────────────────────────────────────────────

type Callback = Box<dyn FnMut(MovementEvent) + Send>;

/// Runs a [`MovementDetector`] over a broadcast accelerometer feed and
/// invokes a callback per event until [`MovementWatcher::stop`].
pub struct MovementWatcher {
    callback: Arc<Mutex<Option<Callback>>>,
    task: JoinHandle<()>,
}

impl MovementWatcher {
    pub fn start(
        mut samples: broadcast::Receiver<AccelSample>,
        config: MovementConfig,
        callback: impl FnMut(MovementEvent) + Send + 'static,
    ) -> Self {
        let callback: Arc<Mutex<Option<Callback>>> = Arc::new(Mutex::new(Some(Box::new(callback))));
        let task_callback = Arc::clone(&callback);
        let task = tokio::spawn(async move {
            let mut detector = MovementDetector::new(config);
            loop {
                let sample = match samples.recv().await {
                    Ok(s) => s,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("movement: skipped {n} lagged samples, re-anchoring");
                        detector.reset();
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if let Some(event) = detector.process(sample) {
                    // `stop` takes the callback under the same lock.
                    let Ok(mut guard) = task_callback.lock() else { break };
                    match guard.as_mut() {
                        Some(cb) => cb(event),
                        None => break,
                    }
                }
            }
        });
        Self { callback, task }
    }

    /// After this returns the callback is never invoked again.
    pub fn stop(&self) {
        if let Ok(mut guard) = self.callback.lock() {
            guard.take();
        }
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for MovementWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(t0: Instant, ms: u64, x: f32) -> AccelSample {
        AccelSample {
            at: t0 + Duration::from_millis(ms),
            xyz: XyzSample::new(x, 0.0, -1.0),
        }
    }

    #[test]
    fn single_spike_fires_once() {
        let t0 = Instant::now();
        let mut d = MovementDetector::new(MovementConfig::default());
        assert!(d.process(at(t0, 0, 0.0)).is_none());
        assert!(d.process(at(t0, 20, 0.1)).is_none());
        assert!(d.process(at(t0, 40, 0.1)).is_none());
        let ev = d.process(at(t0, 60, 0.5)).expect("spike");
        assert_eq!(ev.axis, Axis::X);
        assert!((ev.delta - 0.5).abs() < 1e-6);
        // Back near the old position: 0.4 g from the new reference, but debounced.
        assert!(d.process(at(t0, 80, 0.1)).is_none());
    }

    #[test]
    fn reset_re_anchors() {
        let t0 = Instant::now();
        let mut d = MovementDetector::new(MovementConfig::default());
        d.process(at(t0, 0, 0.0));
        d.reset();
        // Far from the old reference, but it only becomes the new one.
        assert!(d.process(at(t0, 20, 0.8)).is_none());
        assert!(d.process(at(t0, 40, 0.9)).is_none());
        assert!(d.process(at(t0, 60, 0.0)).is_some());
    }

    #[test]
    fn debounce_expires() {
        let t0 = Instant::now();
        let mut d = MovementDetector::new(MovementConfig::default());
        d.process(at(t0, 0, 0.0));
        assert!(d.process(at(t0, 10, 0.5)).is_some());
        assert!(d.process(at(t0, 500, 0.0)).is_none());
        assert!(d.process(at(t0, 1100, 0.0)).is_some());
    }

    #[test]
    fn exactly_threshold_does_not_fire() {
        let t0 = Instant::now();
        let mut d = MovementDetector::new(MovementConfig {
            threshold: 0.5,
            ..Default::default()
        });
        d.process(at(t0, 0, 0.0));
        assert!(d.process(at(t0, 10, 0.5)).is_none());
    }

    #[test]
    fn nan_never_fires() {
        let t0 = Instant::now();
        let mut d = MovementDetector::new(MovementConfig::default());
        d.process(at(t0, 0, 0.0));
        assert!(d.process(at(t0, 10, f32::NAN)).is_none());
    }

    #[tokio::test]
    async fn watcher_delivers_then_stops() {
        let (tx, rx) = broadcast::channel(16);
        let (ev_tx, mut ev_rx) = tokio::sync::mpsc::unbounded_channel();
        let watcher = MovementWatcher::start(rx, MovementConfig::default(), move |e| {
            let _ = ev_tx.send(e.delta);
        });

        let t0 = Instant::now();
        tx.send(at(t0, 0, 0.0)).unwrap();
        tx.send(at(t0, 10, 0.8)).unwrap();
        let delta = tokio::time::timeout(Duration::from_secs(1), ev_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!((delta - 0.8).abs() < 1e-6);

        watcher.stop();
        let _ = tx.send(at(t0, 5000, -0.8));
        // Callback (and its sender) dropped by `stop`.
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(1), ev_rx.recv()).await.unwrap(),
            None
        );
    }
}

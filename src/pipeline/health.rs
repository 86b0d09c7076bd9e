//! Health monitoring and metrics for the tracking pipeline

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::assets::STALL_THRESHOLD_SECS;

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Health metrics for a tracking pipeline
///
/// Besides throughput, the counters account for every buffer transfer so the
/// exchange can be audited: `buffers_sent == buffers_returned + buffers_abandoned
/// + (1 if a request is in flight)`.
pub struct PipelineHealth {
    /// Buffers handed to the detection worker
    pub buffers_sent: AtomicU64,

    /// Buffers handed back by the detection worker and reclaimed
    pub buffers_returned: AtomicU64,

    /// Buffers given up on after a detection deadline expired
    pub buffers_abandoned: AtomicU64,

    /// Ticks that skipped a capture because a detection was still in flight
    pub capture_skips: AtomicU64,

    /// Frames presented on the display side
    pub frames_displayed: AtomicU64,

    /// Detection results that located a marker
    pub markers_found: AtomicU64,

    /// Detection results without any marker
    pub markers_missed: AtomicU64,

    /// Results that did not match the in-flight exchange
    pub protocol_violations: AtomicU64,

    /// Detections that exceeded the deadline
    pub detection_timeouts: AtomicU64,

    /// Timestamp (as Unix microseconds) of the last buffer sent, returned, or abandoned
    pub last_transfer_time: AtomicU64,
}

impl PipelineHealth {
    /// Create a new health metrics instance
    pub fn new() -> Self {
        Self {
            buffers_sent: AtomicU64::new(0),
            buffers_returned: AtomicU64::new(0),
            buffers_abandoned: AtomicU64::new(0),
            capture_skips: AtomicU64::new(0),
            frames_displayed: AtomicU64::new(0),
            markers_found: AtomicU64::new(0),
            markers_missed: AtomicU64::new(0),
            protocol_violations: AtomicU64::new(0),
            detection_timeouts: AtomicU64::new(0),
            last_transfer_time: AtomicU64::new(unix_micros()),
        }
    }

    pub fn record_buffer_sent(&self) {
        self.last_transfer_time.store(unix_micros(), Ordering::Relaxed);
        self.buffers_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a reclaimed buffer and the outcome of its detection
    pub fn record_buffer_returned(&self, found: bool) {
        self.last_transfer_time.store(unix_micros(), Ordering::Relaxed);
        self.buffers_returned.fetch_add(1, Ordering::Relaxed);
        if found {
            self.markers_found.fetch_add(1, Ordering::Relaxed);
        } else {
            self.markers_missed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_capture_skip(&self) {
        self.capture_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_displayed(&self) {
        self.frames_displayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_protocol_violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a buffer the render side stopped waiting for
    pub fn record_buffer_abandoned(&self) {
        self.last_transfer_time.store(unix_micros(), Ordering::Relaxed);
        self.buffers_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a detection that exceeded its deadline
    pub fn record_timeout(&self) {
        self.detection_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn buffers_sent(&self) -> u64 {
        self.buffers_sent.load(Ordering::Relaxed)
    }

    pub fn buffers_returned(&self) -> u64 {
        self.buffers_returned.load(Ordering::Relaxed)
    }

    pub fn buffers_abandoned(&self) -> u64 {
        self.buffers_abandoned.load(Ordering::Relaxed)
    }

    pub fn capture_skips(&self) -> u64 {
        self.capture_skips.load(Ordering::Relaxed)
    }

    pub fn frames_displayed(&self) -> u64 {
        self.frames_displayed.load(Ordering::Relaxed)
    }

    pub fn markers_found(&self) -> u64 {
        self.markers_found.load(Ordering::Relaxed)
    }

    pub fn markers_missed(&self) -> u64 {
        self.markers_missed.load(Ordering::Relaxed)
    }

    pub fn protocol_violations(&self) -> u64 {
        self.protocol_violations.load(Ordering::Relaxed)
    }

    pub fn detection_timeouts(&self) -> u64 {
        self.detection_timeouts.load(Ordering::Relaxed)
    }

    /// Buffers currently owned by the detection side
    pub fn buffers_outstanding(&self) -> u64 {
        self.buffers_sent()
            .saturating_sub(self.buffers_returned() + self.buffers_abandoned())
    }

    /// Share of detections that located a marker, as a percentage
    pub fn hit_rate(&self) -> f64 {
        let found = self.markers_found();
        let total = found + self.markers_missed();
        if total == 0 {
            return 0.0;
        }
        (found as f64 / total as f64) * 100.0
    }

    /// Whether a detection has been in flight for longer than `threshold`.
    ///
    /// Nothing outstanding (loading, paused) is never a stall.
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        if self.buffers_outstanding() == 0 {
            return false;
        }
        let last = self.last_transfer_time.load(Ordering::Relaxed);
        let elapsed_micros = unix_micros().saturating_sub(last);
        elapsed_micros > threshold.as_micros() as u64
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            buffers_sent: self.buffers_sent(),
            buffers_returned: self.buffers_returned(),
            buffers_abandoned: self.buffers_abandoned(),
            capture_skips: self.capture_skips(),
            frames_displayed: self.frames_displayed(),
            markers_found: self.markers_found(),
            hit_rate: self.hit_rate(),
            protocol_violations: self.protocol_violations(),
            detection_timeouts: self.detection_timeouts(),
        }
    }
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone)]
pub struct HealthSummary {
    pub buffers_sent: u64,
    pub buffers_returned: u64,
    pub buffers_abandoned: u64,
    pub capture_skips: u64,
    pub frames_displayed: u64,
    pub markers_found: u64,
    pub hit_rate: f64,
    pub protocol_violations: u64,
    pub detection_timeouts: u64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} frames displayed, {} detections ({} found, {:.1}%), {} skipped captures, {} timeouts, {} abandoned buffers, {} protocol violations",
            self.frames_displayed,
            self.buffers_returned,
            self.markers_found,
            self.hit_rate,
            self.capture_skips,
            self.detection_timeouts,
            self.buffers_abandoned,
            self.protocol_violations
        )
    }
}

/// Conditions worth a warning in the log
#[derive(Debug, Clone, PartialEq)]
pub enum HealthAlert {
    /// No detection result for the threshold duration
    Stalled { duration: Duration },

    /// Detections exceeded their deadline
    Timeouts { count: u64 },

    /// Replies that did not match the in-flight exchange
    ProtocolViolations { count: u64 },
}

impl std::fmt::Display for HealthAlert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthAlert::Stalled { duration } => {
                write!(f, "Detection stalled for {:?}", duration)
            }
            HealthAlert::Timeouts { count } => {
                write!(f, "Detection timeouts: {}", count)
            }
            HealthAlert::ProtocolViolations { count } => {
                write!(f, "Protocol violations: {}", count)
            }
        }
    }
}

/// Watches the counters of a running session and reports stalls, timeouts, and
/// protocol violations since the previous check.
pub struct HealthMonitor {
    health: Arc<PipelineHealth>,
    alert_tx: mpsc::Sender<HealthAlert>,
    check_interval: Duration,
    stall_threshold: Duration,
    last_timeouts: u64,
    last_violations: u64,
}

impl HealthMonitor {
    pub fn new(health: Arc<PipelineHealth>, alert_tx: mpsc::Sender<HealthAlert>) -> Self {
        Self {
            health,
            alert_tx,
            check_interval: Duration::from_secs(5),
            stall_threshold: Duration::from_secs(STALL_THRESHOLD_SECS),
            last_timeouts: 0,
            last_violations: 0,
        }
    }

    /// How often the counters are checked
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Time without a detection result before the session counts as stalled
    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }

    /// Compare the counters with the previous check
    pub fn check(&mut self) -> Vec<HealthAlert> {
        let mut alerts = Vec::new();

        if self.health.is_stalled(self.stall_threshold) {
            alerts.push(HealthAlert::Stalled {
                duration: self.stall_threshold,
            });
        }

        let timeouts = self.health.detection_timeouts();
        if timeouts > self.last_timeouts {
            alerts.push(HealthAlert::Timeouts {
                count: timeouts - self.last_timeouts,
            });
            self.last_timeouts = timeouts;
        }

        let violations = self.health.protocol_violations();
        if violations > self.last_violations {
            alerts.push(HealthAlert::ProtocolViolations {
                count: violations - self.last_violations,
            });
            self.last_violations = violations;
        }

        alerts
    }

    /// Run the health monitor until cancelled or the alert receiver is dropped
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.check_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = cancel.cancelled() => break,
            }

            for alert in self.check() {
                if self.alert_tx.send(alert).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_accounting() {
        let health = PipelineHealth::new();

        health.record_buffer_sent();
        health.record_buffer_returned(true);
        health.record_buffer_sent();
        health.record_buffer_returned(false);
        health.record_buffer_sent();

        assert_eq!(health.buffers_sent(), 3);
        assert_eq!(health.buffers_returned(), 2);
        assert_eq!(health.buffers_outstanding(), 1);
        assert_eq!(health.markers_found(), 1);
        assert!((health.hit_rate() - 50.0).abs() < f64::EPSILON);
        assert!(
            health.summary().to_string().contains("(1 found, 50.0%)"),
            "{}",
            health.summary()
        );

        health.record_buffer_abandoned();
        assert_eq!(health.buffers_outstanding(), 0);
        assert_eq!(health.buffers_abandoned(), 1);
    }

    #[test]
    fn test_stall_detection() {
        let health = PipelineHealth::new();

        // Should not be stalled immediately
        assert!(!health.is_stalled(Duration::from_secs(1)));

        health.record_buffer_sent();
        std::thread::sleep(Duration::from_millis(150));
        assert!(health.is_stalled(Duration::from_millis(100)));

        health.record_buffer_returned(false);
        assert!(!health.is_stalled(Duration::from_millis(100)));
    }

    #[test]
    fn test_idle_session_is_not_stalled() {
        let health = Arc::new(PipelineHealth::new());
        let (alert_tx, _alert_rx) = mpsc::channel(8);
        let mut monitor = HealthMonitor::new(health.clone(), alert_tx)
            .with_stall_threshold(Duration::from_millis(50));

        // loading or paused: no buffer outstanding, however long it lasts
        std::thread::sleep(Duration::from_millis(100));
        assert!(!health.is_stalled(Duration::from_millis(50)));
        assert!(monitor.check().is_empty());

        // a dispatch after a long pause starts its own stall clock
        health.record_buffer_sent();
        assert!(!health.is_stalled(Duration::from_millis(50)));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(
            monitor.check(),
            vec![HealthAlert::Stalled {
                duration: Duration::from_millis(50)
            }]
        );
    }

    #[test]
    fn test_monitor_reports_new_events_once() {
        let health = Arc::new(PipelineHealth::new());
        let (alert_tx, _alert_rx) = mpsc::channel(8);
        let mut monitor = HealthMonitor::new(health.clone(), alert_tx)
            .with_stall_threshold(Duration::from_secs(60));

        assert!(monitor.check().is_empty());

        health.record_timeout();
        health.record_protocol_violation();
        health.record_protocol_violation();
        let alerts = monitor.check();
        assert!(alerts.contains(&HealthAlert::Timeouts { count: 1 }));
        assert!(alerts.contains(&HealthAlert::ProtocolViolations { count: 2 }));

        assert!(monitor.check().is_empty());
    }

    #[tokio::test]
    async fn test_monitor_sends_alerts() {
        let health = Arc::new(PipelineHealth::new());
        let (alert_tx, mut alert_rx) = mpsc::channel(8);
        let monitor = HealthMonitor::new(health.clone(), alert_tx)
            .with_check_interval(Duration::from_millis(10))
            .with_stall_threshold(Duration::from_secs(60));

        health.record_protocol_violation();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(monitor.run(cancel.clone()));

        let alert = alert_rx.recv().await;
        assert_eq!(alert, Some(HealthAlert::ProtocolViolations { count: 1 }));

        cancel.cancel();
        task.await.unwrap();
    }
}

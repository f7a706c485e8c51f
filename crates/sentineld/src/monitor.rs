//! PIR polling task.
//!
//! Samples the motion line at a fixed interval, debounces it, and forwards
//! transitions to the decision engine without ever blocking on it: when the
//! queue is full a motion event is dropped and counted. Fault and recovery
//! notices are held back and retried until the engine has taken them.

use sentinel_core::{MotionDebouncer, MotionEvent, MotionKind};
use sentinel_hw::MotionLine;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// What the monitor reports to the decision engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorEvent {
    Motion(MotionEvent),
    /// The line could not be read; the monitor keeps retrying with backoff.
    Fault(String),
    /// Reads succeed again after a `Fault`.
    Recovered,
}

pub struct MotionMonitor {
    line: Box<dyn MotionLine>,
    debouncer: MotionDebouncer,
    poll: Duration,
    backoff_max: Duration,
    tx: mpsc::Sender<SensorEvent>,
    /// Fault/recovery notice the engine has not accepted yet.
    pending: Option<SensorEvent>,
    faulted: bool,
    dropped: u64,
}

impl MotionMonitor {
    pub fn new(
        line: Box<dyn MotionLine>,
        debouncer: MotionDebouncer,
        poll: Duration,
        backoff_max: Duration,
        tx: mpsc::Sender<SensorEvent>,
    ) -> Self {
        Self {
            line,
            debouncer,
            poll,
            backoff_max,
            tx,
            pending: None,
            faulted: false,
            dropped: 0,
        }
    }

    /// Poll until the engine side of the channel goes away.
    pub async fn run(mut self) {
        tracing::info!(poll_ms = self.poll.as_millis() as u64, "motion monitor started");
        let mut delay = self.poll;

        loop {
            tokio::time::sleep(delay).await;
            if self.tx.is_closed() {
                break;
            }
            self.flush_pending();

            let now = tokio::time::Instant::now().into_std();
            match self.line.read() {
                Ok(level) => {
                    if self.faulted {
                        self.faulted = false;
                        tracing::info!("motion sensor readable again");
                        self.notify(SensorEvent::Recovered);
                    }
                    delay = self.poll;
                    if let Some(event) = self.debouncer.update(level, now) {
                        self.emit(event);
                    }
                }
                Err(e) => {
                    if !self.faulted {
                        self.faulted = true;
                        tracing::error!(error = %e, "motion sensor read failed");
                        if let Some(end) = self.debouncer.reset(now) {
                            self.emit(end);
                        }
                        self.notify(SensorEvent::Fault(e.to_string()));
                    } else {
                        tracing::debug!(error = %e, retry_in_ms = delay.as_millis() as u64, "motion sensor still failing");
                    }
                    delay = (delay * 2).min(self.backoff_max);
                }
            }
        }

        tracing::info!(dropped = self.dropped, "motion monitor stopped");
    }

    fn emit(&mut self, event: MotionEvent) {
        match self.tx.try_send(SensorEvent::Motion(event)) {
            Ok(()) => match event.kind {
                MotionKind::Start => tracing::info!(held_ms = event.raw_duration_active_ms, "motion started"),
                MotionKind::End => tracing::info!(active_ms = event.raw_duration_active_ms, "motion ended"),
            },
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                tracing::warn!(kind = ?event.kind, dropped = self.dropped, "engine queue full, motion event dropped");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Deliver a fault or recovery notice, superseding any undelivered one.
    fn notify(&mut self, event: SensorEvent) {
        self.pending = Some(event);
        self.flush_pending();
    }

    fn flush_pending(&mut self) {
        if let Some(event) = self.pending.take() {
            if let Err(TrySendError::Full(event)) = self.tx.try_send(event) {
                self.pending = Some(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_hw::{GpioError, SensorError};
    use std::path::PathBuf;
    use tokio::time::Instant;

    /// Line whose level is a function of time since the test started.
    struct TimedLine<F: Fn(Duration) -> Option<bool> + Send> {
        start: Instant,
        level: F,
    }

    impl<F: Fn(Duration) -> Option<bool> + Send> MotionLine for TimedLine<F> {
        fn read(&mut self) -> Result<bool, SensorError> {
            (self.level)(self.start.elapsed()).ok_or_else(|| {
                SensorError(GpioError::BadValue {
                    path: PathBuf::from("/sys/class/gpio/gpio17/value"),
                    value: "?".into(),
                })
            })
        }
    }

    fn spawn_monitor<F>(level: F, capacity: usize) -> mpsc::Receiver<SensorEvent>
    where
        F: Fn(Duration) -> Option<bool> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity);
        let monitor = MotionMonitor::new(
            Box::new(TimedLine { start: Instant::now(), level }),
            MotionDebouncer::new(Duration::from_millis(300), Duration::from_millis(1000)),
            Duration::from_millis(50),
            Duration::from_millis(800),
            tx,
        );
        tokio::spawn(monitor.run());
        rx
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_glitches_never_reach_engine() {
        // 100ms pulses every second.
        let mut rx = spawn_monitor(|t| Some(t.as_millis() % 1000 < 100), 8);
        tokio::time::sleep(ms(5000)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_motion_start_then_end() {
        let mut rx = spawn_monitor(|t| Some(t >= ms(500) && t < ms(2500)), 8);
        tokio::time::sleep(ms(5000)).await;

        let SensorEvent::Motion(start) = rx.try_recv().unwrap() else {
            panic!("expected motion start");
        };
        assert_eq!(start.kind, MotionKind::Start);
        assert!(start.raw_duration_active_ms >= 300);

        let SensorEvent::Motion(end) = rx.try_recv().unwrap() else {
            panic!("expected motion end");
        };
        assert_eq!(end.kind, MotionKind::End);
        assert!((1900..=2100).contains(&end.raw_duration_active_ms));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_failure_reports_fault_and_recovery() {
        // Inactive throughout, unreadable between 1s and 3s.
        let mut rx = spawn_monitor(
            |t| if t >= ms(1000) && t < ms(3000) { None } else { Some(false) },
            8,
        );
        tokio::time::sleep(ms(6000)).await;

        assert!(matches!(rx.try_recv().unwrap(), SensorEvent::Fault(_)));
        assert_eq!(rx.try_recv().unwrap(), SensorEvent::Recovered);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_closes_open_episode() {
        let mut rx = spawn_monitor(|t| if t < ms(1000) { Some(true) } else { None }, 8);
        tokio::time::sleep(ms(2000)).await;

        let kinds: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(matches!(kinds[0], SensorEvent::Motion(MotionEvent { kind: MotionKind::Start, .. })));
        assert!(matches!(kinds[1], SensorEvent::Motion(MotionEvent { kind: MotionKind::End, .. })));
        assert!(matches!(kinds[2], SensorEvent::Fault(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_drops_motion_but_keeps_fault() {
        // Capacity 1 and nobody reading: the first start fills the queue.
        let mut rx = spawn_monitor(
            |t| match t.as_millis() {
                0..=999 => Some(true),
                1000..=2999 => Some(false),
                3000..=3999 => Some(true),
                _ => None,
            },
            1,
        );
        tokio::time::sleep(ms(4500)).await;
        assert!(matches!(rx.recv().await, Some(SensorEvent::Motion(_))));

        // Draining frees a slot; the held fault notice goes out on the next tick.
        tokio::time::sleep(ms(2000)).await;
        assert!(matches!(rx.try_recv().unwrap(), SensorEvent::Fault(_)));
    }
}

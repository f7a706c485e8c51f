//! Buzzer control.
//!
//! The only place that drives the alert output. An unauthorized decision
//! sounds the buzzer for a fixed time; everything else leaves it off. The
//! line is written only when its state changes, and an off write that fails
//! is retried until it lands.

use sentinel_core::{Decision, Outcome};
use sentinel_hw::BuzzerLine;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Delay before retrying a failed off write.
const OFF_RETRY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub enum ActuatorCommand {
    Apply(Decision),
    /// Force the buzzer off (fault or shutdown).
    FailSafe,
}

pub struct AlertActuator {
    line: Box<dyn BuzzerLine>,
    alert_duration: Duration,
    /// Last state known to be on the wire; `None` until the first write lands.
    line_state: Option<bool>,
    /// When the line must next be driven off.
    off_at: Option<Instant>,
}

impl AlertActuator {
    pub fn new(line: Box<dyn BuzzerLine>, alert_duration: Duration) -> Self {
        Self {
            line,
            alert_duration,
            line_state: None,
            off_at: None,
        }
    }

    pub fn is_on(&self) -> bool {
        self.line_state == Some(true)
    }

    /// Next moment [`tick`](Self::tick) has work to do.
    pub fn deadline(&self) -> Option<Instant> {
        self.off_at
    }

    pub fn apply(&mut self, decision: &Decision, now: Instant) {
        match decision.outcome {
            Outcome::Unauthorized => {
                if self.is_on() {
                    tracing::debug!(session_id = decision.session_id, "alert already sounding");
                    return;
                }
                tracing::warn!(
                    session_id = decision.session_id,
                    best_distance = ?decision.best_distance,
                    duration_ms = self.alert_duration.as_millis() as u64,
                    "unauthorized, sounding alert"
                );
                if self.drive(true) {
                    self.off_at = Some(now + self.alert_duration);
                } else {
                    // Line state unknown: drive it off again shortly.
                    self.off_at = Some(now + OFF_RETRY);
                }
            }
            Outcome::Authorized => {
                tracing::info!(
                    session_id = decision.session_id,
                    identity = decision.identity_id.as_deref().unwrap_or(""),
                    "access granted"
                );
                self.force_off(now);
            }
            Outcome::Inconclusive => {
                tracing::debug!(session_id = decision.session_id, "inconclusive, no alert");
            }
        }
    }

    /// Drive the line off regardless of the current alert.
    pub fn fail_safe(&mut self, now: Instant) {
        self.force_off(now);
    }

    /// Turn the alert off once its time is up.
    pub fn tick(&mut self, now: Instant) {
        if self.off_at.is_some_and(|at| now >= at) {
            self.force_off(now);
        }
    }

    fn force_off(&mut self, now: Instant) {
        if self.drive(false) {
            self.off_at = None;
        } else {
            self.off_at = Some(now + OFF_RETRY);
        }
    }

    /// Write `on` if it differs from the known line state. Returns whether
    /// the line is now in that state.
    fn drive(&mut self, on: bool) -> bool {
        if self.line_state == Some(on) {
            return true;
        }
        match self.line.set(on) {
            Ok(()) => {
                self.line_state = Some(on);
                true
            }
            Err(e) => {
                tracing::error!(on, error = %e, "buzzer write failed");
                self.line_state = None;
                false
            }
        }
    }
}

/// Consume commands until the channel closes, then leave the buzzer off.
pub async fn run(mut actuator: AlertActuator, mut commands: mpsc::Receiver<ActuatorCommand>) {
    actuator.fail_safe(Instant::now());

    loop {
        let deadline = actuator.deadline();
        let wake = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(ActuatorCommand::Apply(decision)) => actuator.apply(&decision, Instant::now()),
                Some(ActuatorCommand::FailSafe) => actuator.fail_safe(Instant::now()),
                None => break,
            },
            _ = tokio::time::sleep_until(wake), if deadline.is_some() => actuator.tick(Instant::now()),
        }
    }

    actuator.fail_safe(Instant::now());
    tracing::info!("actuator stopped, buzzer off");
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_hw::{ActuatorError, GpioError};
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    type Writes = Arc<Mutex<Vec<(bool, Instant)>>>;

    /// Records every write; fails the next `fail` writes.
    struct RecordingLine {
        writes: Writes,
        fail: Arc<Mutex<u32>>,
    }

    impl BuzzerLine for RecordingLine {
        fn set(&mut self, active: bool) -> Result<(), ActuatorError> {
            let mut fail = self.fail.lock().unwrap();
            if *fail > 0 {
                *fail -= 1;
                return Err(ActuatorError(GpioError::Io {
                    path: PathBuf::from("/sys/class/gpio/gpio18/value"),
                    source: std::io::Error::other("busy"),
                }));
            }
            self.writes.lock().unwrap().push((active, Instant::now()));
            Ok(())
        }
    }

    fn decision(outcome: Outcome) -> Decision {
        match outcome {
            Outcome::Authorized => Decision::authorized(1, "alice".into(), 2, 0.3),
            Outcome::Unauthorized => Decision::unauthorized(1, 3, Some(0.82)),
            Outcome::Inconclusive => Decision::inconclusive(1, 0, None),
        }
    }

    struct Rig {
        tx: mpsc::Sender<ActuatorCommand>,
        writes: Writes,
        fail: Arc<Mutex<u32>>,
        task: tokio::task::JoinHandle<()>,
    }

    fn rig() -> Rig {
        let writes: Writes = Arc::default();
        let fail = Arc::new(Mutex::new(0));
        let actuator = AlertActuator::new(
            Box::new(RecordingLine { writes: writes.clone(), fail: fail.clone() }),
            Duration::from_millis(3000),
        );
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(run(actuator, rx));
        Rig { tx, writes, fail, task }
    }

    fn states(writes: &Writes) -> Vec<bool> {
        writes.lock().unwrap().iter().map(|(on, _)| *on).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_sounds_for_alert_duration() {
        let rig = rig();
        tokio::time::sleep(Duration::from_millis(10)).await;
        rig.tx.send(ActuatorCommand::Apply(decision(Outcome::Unauthorized))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5000)).await;

        let writes = rig.writes.lock().unwrap().clone();
        // Startup off, alert on, alert off.
        assert_eq!(writes.iter().map(|w| w.0).collect::<Vec<_>>(), vec![false, true, false]);
        assert_eq!(writes[2].1 - writes[1].1, Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_unauthorized_does_not_extend() {
        let rig = rig();
        rig.tx.send(ActuatorCommand::Apply(decision(Outcome::Unauthorized))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        rig.tx.send(ActuatorCommand::Apply(decision(Outcome::Unauthorized))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5000)).await;

        let writes = rig.writes.lock().unwrap().clone();
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[2].1 - writes[1].1, Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_authorized_and_inconclusive_stay_silent() {
        let rig = rig();
        rig.tx.send(ActuatorCommand::Apply(decision(Outcome::Authorized))).await.unwrap();
        rig.tx.send(ActuatorCommand::Apply(decision(Outcome::Inconclusive))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(states(&rig.writes), vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_authorized_cuts_running_alert() {
        let rig = rig();
        rig.tx.send(ActuatorCommand::Apply(decision(Outcome::Unauthorized))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        rig.tx.send(ActuatorCommand::Apply(decision(Outcome::Authorized))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(states(&rig.writes), vec![false, true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_safe_turns_off_immediately() {
        let rig = rig();
        rig.tx.send(ActuatorCommand::Apply(decision(Outcome::Unauthorized))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        rig.tx.send(ActuatorCommand::FailSafe).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let writes = rig.writes.lock().unwrap().clone();
        assert_eq!(writes.len(), 3);
        assert!(!writes[2].0);
        assert_eq!(writes[2].1 - writes[1].1, Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_off_write_is_retried() {
        let rig = rig();
        rig.tx.send(ActuatorCommand::Apply(decision(Outcome::Unauthorized))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        *rig.fail.lock().unwrap() = 2;
        tokio::time::sleep(Duration::from_millis(5000)).await;

        let writes = rig.writes.lock().unwrap().clone();
        assert_eq!(states(&rig.writes), vec![false, true, false]);
        // Two failed attempts at 3000ms, then the retry lands.
        assert_eq!(writes[2].1 - writes[1].1, Duration::from_millis(3000) + OFF_RETRY * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_on_write_is_followed_by_off() {
        let rig = rig();
        tokio::time::sleep(Duration::from_millis(10)).await;
        *rig.fail.lock().unwrap() = 1;
        rig.tx.send(ActuatorCommand::Apply(decision(Outcome::Unauthorized))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;

        let writes = rig.writes.lock().unwrap().clone();
        // Startup off, then the off that settles the unknown line.
        assert_eq!(states(&rig.writes), vec![false, false]);
        assert_eq!(writes[1].1 - writes[0].1, Duration::from_millis(10) + OFF_RETRY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closing_channel_leaves_buzzer_off() {
        let rig = rig();
        rig.tx.send(ActuatorCommand::Apply(decision(Outcome::Unauthorized))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(rig.tx);
        rig.task.await.unwrap();
        assert_eq!(states(&rig.writes).last(), Some(&false));
    }
}

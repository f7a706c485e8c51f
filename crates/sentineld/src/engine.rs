//! Decision engine: turns motion episodes into access decisions.
//!
//! One task owns all session state. It waits for a motion start, takes an
//! enrollment snapshot, pulls frames through the capture worker and
//! embeddings through the inference worker until it can decide, emits the
//! decision to the actuator, and then sits out the cooldown. Camera and
//! model failures are absorbed per session; repeated ones, or any sensor
//! fault, park the engine in `Faulted` until the failing part probes healthy.

use crate::actuator::ActuatorCommand;
use crate::monitor::SensorEvent;
use crate::workers::{CaptureHandle, FrameBatch, InferenceHandle};
use sentinel_core::{
    Decision, DetectedFace, DistanceMetric, EnrollmentStore, Gallery, MatchResult, MotionKind,
    Outcome,
};
use sentinel_hw::CaptureError;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Arming,
    Capturing,
    Evaluating,
    Resolved,
    Cooldown,
    Faulted,
}

/// Component blamed for entering `Faulted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "component", content = "reason", rename_all = "snake_case")]
pub enum FaultCause {
    Sensor(String),
    Camera(String),
    Model(String),
}

/// Snapshot published after every phase change and decision.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub phase: Phase,
    pub fault: Option<FaultCause>,
    pub motion_active: bool,
    pub sessions: u64,
    pub authorized: u64,
    pub unauthorized: u64,
    pub inconclusive: u64,
    /// Motion starts seen while a session or cooldown was in progress.
    pub ignored_motion_starts: u64,
    pub consecutive_failed_sessions: u32,
    pub last_decision: Option<Decision>,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            fault: None,
            motion_active: false,
            sessions: 0,
            authorized: 0,
            unauthorized: 0,
            inconclusive: 0,
            ignored_motion_starts: 0,
            consecutive_failed_sessions: 0,
            last_decision: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub session_timeout: Duration,
    pub max_frames_per_session: u32,
    pub capture_batch_size: usize,
    pub frame_timeout: Duration,
    pub inference_timeout: Duration,
    pub authorization_threshold: f32,
    pub distance_metric: DistanceMetric,
    pub cooldown: Duration,
    pub inference_retry_budget: u32,
    pub max_consecutive_failed_sessions: u32,
    pub fault_probe_interval: Duration,
}

/// Per-session bookkeeping, discarded when the session resolves.
struct SessionState {
    id: u64,
    gallery: Arc<Gallery>,
    deadline: Instant,
    frames_seen: u32,
    evidence_frames: u32,
    frame_timeouts: u32,
    inference_failures: u32,
    best: Option<MatchResult>,
}

impl SessionState {
    /// Smallest finite distance seen; an empty gallery never yields one.
    fn best_distance(&self) -> Option<f32> {
        self.best
            .as_ref()
            .map(|m| m.distance)
            .filter(|d| d.is_finite())
    }

    /// Fold one frame's faces into the session. Returns the best match of the
    /// frame when it clears the threshold.
    fn observe(&mut self, faces: &[DetectedFace], settings: &EngineSettings) -> Option<MatchResult> {
        self.frames_seen += 1;
        if faces.is_empty() {
            return None;
        }
        self.evidence_frames += 1;

        let mut frame_best: Option<MatchResult> = None;
        for face in faces {
            let m = self.gallery.nearest_match(
                &face.embedding,
                settings.distance_metric,
                settings.authorization_threshold,
            );
            // NaN never compares; it must not shadow a real match.
            if m.distance.is_nan() {
                continue;
            }
            if frame_best.as_ref().map_or(true, |b| m.distance < b.distance) {
                frame_best = Some(m);
            }
        }

        let frame_best = frame_best?;
        if self.best.as_ref().map_or(true, |b| frame_best.distance < b.distance) {
            self.best = Some(frame_best.clone());
        }
        if frame_best.matched {
            Some(frame_best)
        } else {
            None
        }
    }
}

/// One unit of capture-phase progress.
enum Observation {
    Faces(Vec<DetectedFace>),
    FrameTimeout,
    BatchDone,
    CameraStalled,
    CameraUnavailable(String),
    InferenceFailed(String),
    DeadlineElapsed,
    SensorFault(String),
}

/// Why the capture phase stopped.
enum CaptureEnd {
    Matched(MatchResult),
    Exhausted,
    DeadlineElapsed,
    Failed(FaultCause),
    SensorFault(String),
}

enum SessionEnd {
    Decided {
        decision: Decision,
        failure: Option<FaultCause>,
    },
    Aborted(FaultCause),
}

pub struct DecisionEngine {
    settings: EngineSettings,
    capture: CaptureHandle,
    inference: InferenceHandle,
    store: Arc<EnrollmentStore>,
    actuator: mpsc::Sender<ActuatorCommand>,
    status: watch::Sender<EngineStatus>,
    phase: Phase,
    motion_active: bool,
    sensor_faulted: bool,
    fault: Option<FaultCause>,
    failed_sessions: u32,
    next_session_id: u64,
}

impl DecisionEngine {
    pub fn new(
        settings: EngineSettings,
        capture: CaptureHandle,
        inference: InferenceHandle,
        store: Arc<EnrollmentStore>,
        actuator: mpsc::Sender<ActuatorCommand>,
        status: watch::Sender<EngineStatus>,
    ) -> Self {
        Self {
            settings,
            capture,
            inference,
            store,
            actuator,
            status,
            phase: Phase::Idle,
            motion_active: false,
            sensor_faulted: false,
            fault: None,
            failed_sessions: 0,
            next_session_id: 1,
        }
    }

    /// Run until the sensor event stream closes.
    pub async fn run(mut self, mut events: mpsc::Receiver<SensorEvent>) {
        tracing::info!("decision engine started");

        loop {
            if self.phase == Phase::Faulted {
                if !self.recover(&mut events).await {
                    break;
                }
                if self.motion_active {
                    tracing::info!("motion still present after recovery, arming");
                    self.run_episode(&mut events).await;
                }
                continue;
            }

            let Some(event) = events.recv().await else {
                break;
            };
            match event {
                SensorEvent::Motion(m) if m.kind == MotionKind::Start => {
                    self.set_motion(true);
                    self.run_episode(&mut events).await;
                }
                SensorEvent::Motion(_) => self.set_motion(false),
                SensorEvent::Fault(reason) => {
                    self.sensor_faulted = true;
                    self.enter_fault(FaultCause::Sensor(reason)).await;
                }
                SensorEvent::Recovered => self.sensor_faulted = false,
            }
        }

        tracing::info!("sensor stream closed, decision engine stopping");
        self.command(ActuatorCommand::FailSafe).await;
    }

    /// Sessions and cooldowns for one motion episode. Re-arms directly when
    /// motion is still present as the cooldown ends.
    async fn run_episode(&mut self, events: &mut mpsc::Receiver<SensorEvent>) {
        loop {
            match self.run_session(events).await {
                SessionEnd::Aborted(cause) => {
                    self.enter_fault(cause).await;
                    return;
                }
                SessionEnd::Decided { decision, failure } => {
                    self.emit(decision).await;
                    self.set_phase(Phase::Resolved);

                    if let Some(cause) = failure {
                        self.failed_sessions += 1;
                        tracing::warn!(
                            failed_sessions = self.failed_sessions,
                            limit = self.settings.max_consecutive_failed_sessions,
                            cause = ?cause,
                            "session failed"
                        );
                        if self.failed_sessions >= self.settings.max_consecutive_failed_sessions {
                            self.enter_fault(cause).await;
                            return;
                        }
                    } else {
                        self.failed_sessions = 0;
                    }
                    self.status.send_modify(|s| s.consecutive_failed_sessions = self.failed_sessions);

                    if !self.cooldown(events).await {
                        return;
                    }
                    if !self.motion_active {
                        self.set_phase(Phase::Idle);
                        return;
                    }
                    tracing::info!("motion still present after cooldown, re-arming");
                }
            }
        }
    }

    async fn run_session(&mut self, events: &mut mpsc::Receiver<SensorEvent>) -> SessionEnd {
        self.set_phase(Phase::Arming);
        let id = self.next_session_id;
        self.next_session_id += 1;
        let gallery = self.store.snapshot();
        tracing::info!(session_id = id, identities = gallery.len(), "session armed");
        self.status.send_modify(|s| s.sessions += 1);

        let mut session = SessionState {
            id,
            gallery,
            deadline: Instant::now() + self.settings.session_timeout,
            frames_seen: 0,
            evidence_frames: 0,
            frame_timeouts: 0,
            inference_failures: 0,
            best: None,
        };

        self.set_phase(Phase::Capturing);
        let end = self.capture_phase(&mut session, events).await;
        self.capture.release();

        tracing::debug!(
            session_id = id,
            frames = session.frames_seen,
            evidence = session.evidence_frames,
            timeouts = session.frame_timeouts,
            inference_failures = session.inference_failures,
            "capture phase finished"
        );

        let frames = session.evidence_frames;
        match end {
            CaptureEnd::Matched(m) => {
                let identity = m.identity_id.unwrap_or_default();
                SessionEnd::Decided {
                    decision: Decision::authorized(id, identity, frames, m.distance),
                    failure: None,
                }
            }
            CaptureEnd::Exhausted => {
                self.set_phase(Phase::Evaluating);
                let decision = if session.evidence_frames == 0 {
                    Decision::inconclusive(id, 0, None)
                } else {
                    Decision::unauthorized(id, frames, session.best_distance())
                };
                SessionEnd::Decided {
                    decision,
                    failure: None,
                }
            }
            CaptureEnd::DeadlineElapsed => {
                tracing::info!(session_id = id, "session deadline elapsed");
                SessionEnd::Decided {
                    decision: Decision::inconclusive(id, frames, session.best_distance()),
                    failure: None,
                }
            }
            CaptureEnd::Failed(cause) => SessionEnd::Decided {
                decision: Decision::inconclusive(id, frames, session.best_distance()),
                failure: Some(cause),
            },
            CaptureEnd::SensorFault(reason) => {
                tracing::warn!(session_id = id, "sensor fault during session, aborting without decision");
                SessionEnd::Aborted(FaultCause::Sensor(reason))
            }
        }
    }

    async fn capture_phase(
        &mut self,
        session: &mut SessionState,
        events: &mut mpsc::Receiver<SensorEvent>,
    ) -> CaptureEnd {
        let deadline = session.deadline;
        let mut batch: Option<FrameBatch> = None;

        loop {
            if session.evidence_frames >= self.settings.max_frames_per_session {
                return CaptureEnd::Exhausted;
            }
            if Instant::now() >= deadline {
                return CaptureEnd::DeadlineElapsed;
            }

            let observation = {
                let step = next_observation(&self.capture, &self.inference, &self.settings, &mut batch, deadline);
                tokio::pin!(step);
                loop {
                    tokio::select! {
                        biased;
                        obs = &mut step => break obs,
                        _ = tokio::time::sleep_until(deadline) => break Observation::DeadlineElapsed,
                        Some(event) = events.recv() => match event {
                            SensorEvent::Fault(reason) => {
                                self.sensor_faulted = true;
                                break Observation::SensorFault(reason);
                            }
                            SensorEvent::Motion(m) => {
                                let started = m.kind == MotionKind::Start;
                                self.motion_active = started;
                                self.status.send_modify(|s| {
                                    s.motion_active = started;
                                    if started {
                                        s.ignored_motion_starts += 1;
                                    }
                                });
                            }
                            SensorEvent::Recovered => self.sensor_faulted = false,
                        },
                    }
                }
            };

            match observation {
                Observation::Faces(faces) => {
                    if let Some(m) = session.observe(&faces, &self.settings) {
                        tracing::info!(
                            session_id = session.id,
                            identity = m.identity_id.as_deref().unwrap_or(""),
                            distance = m.distance,
                            "face matched"
                        );
                        return CaptureEnd::Matched(m);
                    }
                }
                Observation::FrameTimeout => {
                    session.frame_timeouts += 1;
                    tracing::debug!(session_id = session.id, "frame slot timed out");
                }
                Observation::BatchDone => {}
                Observation::CameraStalled => {
                    tracing::warn!(session_id = session.id, "camera delivered no frames, evaluating");
                    return CaptureEnd::Exhausted;
                }
                Observation::CameraUnavailable(reason) => {
                    tracing::warn!(session_id = session.id, %reason, "camera unavailable");
                    return CaptureEnd::Failed(FaultCause::Camera(reason));
                }
                Observation::InferenceFailed(reason) => {
                    session.inference_failures += 1;
                    if session.inference_failures > self.settings.inference_retry_budget {
                        tracing::warn!(session_id = session.id, %reason, "inference retry budget exhausted");
                        return CaptureEnd::Failed(FaultCause::Model(reason));
                    }
                    tracing::debug!(
                        session_id = session.id,
                        attempt = session.inference_failures,
                        %reason,
                        "inference failed, retrying with next frame"
                    );
                }
                Observation::DeadlineElapsed => return CaptureEnd::DeadlineElapsed,
                Observation::SensorFault(reason) => return CaptureEnd::SensorFault(reason),
            }
        }
    }

    /// Wait out the cooldown. Returns `false` if the engine faulted or the
    /// event stream closed.
    async fn cooldown(&mut self, events: &mut mpsc::Receiver<SensorEvent>) -> bool {
        self.set_phase(Phase::Cooldown);
        let until = Instant::now() + self.settings.cooldown;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(until) => return true,
                event = events.recv() => match event {
                    None => return false,
                    Some(SensorEvent::Motion(m)) => {
                        let started = m.kind == MotionKind::Start;
                        if started {
                            tracing::debug!("motion start during cooldown ignored");
                            self.status.send_modify(|s| s.ignored_motion_starts += 1);
                        }
                        self.set_motion(started);
                    }
                    Some(SensorEvent::Fault(reason)) => {
                        self.sensor_faulted = true;
                        self.enter_fault(FaultCause::Sensor(reason)).await;
                        return false;
                    }
                    Some(SensorEvent::Recovered) => self.sensor_faulted = false,
                },
            }
        }
    }

    async fn enter_fault(&mut self, cause: FaultCause) {
        tracing::error!(cause = ?cause, "entering faulted state");
        self.fault = Some(cause.clone());
        self.command(ActuatorCommand::FailSafe).await;
        self.status.send_modify(|s| s.fault = Some(cause));
        self.set_phase(Phase::Faulted);
    }

    /// Stay in `Faulted` until the failing component probes healthy.
    /// Returns `false` if the event stream closed. Motion seen while faulted
    /// is tracked so an ongoing episode is picked up once healthy.
    async fn recover(&mut self, events: &mut mpsc::Receiver<SensorEvent>) -> bool {
        let period = self.settings.fault_probe_interval;
        let mut probe = tokio::time::interval_at(Instant::now() + period, period);
        probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = probe.tick() => {
                    if self.probe_fault().await {
                        break;
                    }
                }
                event = events.recv() => match event {
                    None => return false,
                    Some(SensorEvent::Motion(m)) => self.set_motion(m.kind == MotionKind::Start),
                    Some(SensorEvent::Fault(reason)) => {
                        self.sensor_faulted = true;
                        tracing::debug!(%reason, "sensor fault while faulted");
                    }
                    Some(SensorEvent::Recovered) => {
                        self.sensor_faulted = false;
                        if matches!(self.fault, Some(FaultCause::Sensor(_))) {
                            break;
                        }
                    }
                },
            }
        }

        tracing::info!(cause = ?self.fault, "fault cleared, returning to idle");
        self.fault = None;
        self.failed_sessions = 0;
        self.status.send_modify(|s| {
            s.fault = None;
            s.consecutive_failed_sessions = 0;
        });
        self.set_phase(Phase::Idle);
        true
    }

    async fn probe_fault(&mut self) -> bool {
        if self.sensor_faulted {
            return false;
        }
        match &self.fault {
            None | Some(FaultCause::Sensor(_)) => true,
            Some(FaultCause::Camera(_)) => {
                let healthy = self.capture.open(self.settings.session_timeout).await;
                self.capture.release();
                match healthy {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::debug!(error = %e, "camera probe failed");
                        false
                    }
                }
            }
            Some(FaultCause::Model(_)) => match self.inference.probe(self.settings.inference_timeout).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(error = %e, "model probe failed");
                    false
                }
            },
        }
    }

    async fn emit(&mut self, decision: Decision) {
        tracing::info!(
            session_id = decision.session_id,
            outcome = %decision.outcome,
            identity = decision.identity_id.as_deref().unwrap_or(""),
            evidence_frames = decision.evidence_frame_count,
            best_distance = ?decision.best_distance,
            "decision"
        );
        self.status.send_modify(|s| {
            match decision.outcome {
                Outcome::Authorized => s.authorized += 1,
                Outcome::Unauthorized => s.unauthorized += 1,
                Outcome::Inconclusive => s.inconclusive += 1,
            }
            s.last_decision = Some(decision.clone());
        });
        self.command(ActuatorCommand::Apply(decision)).await;
    }

    async fn command(&self, cmd: ActuatorCommand) {
        if self.actuator.send(cmd).await.is_err() {
            tracing::error!("actuator task gone, command dropped");
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            tracing::debug!(from = ?self.phase, to = ?phase, "phase change");
            self.phase = phase;
            self.status.send_modify(|s| s.phase = phase);
        }
    }

    fn set_motion(&mut self, active: bool) {
        self.motion_active = active;
        self.status.send_modify(|s| s.motion_active = active);
    }
}

/// Pull the next frame (starting a batch if needed) and run it through recognition.
async fn next_observation(
    capture: &CaptureHandle,
    inference: &InferenceHandle,
    settings: &EngineSettings,
    batch: &mut Option<FrameBatch>,
    deadline: Instant,
) -> Observation {
    if batch.is_none() {
        match capture
            .acquire_frames(settings.capture_batch_size, settings.frame_timeout, deadline)
            .await
        {
            Ok(b) => *batch = Some(b),
            Err(e) => return Observation::CameraUnavailable(e.to_string()),
        }
    }
    let Some(current) = batch.as_mut() else {
        return Observation::CameraStalled;
    };

    match current.next().await {
        None => {
            let empty = current.delivered() == 0;
            *batch = None;
            if empty {
                Observation::CameraStalled
            } else {
                Observation::BatchDone
            }
        }
        Some(Err(CaptureError::Timeout(_))) => Observation::FrameTimeout,
        Some(Err(e)) => {
            *batch = None;
            Observation::CameraUnavailable(e.to_string())
        }
        Some(Ok(frame)) => match inference.recognize(frame, settings.inference_timeout).await {
            Ok(faces) => Observation::Faces(faces),
            Err(e) => Observation::InferenceFailed(e.to_string()),
        },
    }
}

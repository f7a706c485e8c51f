//! PIR signal debouncing.
//!
//! Turns raw line samples into discrete `MotionStart`/`MotionEnd` events.
//! The raw line must hold active for `confirm` before a start is reported,
//! and hold inactive for `release` before the matching end.

use crate::types::{MotionEvent, MotionKind};
use chrono::Utc;
use std::time::{Duration, Instant};

pub struct MotionDebouncer {
    confirm: Duration,
    release: Duration,
    /// Debounced state.
    active: bool,
    /// Last sampled raw level and when it began.
    raw: Option<(bool, Instant)>,
    /// Rising edge that opened the current episode.
    episode_start: Option<Instant>,
}

impl MotionDebouncer {
    pub fn new(confirm: Duration, release: Duration) -> Self {
        Self {
            confirm,
            release,
            active: false,
            raw: None,
            episode_start: None,
        }
    }

    /// Whether motion is currently confirmed.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Forget all history, e.g. after the sensor recovered from a fault.
    ///
    /// Returns a `MotionEnd` if an episode was open so consumers never see
    /// a start without an end.
    pub fn reset(&mut self, now: Instant) -> Option<MotionEvent> {
        let event = self.active.then(|| self.end_event(now));
        self.active = false;
        self.raw = None;
        self.episode_start = None;
        event
    }

    /// Feed one raw sample taken at `now`.
    pub fn update(&mut self, level: bool, now: Instant) -> Option<MotionEvent> {
        let since = match self.raw {
            Some((prev, since)) if prev == level => since,
            _ => {
                self.raw = Some((level, now));
                now
            }
        };
        let held = now.saturating_duration_since(since);

        if !self.active && level && held >= self.confirm {
            self.active = true;
            self.episode_start = Some(since);
            return Some(MotionEvent {
                kind: MotionKind::Start,
                timestamp: Utc::now(),
                raw_duration_active_ms: held.as_millis() as u64,
            });
        }

        if self.active && !level && held >= self.release {
            let event = self.end_event(since);
            self.active = false;
            self.episode_start = None;
            return Some(event);
        }

        None
    }

    fn end_event(&self, fell_at: Instant) -> MotionEvent {
        let active_for = self
            .episode_start
            .map(|start| fell_at.saturating_duration_since(start))
            .unwrap_or_default();
        MotionEvent {
            kind: MotionKind::End,
            timestamp: Utc::now(),
            raw_duration_active_ms: active_for.as_millis() as u64,
        }
    }
}

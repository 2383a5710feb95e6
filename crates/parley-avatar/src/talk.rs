//! Talking-state tracking shared by renderers that know how long speech lasts.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::AvatarEvent;

/// Rough speaking time at ~150 words per minute.
pub(crate) fn estimate_duration(text: &str) -> Duration {
    let words = text.split_whitespace().count() as u64;
    Duration::from_millis((words * 400).max(500))
}

struct TalkState {
    busy_until: Option<Instant>,
    pending_stop: Option<CancellationToken>,
}

/// Emits `StartedTalking` when queued speech begins and a single
/// `StoppedTalking` once all queued speech has played.
pub(crate) struct TalkTracker {
    events: mpsc::UnboundedSender<AvatarEvent>,
    state: Mutex<TalkState>,
}

impl TalkTracker {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<AvatarEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                events,
                state: Mutex::new(TalkState {
                    busy_until: None,
                    pending_stop: None,
                }),
            },
            rx,
        )
    }

    /// Queue `duration` of speech after whatever is already playing.
    pub(crate) fn talk_for(&self, duration: Duration) {
        let now = Instant::now();
        let token = CancellationToken::new();
        let (started, end) = {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let playing_until = st.busy_until.filter(|until| *until > now);
            let end = playing_until.unwrap_or(now) + duration;
            st.busy_until = Some(end);
            if let Some(previous) = st.pending_stop.replace(token.clone()) {
                previous.cancel();
            }
            (playing_until.is_none(), end)
        };

        if started {
            let _ = self.events.send(AvatarEvent::StartedTalking);
        }
        debug!(speech_ms = duration.as_millis() as u64, "Avatar speech queued");

        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep_until(end) => {
                    let _ = events.send(AvatarEvent::StoppedTalking);
                }
            }
        });
    }

    /// Drop queued speech without emitting `StoppedTalking`.
    pub(crate) fn close(&self) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.busy_until = None;
        if let Some(token) = st.pending_stop.take() {
            token.cancel();
        }
    }
}

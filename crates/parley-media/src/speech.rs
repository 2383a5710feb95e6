//! Speech capture session: continuous listening on top of a one-shot recognizer.
//!
//! The underlying [`Recognizer`] ends every attempt after a single utterance,
//! a silence timeout or an error. The session turns that into a continuous
//! stream of [`SpeechEvent::Utterance`]s by restarting attempts for as long as
//! the caller wants to listen:
//!
//! - a final transcript is emitted, then the attempt ends normally;
//! - no-speech and unknown errors are transient and silently restarted;
//! - `not-allowed`, `audio-capture` and `network` are fatal: listening stops
//!   and one [`SpeechEvent::Fatal`] is emitted;
//! - an attempt that ends while listening is still wanted is restarted after
//!   a short debounce, or a longer backoff if the attempt could not start.
//!
//! Only one restart timer is ever pending, and only one attempt holds the
//! microphone at a time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::config::SpeechConfig;
use parley_core::error::ParleyError;

use crate::timer::TimerSlot;

/// Lifecycle of a [`SpeechSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechState {
    Idle,
    /// Waiting for microphone access.
    Starting,
    Listening,
    /// Between attempts, a restart timer is pending.
    Restarting,
    /// A fatal error ended listening; only an explicit start resumes it.
    StoppedFatal,
}

/// Errors reported by a recognition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionError {
    NotAllowed,
    AudioCapture,
    Network,
    Other(String),
}

impl RecognitionError {
    /// Permission and device errors end listening; everything else is retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NotAllowed | Self::AudioCapture | Self::Network)
    }

    /// Human-readable classification shown to the user.
    pub fn classification(&self) -> String {
        match self {
            Self::NotAllowed => "Microphone access denied. Please allow microphone access and try again."
                .into(),
            Self::AudioCapture => {
                "No microphone found. Please check your microphone connection.".into()
            }
            Self::Network => "Network error. Please check your internet connection.".into(),
            Self::Other(reason) => format!("Speech recognition error: {reason}"),
        }
    }
}

/// How a single recognition attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// A finalized, non-interim transcript.
    Final(String),
    NoSpeech,
    /// Stopped by the caller.
    Aborted,
    Failed(RecognitionError),
}

/// Microphone acquisition failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MicrophoneError {
    #[error("Microphone access denied. Please allow microphone access and try again.")]
    PermissionDenied,
    #[error("No microphone found. Please check your microphone connection.")]
    NotFound,
    #[error("Failed to access microphone: {0}")]
    Unavailable(String),
}

impl From<MicrophoneError> for ParleyError {
    fn from(e: MicrophoneError) -> Self {
        match e {
            MicrophoneError::PermissionDenied => ParleyError::Permission(e.to_string()),
            MicrophoneError::NotFound => ParleyError::DeviceNotFound(e.to_string()),
            MicrophoneError::Unavailable(_) => ParleyError::Capture(e.to_string()),
        }
    }
}

/// The platform's one-shot speech-to-text primitive.
#[async_trait]
pub trait Recognizer: Send + Sync + 'static {
    /// Check that the microphone can be opened.
    async fn request_microphone(&self) -> Result<(), MicrophoneError>;

    /// Run one recognition attempt until it ends or `cancel` fires.
    ///
    /// `Err` means the attempt could not be started at all.
    async fn recognize(&self, cancel: CancellationToken) -> anyhow::Result<AttemptOutcome>;
}

/// Events emitted by a [`SpeechSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechEvent {
    Utterance(String),
    Fatal(String),
    /// Listening was switched on or off (start, stop, or fatal error).
    ListeningChanged(bool),
}

#[derive(Debug, Clone, Copy)]
pub struct SpeechSettings {
    pub restart_delay: Duration,
    pub restart_backoff: Duration,
}

impl Default for SpeechSettings {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_millis(100),
            restart_backoff: Duration::from_millis(1000),
        }
    }
}

impl SpeechSettings {
    pub fn from_config(config: &SpeechConfig) -> Self {
        Self {
            restart_delay: Duration::from_millis(config.restart_delay_ms),
            restart_backoff: Duration::from_millis(config.restart_backoff_ms),
        }
    }
}

struct SessionState {
    state: SpeechState,
    should_continue: bool,
    /// Identifies the current start or attempt; anything older is ignored.
    epoch: u64,
    active: Option<CancellationToken>,
    /// `ListeningChanged(true)` went out and has not been retracted.
    announced: bool,
}

struct Shared {
    recognizer: Arc<dyn Recognizer>,
    settings: SpeechSettings,
    state: Mutex<SessionState>,
    restart: TimerSlot,
    microphone: Arc<tokio::sync::Mutex<()>>,
    events: mpsc::UnboundedSender<SpeechEvent>,
    attempts: AtomicUsize,
}

/// Continuous speech capture. Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct SpeechSession {
    shared: Arc<Shared>,
}

impl SpeechSession {
    pub fn new(
        recognizer: Arc<dyn Recognizer>,
        settings: SpeechSettings,
    ) -> (Self, mpsc::UnboundedReceiver<SpeechEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let session = Self {
            shared: Arc::new(Shared {
                recognizer,
                settings,
                state: Mutex::new(SessionState {
                    state: SpeechState::Idle,
                    should_continue: false,
                    epoch: 0,
                    active: None,
                    announced: false,
                }),
                restart: TimerSlot::new(),
                microphone: Arc::new(tokio::sync::Mutex::new(())),
                events,
                attempts: AtomicUsize::new(0),
            }),
        };
        (session, events_rx)
    }

    /// Start continuous listening. No-op if already listening.
    ///
    /// A refused microphone is returned to the caller and never retried.
    pub async fn start_listening(&self) -> Result<(), MicrophoneError> {
        let start_epoch = {
            let mut st = self.lock();
            if is_active(st.state) {
                debug!(state = ?st.state, "Already listening");
                return Ok(());
            }
            st.state = SpeechState::Starting;
            st.epoch += 1;
            st.epoch
        };

        if let Err(e) = self.shared.recognizer.request_microphone().await {
            warn!(error = %e, "Microphone access error");
            let mut st = self.lock();
            // A later stop or start owns the state now.
            if st.epoch == start_epoch {
                st.state = SpeechState::StoppedFatal;
                st.should_continue = false;
            }
            return Err(e);
        }

        {
            let mut st = self.lock();
            if st.epoch != start_epoch || st.state != SpeechState::Starting {
                debug!("Stopped while waiting for the microphone");
                return Ok(());
            }
            st.should_continue = true;
            st.announced = true;
            // Sent under the lock so a racing stop cannot retract it first.
            self.emit(SpeechEvent::ListeningChanged(true));
        }
        info!("Speech recognition started");
        self.launch_attempt();
        Ok(())
    }

    /// Stop listening, cancel any pending restart and abort the active attempt.
    pub fn stop_listening(&self) {
        let (was_listening, active) = {
            let mut st = self.lock();
            let was_listening = std::mem::take(&mut st.announced);
            st.should_continue = false;
            st.state = SpeechState::Idle;
            st.epoch += 1;
            (was_listening, st.active.take())
        };
        self.shared.restart.cancel();
        if let Some(token) = active {
            token.cancel();
        }
        if was_listening {
            info!("Speech recognition stopped");
            self.emit(SpeechEvent::ListeningChanged(false));
        }
    }

    /// Check microphone availability without starting an attempt.
    pub async fn probe_microphone(&self) -> Result<(), MicrophoneError> {
        self.shared.recognizer.request_microphone().await
    }

    pub fn state(&self) -> SpeechState {
        self.lock().state
    }

    pub fn is_listening(&self) -> bool {
        is_active(self.state())
    }

    /// Number of recognition attempts launched so far.
    pub fn start_attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    fn launch_attempt(&self) {
        let (token, epoch) = {
            let mut st = self.lock();
            if !st.should_continue {
                return;
            }
            st.epoch += 1;
            let token = CancellationToken::new();
            st.active = Some(token.clone());
            st.state = SpeechState::Listening;
            (token, st.epoch)
        };
        let attempt = self.shared.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(attempt, "Starting recognition attempt");

        let session = self.clone();
        tokio::spawn(async move {
            let microphone = session.shared.microphone.clone().lock_owned().await;
            let outcome = if token.is_cancelled() {
                Ok(AttemptOutcome::Aborted)
            } else {
                session.shared.recognizer.recognize(token).await
            };
            drop(microphone);
            session.handle_outcome(epoch, outcome);
        });
    }

    fn handle_outcome(&self, epoch: u64, outcome: anyhow::Result<AttemptOutcome>) {
        let mut st = self.lock();
        if st.epoch != epoch {
            debug!(?outcome, "Ignoring outcome of superseded attempt");
            return;
        }
        st.active = None;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Error restarting speech recognition");
                if st.should_continue {
                    st.state = SpeechState::Restarting;
                    drop(st);
                    let session = self.clone();
                    self.shared
                        .restart
                        .schedule(self.shared.settings.restart_backoff, async move {
                            session.schedule_restart();
                        });
                } else {
                    st.state = SpeechState::Idle;
                }
                return;
            }
        };

        match outcome {
            AttemptOutcome::Failed(error) if error.is_fatal() => {
                st.should_continue = false;
                st.state = SpeechState::StoppedFatal;
                let announced = std::mem::take(&mut st.announced);
                drop(st);
                self.shared.restart.cancel();
                warn!(?error, "Speech recognition stopped by fatal error");
                self.emit(SpeechEvent::Fatal(error.classification()));
                if announced {
                    self.emit(SpeechEvent::ListeningChanged(false));
                }
                return;
            }
            AttemptOutcome::Failed(error) => {
                debug!(?error, "Unknown recognition error, continuing");
            }
            AttemptOutcome::NoSpeech => {
                debug!("No speech detected, continuing");
            }
            AttemptOutcome::Aborted => {
                debug!("Recognition attempt aborted");
            }
            AttemptOutcome::Final(text) => {
                let text = text.trim();
                if !text.is_empty() {
                    info!(chars = text.len(), "Final transcript");
                    self.emit(SpeechEvent::Utterance(text.to_string()));
                }
            }
        }

        // End of attempt.
        if st.should_continue {
            drop(st);
            self.schedule_restart();
        } else {
            st.state = SpeechState::Idle;
        }
    }

    fn schedule_restart(&self) {
        {
            let mut st = self.lock();
            if !st.should_continue {
                return;
            }
            st.state = SpeechState::Restarting;
        }
        let session = self.clone();
        self.shared
            .restart
            .schedule(self.shared.settings.restart_delay, async move {
                debug!("Restarting speech recognition");
                session.launch_attempt();
            });
    }

    fn emit(&self, event: SpeechEvent) {
        if self.shared.events.send(event).is_err() {
            debug!("Speech event receiver dropped");
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn is_active(state: SpeechState) -> bool {
    matches!(
        state,
        SpeechState::Starting | SpeechState::Listening | SpeechState::Restarting
    )
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;

    use super::*;

    /// Plays back scripted outcomes, then waits for cancellation.
    #[derive(Default)]
    struct ScriptedRecognizer {
        script: Mutex<VecDeque<anyhow::Result<AttemptOutcome>>>,
        deny_microphone: AtomicBool,
    }

    impl ScriptedRecognizer {
        fn with(outcomes: Vec<anyhow::Result<AttemptOutcome>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(outcomes.into()),
                deny_microphone: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Recognizer for ScriptedRecognizer {
        async fn request_microphone(&self) -> Result<(), MicrophoneError> {
            if self.deny_microphone.load(Ordering::SeqCst) {
                Err(MicrophoneError::PermissionDenied)
            } else {
                Ok(())
            }
        }

        async fn recognize(&self, cancel: CancellationToken) -> anyhow::Result<AttemptOutcome> {
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(outcome) => outcome,
                None => {
                    cancel.cancelled().await;
                    Ok(AttemptOutcome::Aborted)
                }
            }
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SpeechEvent>) -> Vec<SpeechEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn session(recognizer: Arc<ScriptedRecognizer>) -> (SpeechSession, mpsc::UnboundedReceiver<SpeechEvent>) {
        SpeechSession::new(recognizer, SpeechSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_speech_restarts_then_final_transcript() {
        let recognizer = ScriptedRecognizer::with(vec![
            Ok(AttemptOutcome::NoSpeech),
            Ok(AttemptOutcome::NoSpeech),
            Ok(AttemptOutcome::NoSpeech),
            Ok(AttemptOutcome::Final("test".into())),
        ]);
        let (session, mut rx) = session(recognizer);

        session.start_listening().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let events = drain(&mut rx);
        let utterances: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, SpeechEvent::Utterance(_)))
            .collect();
        assert_eq!(utterances, vec![&SpeechEvent::Utterance("test".into())]);
        assert!(!events.iter().any(|e| matches!(e, SpeechEvent::Fatal(_))));
        // Four scripted attempts plus the one now listening.
        assert_eq!(session.start_attempts(), 5);
        assert_eq!(session.state(), SpeechState::Listening);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_endings_bound_start_attempts() {
        for n in [0usize, 1, 4] {
            let mut script: Vec<anyhow::Result<AttemptOutcome>> = Vec::new();
            for i in 0..n {
                script.push(Ok(if i % 2 == 0 {
                    AttemptOutcome::NoSpeech
                } else {
                    AttemptOutcome::Failed(RecognitionError::Other("glitch".into()))
                }));
            }
            let (session, mut rx) = session(ScriptedRecognizer::with(script));

            session.start_listening().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;

            assert_eq!(session.start_attempts(), n + 1, "n = {n}");
            assert!(
                !drain(&mut rx)
                    .iter()
                    .any(|e| matches!(e, SpeechEvent::Fatal(_)))
            );
            session.stop_listening();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_waits_for_debounce() {
        let recognizer = ScriptedRecognizer::with(vec![Ok(AttemptOutcome::NoSpeech)]);
        let (session, _rx) = session(recognizer);

        session.start_listening().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.start_attempts(), 1);
        assert_eq!(session.state(), SpeechState::Restarting);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(session.start_attempts(), 2);
        assert_eq!(session.state(), SpeechState::Listening);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_halts_restarts() {
        let recognizer = ScriptedRecognizer::with(vec![
            Ok(AttemptOutcome::NoSpeech),
            Ok(AttemptOutcome::Failed(RecognitionError::NotAllowed)),
        ]);
        let (session, mut rx) = session(recognizer);

        session.start_listening().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(session.start_attempts(), 2);
        assert_eq!(session.state(), SpeechState::StoppedFatal);
        assert!(!session.is_listening());

        let events = drain(&mut rx);
        let fatals: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, SpeechEvent::Fatal(_)))
            .collect();
        assert_eq!(fatals.len(), 1);
        assert_eq!(events.last(), Some(&SpeechEvent::ListeningChanged(false)));

        // Only an explicit start resumes.
        session.start_listening().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.start_attempts(), 3);
        assert!(session.is_listening());
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_device_error_is_fatal() {
        for error in [
            RecognitionError::NotAllowed,
            RecognitionError::AudioCapture,
            RecognitionError::Network,
        ] {
            let recognizer =
                ScriptedRecognizer::with(vec![Ok(AttemptOutcome::Failed(error.clone()))]);
            let (session, mut rx) = session(recognizer);
            session.start_listening().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;

            assert_eq!(session.start_attempts(), 1, "{error:?}");
            assert!(drain(&mut rx).contains(&SpeechEvent::Fatal(error.classification())));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_backs_off() {
        let recognizer = ScriptedRecognizer::with(vec![Err(anyhow::anyhow!("already started"))]);
        let (session, _rx) = session(recognizer);

        session.start_listening().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(session.start_attempts(), 1);

        // backoff (1000ms) then the regular debounce (100ms)
        tokio::time::sleep(Duration::from_millis(550)).await;
        assert_eq!(session.start_attempts(), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.start_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_restart() {
        let recognizer = ScriptedRecognizer::with(vec![Ok(AttemptOutcome::NoSpeech)]);
        let (session, mut rx) = session(recognizer);

        session.start_listening().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.state(), SpeechState::Restarting);

        session.stop_listening();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(session.start_attempts(), 1);
        assert_eq!(session.state(), SpeechState::Idle);
        assert_eq!(
            drain(&mut rx),
            vec![
                SpeechEvent::ListeningChanged(true),
                SpeechEvent::ListeningChanged(false)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_aborts_active_attempt_without_restart() {
        let (session, mut rx) = session(ScriptedRecognizer::with(vec![]));

        session.start_listening().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.state(), SpeechState::Listening);

        session.stop_listening();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(session.start_attempts(), 1);
        assert!(
            !drain(&mut rx)
                .iter()
                .any(|e| matches!(e, SpeechEvent::Fatal(_)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let (session, _rx) = session(ScriptedRecognizer::with(vec![]));

        session.start_listening().await.unwrap();
        session.start_listening().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.start_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_is_reported_not_retried() {
        let recognizer = ScriptedRecognizer::with(vec![]);
        recognizer.deny_microphone.store(true, Ordering::SeqCst);
        let (session, mut rx) = session(recognizer);

        let err = session.start_listening().await.unwrap_err();
        assert_eq!(err, MicrophoneError::PermissionDenied);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(session.start_attempts(), 0);
        assert_eq!(session.state(), SpeechState::StoppedFatal);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop_ignores_stale_outcome() {
        let (session, mut rx) = session(ScriptedRecognizer::with(vec![]));

        session.start_listening().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.stop_listening();
        session.start_listening().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(session.start_attempts(), 2);
        assert_eq!(session.state(), SpeechState::Listening);
        assert_eq!(
            drain(&mut rx),
            vec![
                SpeechEvent::ListeningChanged(true),
                SpeechEvent::ListeningChanged(false),
                SpeechEvent::ListeningChanged(true),
            ]
        );
    }

    /// Each microphone request waits for the next scripted grant.
    struct GatedMicrophone {
        grants: Mutex<VecDeque<tokio::sync::oneshot::Receiver<Result<(), MicrophoneError>>>>,
    }

    impl GatedMicrophone {
        fn with(grants: Vec<tokio::sync::oneshot::Receiver<Result<(), MicrophoneError>>>) -> Arc<Self> {
            Arc::new(Self {
                grants: Mutex::new(grants.into()),
            })
        }
    }

    #[async_trait]
    impl Recognizer for GatedMicrophone {
        async fn request_microphone(&self) -> Result<(), MicrophoneError> {
            let grant = self.grants.lock().unwrap().pop_front();
            match grant {
                Some(grant) => grant
                    .await
                    .unwrap_or(Err(MicrophoneError::Unavailable("closed".into()))),
                None => Ok(()),
            }
        }

        async fn recognize(&self, cancel: CancellationToken) -> anyhow::Result<AttemptOutcome> {
            cancel.cancelled().await;
            Ok(AttemptOutcome::Aborted)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_starting_is_silent() {
        let (grant, pending) = tokio::sync::oneshot::channel();
        let (session, mut rx) =
            SpeechSession::new(GatedMicrophone::with(vec![pending]), SpeechSettings::default());

        let start = tokio::spawn({
            let session = session.clone();
            async move { session.start_listening().await }
        });
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(session.state(), SpeechState::Starting);

        session.stop_listening();
        grant.send(Ok(())).unwrap();
        assert!(start.await.unwrap().is_ok());
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(session.state(), SpeechState::Idle);
        assert_eq!(session.start_attempts(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_microphone_failure_leaves_newer_start_alone() {
        let (first_grant, first) = tokio::sync::oneshot::channel();
        let (second_grant, second) = tokio::sync::oneshot::channel();
        let (session, mut rx) = SpeechSession::new(
            GatedMicrophone::with(vec![first, second]),
            SpeechSettings::default(),
        );

        let first_start = tokio::spawn({
            let session = session.clone();
            async move { session.start_listening().await }
        });
        tokio::time::sleep(Duration::from_millis(1)).await;
        session.stop_listening();
        let second_start = tokio::spawn({
            let session = session.clone();
            async move { session.start_listening().await }
        });
        tokio::time::sleep(Duration::from_millis(1)).await;

        first_grant.send(Err(MicrophoneError::NotFound)).unwrap();
        assert_eq!(
            first_start.await.unwrap(),
            Err(MicrophoneError::NotFound)
        );
        assert_eq!(session.state(), SpeechState::Starting);

        second_grant.send(Ok(())).unwrap();
        assert!(second_start.await.unwrap().is_ok());
        assert!(session.is_listening());
        assert_eq!(session.start_attempts(), 1);
        assert_eq!(drain(&mut rx), vec![SpeechEvent::ListeningChanged(true)]);
    }

    #[test]
    fn test_error_classification() {
        assert!(RecognitionError::Network.is_fatal());
        assert!(!RecognitionError::Other("bad-grammar".into()).is_fatal());
        assert!(
            RecognitionError::NotAllowed
                .classification()
                .contains("Microphone access denied")
        );
    }
}

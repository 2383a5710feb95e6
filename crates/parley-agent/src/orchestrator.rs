//! The turn orchestrator state machine.
//!
//! `Ready → (input accepted) → Processing → (reply or failure) → Ready`.
//! The Pending-Turn flag is the only mutual-exclusion gate: it is set when an
//! input is accepted and cleared in exactly one place, after the turn task has
//! recorded its outcome. While it is set, utterances and vision frames
//! overwrite a single pending slot and everything else is rejected.
//!
//! Replies are spoken by a separate speaker task after the gate is released,
//! so a slow or failing avatar never holds up the next turn.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use parley_avatar::{
    AvatarEvent, AvatarRenderer, AvatarSession, MediaStreamInfo, SessionHandle, VoiceConfig,
    describe_start_error,
};
use parley_core::config::{Config, ResponderConfig};
use parley_core::conversation::ConversationLog;
use parley_core::error::{ParleyError, Result};
use parley_core::types::{MediaKind, Turn, UiMode};
use parley_media::speech::{SpeechEvent, SpeechSession};
use parley_media::timer::TimerSlot;
use parley_media::vision::{EncodedFrame, FrameSink};
use parley_providers::Responder;

use crate::request::{TurnRequest, build_request};
use crate::{InputKind, Notice, RejectReason, SubmitOutcome, UserInput};

const GENERIC_ERROR_TITLE: &str = "Uh oh! Something went wrong.";
const SPEECH_ERROR_TITLE: &str = "Speech Recognition Error";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub system_prompt: String,
    /// Wait after the avatar stops talking before listening again.
    pub auto_resume_delay: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            system_prompt: ResponderConfig::default().system_prompt,
            auto_resume_delay: Duration::from_millis(2000),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            system_prompt: config.responder.system_prompt.clone(),
            auto_resume_delay: Duration::from_millis(config.speech.auto_resume_delay_ms),
        }
    }
}

/// Read-only view for the display.
#[derive(Debug, Clone)]
pub struct DisplaySnapshot {
    pub turns: Vec<Turn>,
    pub is_processing: bool,
    pub is_listening: bool,
    pub mode: UiMode,
    pub avatar_media: Option<MediaStreamInfo>,
}

struct ActiveAvatar {
    handle: SessionHandle,
    media: Option<MediaStreamInfo>,
    forwarder: JoinHandle<()>,
}

struct State {
    log: ConversationLog,
    processing: bool,
    pending: Option<UserInput>,
    mode: UiMode,
    avatar: Option<ActiveAvatar>,
    speech: Option<SpeechSession>,
    speech_forwarder: Option<JoinHandle<()>>,
}

struct SpeakRequest {
    session: SessionHandle,
    text: String,
}

struct Inner {
    responder: Arc<dyn Responder>,
    avatar: Arc<dyn AvatarRenderer>,
    settings: OrchestratorSettings,
    state: Mutex<State>,
    processing: watch::Sender<bool>,
    notices: mpsc::UnboundedSender<Notice>,
    speaker: mpsc::UnboundedSender<SpeakRequest>,
    resume: TimerSlot,
    alive: CancellationToken,
}

/// Cheap to clone; clones drive the same conversation.
#[derive(Clone)]
pub struct TurnOrchestrator {
    inner: Arc<Inner>,
}

impl TurnOrchestrator {
    /// Must be called within a tokio runtime: the speaker task is spawned here.
    pub fn new(
        responder: Arc<dyn Responder>,
        avatar: Arc<dyn AvatarRenderer>,
        settings: OrchestratorSettings,
    ) -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (notices, notices_rx) = mpsc::unbounded_channel();
        let (processing, _) = watch::channel(false);
        let (speaker, speaker_rx) = mpsc::unbounded_channel();
        let alive = CancellationToken::new();
        tokio::spawn(run_speaker(
            avatar.clone(),
            notices.clone(),
            alive.clone(),
            speaker_rx,
        ));
        let orchestrator = Self {
            inner: Arc::new(Inner {
                responder,
                avatar,
                settings,
                state: Mutex::new(State {
                    log: ConversationLog::new(),
                    processing: false,
                    pending: None,
                    mode: UiMode::default(),
                    avatar: None,
                    speech: None,
                    speech_forwarder: None,
                }),
                processing,
                notices,
                speaker,
                resume: TimerSlot::new(),
                alive,
            }),
        };
        (orchestrator, notices_rx)
    }

    /// Feed utterances and fatal errors from `session` into the orchestrator.
    /// Replaces any previously attached session.
    pub fn attach_speech(
        &self,
        session: SpeechSession,
        mut events: mpsc::UnboundedReceiver<SpeechEvent>,
    ) {
        let weak = Arc::downgrade(&self.inner);
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                TurnOrchestrator { inner }.on_speech_event(event);
            }
        });

        let previous = {
            let mut st = self.lock();
            if let Some(old) = st.speech_forwarder.replace(forwarder) {
                old.abort();
            }
            st.speech.replace(session)
        };
        if let Some(previous) = previous {
            previous.stop_listening();
        }
    }

    /// Offer an input for the next turn.
    pub fn submit(&self, input: UserInput) -> SubmitOutcome {
        if self.inner.alive.is_cancelled() {
            return SubmitOutcome::Rejected(RejectReason::ShutDown);
        }
        if input.is_empty() {
            debug!(kind = ?input.kind(), "Ignoring empty input");
            return SubmitOutcome::Rejected(RejectReason::Empty);
        }

        let mut st = self.lock();
        if st.processing {
            return match input {
                UserInput::Utterance(_) | UserInput::VisionFrame(_) => {
                    let kind = input.kind();
                    if st.pending.replace(input).is_some() {
                        debug!(?kind, "Replaced unconsumed pending input");
                    } else {
                        debug!(?kind, "Input queued behind current turn");
                    }
                    SubmitOutcome::Queued
                }
                _ => {
                    debug!(kind = ?input.kind(), "Turn in progress, input rejected");
                    SubmitOutcome::Rejected(RejectReason::Busy)
                }
            };
        }
        self.accept(&mut st, input);
        SubmitOutcome::Accepted
    }

    /// Manually start listening. Failures are reported as a notice and returned.
    pub async fn start_listening(&self) -> Result<()> {
        self.inner.resume.cancel();
        let speech = {
            let mut st = self.lock();
            st.mode = UiMode::AvatarFocus;
            st.speech.clone()
        };
        let Some(speech) = speech else {
            let e = ParleyError::DeviceNotFound("No speech input configured".into());
            self.notify(Notice::error(SPEECH_ERROR_TITLE, e.to_string()));
            return Err(e);
        };

        speech.start_listening().await.map_err(|e| {
            warn!(error = %e, "Error starting speech recognition");
            self.notify(Notice::error(SPEECH_ERROR_TITLE, e.to_string()));
            ParleyError::from(e)
        })
    }

    pub fn stop_listening(&self) {
        self.inner.resume.cancel();
        let speech = self.lock().speech.clone();
        if let Some(speech) = speech {
            speech.stop_listening();
        }
    }

    /// Start an avatar session, tearing down the previous one and its event
    /// subscription first.
    pub async fn start_avatar(&self, voice: &VoiceConfig) -> Result<()> {
        let previous = self.lock().avatar.take();
        if let Some(previous) = previous {
            previous.forwarder.abort();
            if let Err(e) = self.inner.avatar.stop(&previous.handle).await {
                warn!(session = %previous.handle, error = %e, "Failed to stop previous avatar session");
            }
        }

        let AvatarSession {
            handle,
            media,
            mut events,
        } = match self.inner.avatar.start(voice).await {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, avatar = %voice.avatar_id, "Error starting avatar");
                let description = describe_start_error(&e);
                self.notify(Notice::error("Error starting avatar", description.clone()));
                return Err(ParleyError::Avatar(description));
            }
        };

        let weak = Arc::downgrade(&self.inner);
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                TurnOrchestrator { inner }.on_avatar_event(event);
            }
        });

        info!(session = %handle, renderer = self.inner.avatar.id(), "Avatar ready");
        let replaced = self.lock().avatar.replace(ActiveAvatar {
            handle,
            media,
            forwarder,
        });
        // An overlapping start finished first; its session is ours to close.
        if let Some(replaced) = replaced {
            replaced.forwarder.abort();
            if let Err(e) = self.inner.avatar.stop(&replaced.handle).await {
                warn!(session = %replaced.handle, error = %e, "Failed to stop replaced avatar session");
            }
        }
        Ok(())
    }

    /// Stop the avatar session. No-op without one.
    pub async fn stop_avatar(&self) -> Result<()> {
        let active = self.lock().avatar.take();
        let Some(active) = active else {
            return Ok(());
        };
        active.forwarder.abort();

        if let Err(e) = self.inner.avatar.stop(&active.handle).await {
            warn!(session = %active.handle, error = %e, "Failed to stop avatar");
            self.notify(Notice::error(GENERIC_ERROR_TITLE, e.to_string()));
            return Err(ParleyError::Avatar(e.to_string()));
        }
        Ok(())
    }

    pub fn set_mode(&self, mode: UiMode) {
        self.lock().mode = mode;
    }

    pub fn snapshot(&self) -> DisplaySnapshot {
        let st = self.lock();
        DisplaySnapshot {
            turns: st.log.snapshot(),
            is_processing: st.processing,
            is_listening: st.speech.as_ref().is_some_and(|s| s.is_listening()),
            mode: st.mode,
            avatar_media: st.avatar.as_ref().and_then(|a| a.media.clone()),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.lock().processing
    }

    pub fn subscribe_processing(&self) -> watch::Receiver<bool> {
        self.inner.processing.subscribe()
    }

    /// Wait until no turn is in progress and nothing is pending.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.processing.subscribe();
        let _ = rx.wait_for(|processing| !*processing).await;
    }

    /// Stop listening and the avatar, and discard results of in-flight turns.
    pub async fn shutdown(&self) {
        self.inner.alive.cancel();
        self.inner.resume.cancel();

        let (speech, forwarder) = {
            let mut st = self.lock();
            st.pending = None;
            (st.speech.take(), st.speech_forwarder.take())
        };
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        if let Some(speech) = speech {
            speech.stop_listening();
        }
        if let Err(e) = self.stop_avatar().await {
            debug!(error = %e, "Avatar stop during shutdown failed");
        }
        info!("Orchestrator shut down");
    }

    // --- turn lifecycle ---

    fn accept(&self, st: &mut State, input: UserInput) {
        let request = build_request(st.log.as_slice(), &input, &self.inner.settings.system_prompt);
        let index = st.log.append(input.to_turn());
        if let Some(mode) = input.mode() {
            st.mode = mode;
        }
        st.processing = true;
        self.inner.processing.send_replace(true);

        let kind = input.kind();
        debug!(?kind, turn = index, "Turn accepted");
        if let UserInput::Media(attachment) = &input {
            let label = match attachment.kind {
                MediaKind::Photo => "Photo",
                MediaKind::Video => "Video",
            };
            self.notify(Notice::info(
                format!("{label} captured"),
                format!("{label} has been added to the chat"),
            ));
        }

        let this = self.clone();
        tokio::spawn(async move {
            this.run_turn(kind, request).await;
        });
    }

    async fn run_turn(&self, kind: InputKind, request: TurnRequest) {
        let result = self.execute(request).await;

        if self.inner.alive.is_cancelled() {
            debug!(?kind, "Discarding turn result after shutdown");
            self.release_gate();
            return;
        }

        match result {
            Ok(reply) => {
                let session = {
                    let mut st = self.lock();
                    st.log.append(Turn::assistant(reply.clone()));
                    st.avatar.as_ref().map(|a| a.handle.clone())
                };
                info!(?kind, chars = reply.len(), "Turn completed");
                self.release_gate();

                if reply.trim().is_empty() {
                    debug!("Empty reply, nothing to speak");
                } else if let Some(session) = session {
                    let request = SpeakRequest {
                        session,
                        text: reply,
                    };
                    if self.inner.speaker.send(request).is_err() {
                        debug!("Speaker task gone, reply not spoken");
                    }
                }
            }
            Err(e) => {
                error!(?kind, error = %e, "Turn failed");
                self.notify(failure_notice(kind, &e));
                self.release_gate();
            }
        }
    }

    async fn execute(&self, request: TurnRequest) -> anyhow::Result<String> {
        let responder = &self.inner.responder;
        match request {
            TurnRequest::Text { messages } => responder.complete(&messages).await,
            TurnRequest::Vision {
                messages,
                image,
                fallback,
            } => match responder.complete_vision(&messages, &image).await {
                Ok(reply) => Ok(reply),
                Err(e) => match fallback {
                    Some(fallback) => {
                        warn!(error = %e, "Vision analysis failed, falling back to text-only");
                        responder.complete(&fallback).await
                    }
                    None => Err(e),
                },
            },
        }
    }

    /// The single release point of the Pending-Turn gate. A pending input is
    /// accepted under the same lock, so nothing can slip in between.
    fn release_gate(&self) {
        let mut st = self.lock();
        st.processing = false;
        if let Some(next) = st.pending.take() {
            if !self.inner.alive.is_cancelled() {
                debug!(kind = ?next.kind(), "Starting pending input");
                self.accept(&mut st, next);
                return;
            }
        }
        self.inner.processing.send_replace(false);
    }

    // --- collaborator events ---

    fn on_speech_event(&self, event: SpeechEvent) {
        match event {
            SpeechEvent::Utterance(text) => {
                let outcome = self.submit(UserInput::Utterance(text));
                debug!(?outcome, "Utterance submitted");
            }
            SpeechEvent::Fatal(reason) => {
                self.notify(Notice::error(SPEECH_ERROR_TITLE, reason));
            }
            SpeechEvent::ListeningChanged(listening) => {
                debug!(listening, "Listening state changed");
                self.inner.resume.cancel();
            }
        }
    }

    fn on_avatar_event(&self, event: AvatarEvent) {
        match event {
            AvatarEvent::StartedTalking => debug!("Avatar started talking"),
            AvatarEvent::StoppedTalking => {
                debug!("Avatar stopped talking");
                self.schedule_auto_resume();
            }
        }
    }

    fn schedule_auto_resume(&self) {
        let (processing, speech) = {
            let st = self.lock();
            (st.processing, st.speech.clone())
        };
        let Some(speech) = speech else {
            return;
        };
        if processing || speech.is_listening() {
            debug!(processing, "Skipping auto-resume");
            return;
        }

        let delay = self.inner.settings.auto_resume_delay;
        debug!(delay_ms = delay.as_millis() as u64, "Auto-resume scheduled");
        let weak = Arc::downgrade(&self.inner);
        self.inner.resume.schedule(delay, async move {
            if let Some(inner) = weak.upgrade() {
                TurnOrchestrator { inner }.auto_resume(speech).await;
            }
        });
    }

    /// Resume listening unless a turn started meanwhile or the microphone is
    /// gone. Failures here are only logged.
    async fn auto_resume(&self, speech: SpeechSession) {
        if self.inner.alive.is_cancelled() || speech.is_listening() {
            return;
        }
        if self.is_processing() {
            debug!("Turn in progress, skipping auto-resume");
            return;
        }
        if let Err(e) = speech.probe_microphone().await {
            info!(error = %e, "Microphone not available, skipping auto-start listening");
            return;
        }
        match speech.start_listening().await {
            Ok(()) => info!("Listening resumed after avatar reply"),
            Err(e) => info!(error = %e, "Auto-resume failed"),
        }
    }

    fn notify(&self, notice: Notice) {
        debug!(title = %notice.title, "Notice");
        if self.inner.notices.send(notice).is_err() {
            debug!("Notice receiver dropped");
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Speaks replies one at a time, in the order their turns completed.
/// Failures become a notice and never touch the log or the gate.
async fn run_speaker(
    avatar: Arc<dyn AvatarRenderer>,
    notices: mpsc::UnboundedSender<Notice>,
    alive: CancellationToken,
    mut requests: mpsc::UnboundedReceiver<SpeakRequest>,
) {
    while let Some(SpeakRequest { session, text }) = requests.recv().await {
        if alive.is_cancelled() {
            debug!(session = %session, "Dropping reply after shutdown");
            continue;
        }
        if let Err(e) = avatar.speak(&session, &text).await {
            warn!(session = %session, error = %e, "Avatar speak failed");
            let _ = notices.send(Notice::error(GENERIC_ERROR_TITLE, e.to_string()));
        }
    }
}

fn failure_notice(kind: InputKind, error: &anyhow::Error) -> Notice {
    match kind {
        InputKind::Text | InputKind::Utterance => {
            Notice::error(GENERIC_ERROR_TITLE, error.to_string())
        }
        InputKind::Media => Notice::error("Error processing media", error.to_string()),
        InputKind::VisionFrame => Notice::error(
            "Vision Processing Error",
            "Failed to process camera feed. Please try again.",
        ),
    }
}

#[async_trait]
impl FrameSink for TurnOrchestrator {
    async fn submit_frame(&self, frame: EncodedFrame) -> anyhow::Result<()> {
        match self.submit(UserInput::VisionFrame(frame)) {
            SubmitOutcome::Rejected(reason) => anyhow::bail!("Vision frame rejected: {reason:?}"),
            outcome => {
                debug!(?outcome, "Vision frame submitted");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_notices_by_kind() {
        let err = anyhow::anyhow!("connection reset");
        assert_eq!(
            failure_notice(InputKind::Text, &err),
            Notice::error(GENERIC_ERROR_TITLE, "connection reset")
        );
        assert_eq!(
            failure_notice(InputKind::Media, &err).title,
            "Error processing media"
        );
        let vision = failure_notice(InputKind::VisionFrame, &err);
        assert_eq!(vision.title, "Vision Processing Error");
        assert!(!vision.description.contains("connection reset"));
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.speech.auto_resume_delay_ms = 500;
        config.responder.system_prompt = "Be brief.".into();
        let settings = OrchestratorSettings::from_config(&config);
        assert_eq!(settings.auto_resume_delay, Duration::from_millis(500));
        assert_eq!(settings.system_prompt, "Be brief.");
    }
}

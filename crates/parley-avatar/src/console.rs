//! Terminal stand-in for a video avatar: prints replies and simulates
//! speaking time.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::talk::{TalkTracker, estimate_duration};
use crate::{AvatarRenderer, AvatarSession, SessionHandle, VoiceConfig};

type Output = Arc<Mutex<Box<dyn Write + Send>>>;

pub struct ConsoleAvatar {
    output: Output,
    next_id: AtomicU64,
    sessions: Mutex<Vec<(SessionHandle, Arc<TalkTracker>)>>,
}

impl Default for ConsoleAvatar {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleAvatar {
    pub fn new() -> Self {
        Self::with_writer(Box::new(std::io::stdout()))
    }

    pub fn with_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            output: Arc::new(Mutex::new(writer)),
            next_id: AtomicU64::new(1),
            sessions: Mutex::new(Vec::new()),
        }
    }

    fn tracker(&self, handle: &SessionHandle) -> Option<Arc<TalkTracker>> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|(h, _)| h == handle)
            .map(|(_, t)| t.clone())
    }
}

#[async_trait]
impl AvatarRenderer for ConsoleAvatar {
    fn id(&self) -> &str {
        "console"
    }

    async fn start(&self, _voice: &VoiceConfig) -> anyhow::Result<AvatarSession> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = SessionHandle(format!("console-{id}"));
        let (talk, events) = TalkTracker::new();
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((handle.clone(), Arc::new(talk)));
        Ok(AvatarSession {
            handle,
            media: None,
            events,
        })
    }

    async fn speak(&self, session: &SessionHandle, text: &str) -> anyhow::Result<()> {
        let talk = self
            .tracker(session)
            .ok_or_else(|| anyhow::anyhow!("Unknown avatar session {session}"))?;
        {
            let mut out = self.output.lock().unwrap_or_else(|e| e.into_inner());
            writeln!(out, "avatar> {text}")?;
            out.flush()?;
        }
        talk.talk_for(estimate_duration(text));
        Ok(())
    }

    async fn stop(&self, session: &SessionHandle) -> anyhow::Result<()> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pos) = sessions.iter().position(|(h, _)| h == session) {
            let (_, talk) = sessions.remove(pos);
            talk.close();
        }
        Ok(())
    }
}

//! Interactive terminal session.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use parley_agent::{
    NoticeLevel, OrchestratorSettings, RejectReason, SubmitOutcome, TurnOrchestrator, UserInput,
};
use parley_avatar::console::ConsoleAvatar;
use parley_avatar::heygen::HeyGenAvatar;
use parley_avatar::{AvatarRenderer, VoiceConfig};
use parley_core::config::Config;
use parley_core::types::{MediaAttachment, MediaKind, Role, Turn, UiMode};
use parley_media::recognizer::{PipeAudioSource, TranscribingRecognizer};
use parley_media::stt::Transcriber;
use parley_media::vision::{FrameSource, SnapshotFileSource, VisionSampler};
use parley_media::{SpeechSession, SpeechSettings};
use parley_providers::openai::OpenAiResponder;

const HELP: &str = "\
Commands:
  /photo <path>   attach a photo
  /video <path>   attach a video
  /listen         start listening on the microphone
  /stop           stop listening
  /vision         start sampling the camera
  /novision       stop sampling the camera
  /log            print the conversation
  /quit           exit
Anything else is sent as a message.";

pub struct ChatOptions {
    pub no_avatar: bool,
    pub mic: Option<PathBuf>,
    pub camera: Option<PathBuf>,
}

/// Startup check. The avatar settings only matter when a HeyGen avatar is used.
pub fn check_config(config: &Config, no_avatar: bool) -> anyhow::Result<()> {
    if !no_avatar {
        config.startup_check()?;
        return Ok(());
    }
    let (_, errors) = config.validate();
    let errors: Vec<String> = errors
        .into_iter()
        .filter(|e| !e.starts_with("Avatar"))
        .collect();
    if !errors.is_empty() {
        anyhow::bail!("Configuration error: {}", errors.join("; "));
    }
    Ok(())
}

pub async fn run(config: Config, options: ChatOptions) -> anyhow::Result<()> {
    let responder = Arc::new(OpenAiResponder::from_config(&config.responder)?);
    let (avatar, voice): (Arc<dyn AvatarRenderer>, VoiceConfig) = if options.no_avatar {
        let voice = VoiceConfig {
            avatar_id: "console".into(),
            voice_id: "console".into(),
            quality: config.avatar.quality.clone(),
        };
        (Arc::new(ConsoleAvatar::new()), voice)
    } else {
        let voice = VoiceConfig::from_config(&config.avatar)
            .context("Avatar id and voice id must be configured")?;
        (Arc::new(HeyGenAvatar::from_config(&config.avatar)?), voice)
    };

    let (orchestrator, mut notices) = TurnOrchestrator::new(
        responder,
        avatar,
        OrchestratorSettings::from_config(&config),
    );

    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            match notice.level {
                NoticeLevel::Info => println!("* {notice}"),
                NoticeLevel::Error => eprintln!("! {notice}"),
            }
        }
    });

    if let Some(path) = &options.mic {
        let transcriber = Transcriber::from_config(
            &config.transcription,
            Some(config.speech.language.as_str()),
        )?;
        let recognizer = TranscribingRecognizer::new(
            Arc::new(PipeAudioSource::new(path)),
            Arc::new(transcriber),
            config.speech.clone(),
        );
        let (session, events) = SpeechSession::new(
            Arc::new(recognizer),
            SpeechSettings::from_config(&config.speech),
        );
        orchestrator.attach_speech(session, events);
        info!(mic = %path.display(), "Speech input attached");
    }

    let camera: Option<(VisionSampler, Arc<dyn FrameSource>)> = options.camera.as_ref().map(|path| {
        let sampler = VisionSampler::from_config(Arc::new(orchestrator.clone()), &config.vision);
        let source: Arc<dyn FrameSource> = Arc::new(SnapshotFileSource::new(path));
        (sampler, source)
    });

    if orchestrator.start_avatar(&voice).await.is_ok() {
        if let Some(media) = orchestrator.snapshot().avatar_media {
            println!("Avatar stream: {}", media.url);
        }
    }

    let echo_replies = !options.no_avatar;
    let printer = tokio::spawn(print_replies(orchestrator.clone(), echo_replies));

    println!("Type a message, or /help for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (command, arg) = match line.split_once(char::is_whitespace) {
            Some((command, arg)) => (command, arg.trim()),
            None => (line, ""),
        };
        match command {
            "/quit" | "/exit" => break,
            "/help" => println!("{HELP}"),
            "/photo" => attach(&orchestrator, arg, MediaKind::Photo).await,
            "/video" => attach(&orchestrator, arg, MediaKind::Video).await,
            "/listen" => {
                if let Err(e) = orchestrator.start_listening().await {
                    debug!(error = %e, "Listening not started");
                }
            }
            "/stop" => orchestrator.stop_listening(),
            "/vision" => match &camera {
                Some((sampler, source)) => {
                    orchestrator.set_mode(UiMode::AvatarFocus);
                    sampler.start(source.clone());
                    println!("Vision mode on.");
                }
                None => println!("No camera configured (use --camera <file>)."),
            },
            "/novision" => {
                if let Some((sampler, _)) = &camera {
                    sampler.stop();
                    println!("Vision mode off.");
                }
            }
            "/log" => print_log(&orchestrator),
            _ if command.starts_with('/') => println!("Unknown command {command}. Try /help."),
            _ => report(orchestrator.submit(UserInput::Text(line.to_string()))),
        }
    }

    if let Some((sampler, _)) = &camera {
        sampler.stop();
    }
    orchestrator.shutdown().await;
    printer.abort();
    info!("Chat ended");
    Ok(())
}

async fn attach(orchestrator: &TurnOrchestrator, path: &str, expected: MediaKind) {
    if path.is_empty() {
        println!("Usage: /{} <path>", expected.label());
        return;
    }
    match load_media(Path::new(path)).await {
        Ok(attachment) if attachment.kind == expected => {
            report(orchestrator.submit(UserInput::Media(attachment)));
        }
        Ok(attachment) => println!(
            "{} is a {}, not a {}.",
            attachment.name,
            attachment.kind.label(),
            expected.label()
        ),
        Err(e) => println!("Could not attach {path}: {e:#}"),
    }
}

async fn load_media(path: &Path) -> anyhow::Result<MediaAttachment> {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let kind = MediaKind::from_mime(mime.essence_str())
        .with_context(|| format!("unsupported file type {mime}"))?;
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(MediaAttachment::new(
        kind,
        Bytes::from(data),
        name,
        mime.essence_str(),
    ))
}

fn report(outcome: SubmitOutcome) {
    match outcome {
        SubmitOutcome::Accepted | SubmitOutcome::Queued => {}
        SubmitOutcome::Rejected(RejectReason::Busy) => {
            println!("Still working on the last message, please wait.")
        }
        SubmitOutcome::Rejected(RejectReason::Empty) => {}
        SubmitOutcome::Rejected(RejectReason::ShutDown) => warn!("Input after shutdown"),
    }
}

/// Print assistant turns as they are logged. A queued input is accepted
/// without the flag dropping back to false, so every change is checked.
/// The console avatar already prints what it says, so replies are only
/// echoed for remote avatars.
async fn print_replies(orchestrator: TurnOrchestrator, echo_replies: bool) {
    let mut processing = orchestrator.subscribe_processing();
    let mut shown = 0;
    while processing.changed().await.is_ok() {
        let turns = orchestrator.snapshot().turns;
        if echo_replies {
            for reply in new_replies(&turns, shown) {
                println!("parley> {reply}");
            }
        }
        shown = turns.len();
    }
}

fn new_replies(turns: &[Turn], shown: usize) -> Vec<String> {
    turns
        .iter()
        .skip(shown)
        .filter(|turn| turn.role() == Role::Assistant)
        .map(|turn| turn.content().placeholder())
        .collect()
}

fn print_log(orchestrator: &TurnOrchestrator) {
    let snapshot = orchestrator.snapshot();
    if snapshot.turns.is_empty() {
        println!("(no messages yet)");
    }
    for turn in &snapshot.turns {
        let who = match turn.role() {
            Role::User => "you",
            Role::Assistant => "parley",
        };
        println!(
            "[{}] {who}: {}",
            turn.timestamp().format("%H:%M:%S"),
            turn.content().placeholder()
        );
    }
    println!(
        "mode: {:?}, listening: {}, processing: {}",
        snapshot.mode, snapshot.is_listening, snapshot.is_processing
    );
}

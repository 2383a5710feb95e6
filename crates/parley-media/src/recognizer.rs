//! One-shot recognizer built from an audio source, VAD and a transcription API.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use parley_core::config::SpeechConfig;

use crate::speech::{AttemptOutcome, MicrophoneError, RecognitionError, Recognizer};
use crate::stt::Transcriber;
use crate::vad::{Segment, UtteranceSegmenter, bytes_to_samples};

/// 100ms of 16kHz 16-bit mono.
const READ_CHUNK_BYTES: usize = 3200;

/// A microphone-like PCM producer.
#[async_trait]
pub trait AudioSource: Send + Sync + 'static {
    /// Check the device can be opened without keeping it open.
    async fn probe(&self) -> Result<(), MicrophoneError>;

    /// Open the device for one attempt. Dropping the stream releases it.
    async fn open(&self) -> anyhow::Result<Box<dyn AudioStream>>;
}

#[async_trait]
pub trait AudioStream: Send {
    /// Next chunk of 16kHz mono samples; `None` at end of input.
    async fn read(&mut self) -> anyhow::Result<Option<Vec<i16>>>;
}

#[async_trait]
pub trait SpeechToText: Send + Sync + 'static {
    async fn transcribe(&self, pcm: &[i16]) -> anyhow::Result<String>;
}

#[async_trait]
impl SpeechToText for Transcriber {
    async fn transcribe(&self, pcm: &[i16]) -> anyhow::Result<String> {
        Transcriber::transcribe(self, pcm).await
    }
}

/// Raw little-endian PCM read from a file or FIFO (e.g. fed by `arecord`).
///
/// Regular files resume where the previous attempt stopped reading.
pub struct PipeAudioSource {
    path: PathBuf,
    offset: Arc<AtomicU64>,
}

impl PipeAudioSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[async_trait]
impl AudioSource for PipeAudioSource {
    async fn probe(&self) -> Result<(), MicrophoneError> {
        match tokio::fs::metadata(&self.path).await {
            Ok(_) => Ok(()),
            Err(e) => Err(classify_io(&e)),
        }
    }

    async fn open(&self) -> anyhow::Result<Box<dyn AudioStream>> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        let offset = self.offset.load(Ordering::SeqCst);
        if offset > 0 {
            // FIFOs can't seek; they simply continue with fresh audio.
            if let Err(e) = file.seek(SeekFrom::Start(offset)).await {
                debug!(error = %e, "Audio source is not seekable");
            }
        }
        Ok(Box::new(PipeStream {
            file,
            offset: self.offset.clone(),
            carry: None,
        }))
    }
}

struct PipeStream {
    file: tokio::fs::File,
    offset: Arc<AtomicU64>,
    carry: Option<u8>,
}

#[async_trait]
impl AudioStream for PipeStream {
    async fn read(&mut self) -> anyhow::Result<Option<Vec<i16>>> {
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        let n = self.file.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        self.offset.fetch_add(n as u64, Ordering::SeqCst);
        buf.truncate(n);

        if let Some(byte) = self.carry.take() {
            buf.insert(0, byte);
        }
        if buf.len() % 2 == 1 {
            self.carry = buf.pop();
        }
        Ok(Some(bytes_to_samples(&buf)))
    }
}

fn classify_io(e: &std::io::Error) -> MicrophoneError {
    match e.kind() {
        std::io::ErrorKind::NotFound => MicrophoneError::NotFound,
        std::io::ErrorKind::PermissionDenied => MicrophoneError::PermissionDenied,
        _ => MicrophoneError::Unavailable(e.to_string()),
    }
}

/// Listens for one utterance per attempt and transcribes it.
pub struct TranscribingRecognizer {
    source: Arc<dyn AudioSource>,
    stt: Arc<dyn SpeechToText>,
    speech: SpeechConfig,
}

impl TranscribingRecognizer {
    pub fn new(
        source: Arc<dyn AudioSource>,
        stt: Arc<dyn SpeechToText>,
        speech: SpeechConfig,
    ) -> Self {
        Self {
            source,
            stt,
            speech,
        }
    }

    async fn capture(
        &self,
        stream: &mut dyn AudioStream,
        cancel: &CancellationToken,
    ) -> Result<Segment, RecognitionError> {
        let mut segmenter = UtteranceSegmenter::from_config(&self.speech);
        let mut heard_anything = false;
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(RecognitionError::Other("aborted".into())),
                chunk = stream.read() => chunk,
            };
            match chunk {
                Ok(Some(samples)) => {
                    heard_anything |= !samples.is_empty();
                    if let Some(segment) = segmenter.push(&samples) {
                        return Ok(segment);
                    }
                }
                Ok(None) if !heard_anything => return Err(RecognitionError::AudioCapture),
                Ok(None) => return Ok(segmenter.flush()),
                Err(e) => {
                    warn!(error = %e, "Audio read failed");
                    return Err(RecognitionError::AudioCapture);
                }
            }
        }
    }
}

#[async_trait]
impl Recognizer for TranscribingRecognizer {
    async fn request_microphone(&self) -> Result<(), MicrophoneError> {
        self.source.probe().await
    }

    async fn recognize(&self, cancel: CancellationToken) -> anyhow::Result<AttemptOutcome> {
        let mut stream = self.source.open().await?;

        let pcm = match self.capture(stream.as_mut(), &cancel).await {
            Ok(Segment::Utterance(pcm)) => pcm,
            Ok(Segment::NoSpeech) => return Ok(AttemptOutcome::NoSpeech),
            Err(_) if cancel.is_cancelled() => return Ok(AttemptOutcome::Aborted),
            Err(e) => return Ok(AttemptOutcome::Failed(e)),
        };
        // The utterance is captured; release the device before the upload.
        drop(stream);

        let transcript = tokio::select! {
            _ = cancel.cancelled() => return Ok(AttemptOutcome::Aborted),
            result = self.stt.transcribe(&pcm) => result,
        };
        Ok(match transcript {
            Ok(text) if text.trim().is_empty() => AttemptOutcome::NoSpeech,
            Ok(text) => AttemptOutcome::Final(text),
            Err(e) => AttemptOutcome::Failed(classify_transcription_error(&e)),
        })
    }
}

/// Unreachable transcription service is a network error; anything else is transient.
fn classify_transcription_error(e: &anyhow::Error) -> RecognitionError {
    match e.downcast_ref::<reqwest::Error>() {
        Some(re) if re.is_connect() || re.is_timeout() => RecognitionError::Network,
        _ => RecognitionError::Other(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::vad::FRAME_SAMPLES;

    struct ScriptedSource {
        chunks: Vec<Vec<i16>>,
        /// Block after the script instead of ending the stream.
        hold_open: bool,
    }

    struct ScriptedStream {
        chunks: VecDeque<Vec<i16>>,
        hold_open: bool,
    }

    #[async_trait]
    impl AudioSource for ScriptedSource {
        async fn probe(&self) -> Result<(), MicrophoneError> {
            Ok(())
        }

        async fn open(&self) -> anyhow::Result<Box<dyn AudioStream>> {
            Ok(Box::new(ScriptedStream {
                chunks: self.chunks.clone().into(),
                hold_open: self.hold_open,
            }))
        }
    }

    #[async_trait]
    impl AudioStream for ScriptedStream {
        async fn read(&mut self) -> anyhow::Result<Option<Vec<i16>>> {
            match self.chunks.pop_front() {
                Some(chunk) => Ok(Some(chunk)),
                None if self.hold_open => std::future::pending().await,
                None => Ok(None),
            }
        }
    }

    struct FakeStt {
        reply: String,
        calls: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl SpeechToText for FakeStt {
        async fn transcribe(&self, pcm: &[i16]) -> anyhow::Result<String> {
            self.calls.lock().unwrap().push(pcm.len());
            Ok(self.reply.clone())
        }
    }

    fn stt(reply: &str) -> Arc<FakeStt> {
        Arc::new(FakeStt {
            reply: reply.into(),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn speech_config() -> SpeechConfig {
        SpeechConfig {
            vad_threshold: 100.0,
            no_speech_timeout_ms: 200,
            ..SpeechConfig::default()
        }
    }

    fn recognizer(source: ScriptedSource, stt: Arc<FakeStt>) -> TranscribingRecognizer {
        TranscribingRecognizer::new(Arc::new(source), stt, speech_config())
    }

    #[tokio::test]
    async fn test_utterance_is_transcribed() {
        let mut chunks = vec![vec![1000i16; FRAME_SAMPLES * 10]];
        chunks.push(vec![0i16; FRAME_SAMPLES * 40]);
        let fake = stt("what time is it");
        let r = recognizer(
            ScriptedSource {
                chunks,
                hold_open: false,
            },
            fake.clone(),
        );

        let outcome = r.recognize(CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, AttemptOutcome::Final("what time is it".into()));
        assert_eq!(fake.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_silence_is_no_speech() {
        let fake = stt("unused");
        let r = recognizer(
            ScriptedSource {
                chunks: vec![vec![0i16; FRAME_SAMPLES * 20]],
                hold_open: true,
            },
            fake.clone(),
        );
        assert_eq!(
            r.recognize(CancellationToken::new()).await.unwrap(),
            AttemptOutcome::NoSpeech
        );
        assert!(fake.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blank_transcript_is_no_speech() {
        let r = recognizer(
            ScriptedSource {
                chunks: vec![vec![1000i16; FRAME_SAMPLES * 5]],
                hold_open: false,
            },
            stt("   "),
        );
        assert_eq!(
            r.recognize(CancellationToken::new()).await.unwrap(),
            AttemptOutcome::NoSpeech
        );
    }

    #[tokio::test]
    async fn test_ended_input_is_audio_capture_error() {
        let r = recognizer(
            ScriptedSource {
                chunks: vec![],
                hold_open: false,
            },
            stt("unused"),
        );
        assert_eq!(
            r.recognize(CancellationToken::new()).await.unwrap(),
            AttemptOutcome::Failed(RecognitionError::AudioCapture)
        );
    }

    #[tokio::test]
    async fn test_cancel_aborts() {
        let r = recognizer(
            ScriptedSource {
                chunks: vec![],
                hold_open: true,
            },
            stt("unused"),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        assert_eq!(r.recognize(cancel).await.unwrap(), AttemptOutcome::Aborted);
    }

    #[tokio::test]
    async fn test_pipe_source_resumes_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mic.pcm");
        let mut pcm = vec![1000i16; FRAME_SAMPLES * 10];
        pcm.extend(vec![0i16; FRAME_SAMPLES * 40]);
        let bytes: Vec<u8> = pcm.iter().flat_map(|s| s.to_le_bytes()).collect();
        std::fs::write(&path, &bytes).unwrap();

        let fake = stt("hello");
        let r = TranscribingRecognizer::new(
            Arc::new(PipeAudioSource::new(&path)),
            fake.clone(),
            speech_config(),
        );
        r.request_microphone().await.unwrap();

        assert_eq!(
            r.recognize(CancellationToken::new()).await.unwrap(),
            AttemptOutcome::Final("hello".into())
        );
        // The next attempt continues after the first utterance instead of replaying it.
        let second = r.recognize(CancellationToken::new()).await.unwrap();
        assert_ne!(second, AttemptOutcome::Final("hello".into()));
        assert_eq!(fake.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pipe_source_missing_device() {
        let source = PipeAudioSource::new("/nonexistent/parley/mic.pcm");
        assert_eq!(source.probe().await, Err(MicrophoneError::NotFound));
    }
}

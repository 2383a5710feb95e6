//! Energy-based voice activity detection and utterance segmentation.

use parley_core::config::SpeechConfig;

/// Sample rate of all PCM handled here (16-bit mono).
pub const SAMPLE_RATE: u32 = 16_000;
/// 20ms frames.
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE as usize) / 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadTransition {
    SpeechStarted,
    SpeechEnded,
}

/// Voice Activity Detector using an RMS energy threshold on 16-bit PCM.
pub struct VoiceActivityDetector {
    threshold: f64,
    /// Consecutive silent frames before speech is declared over.
    min_silent_frames: usize,
    speech_active: bool,
    silent_count: usize,
}

impl VoiceActivityDetector {
    pub fn new(threshold: f64, min_silent_frames: usize) -> Self {
        Self {
            threshold,
            min_silent_frames,
            speech_active: false,
            silent_count: 0,
        }
    }

    /// ~600ms of trailing silence at 20ms frames.
    pub fn with_threshold(threshold: f64) -> Self {
        Self::new(threshold, 30)
    }

    pub fn rms(samples: &[i16]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
        (sum / samples.len() as f64).sqrt()
    }

    /// Feed one frame; returns a transition when speech starts or ends.
    pub fn process_frame(&mut self, pcm: &[i16]) -> Option<VadTransition> {
        let is_speech = Self::rms(pcm) > self.threshold;

        if is_speech {
            self.silent_count = 0;
            if !self.speech_active {
                self.speech_active = true;
                return Some(VadTransition::SpeechStarted);
            }
        } else if self.speech_active {
            self.silent_count += 1;
            if self.silent_count >= self.min_silent_frames {
                self.speech_active = false;
                self.silent_count = 0;
                return Some(VadTransition::SpeechEnded);
            }
        }
        None
    }

    pub fn is_active(&self) -> bool {
        self.speech_active
    }

    pub fn reset(&mut self) {
        self.speech_active = false;
        self.silent_count = 0;
    }
}

/// Result of segmenting one recognition attempt's audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// A complete utterance of raw PCM.
    Utterance(Vec<i16>),
    /// No speech began before the silence timeout.
    NoSpeech,
}

/// Splits a PCM stream into a single utterance, the way a one-shot
/// recognizer does: wait for speech, record until trailing silence or the
/// maximum length, or give up after the no-speech timeout.
pub struct UtteranceSegmenter {
    vad: VoiceActivityDetector,
    pending: Vec<i16>,
    recorded: Vec<i16>,
    elapsed_samples: usize,
    no_speech_samples: usize,
    max_utterance_samples: usize,
}

impl UtteranceSegmenter {
    pub fn new(vad: VoiceActivityDetector, no_speech_ms: u64, max_utterance_ms: u64) -> Self {
        Self {
            vad,
            pending: Vec::new(),
            recorded: Vec::new(),
            elapsed_samples: 0,
            no_speech_samples: ms_to_samples(no_speech_ms),
            max_utterance_samples: ms_to_samples(max_utterance_ms),
        }
    }

    pub fn from_config(config: &SpeechConfig) -> Self {
        Self::new(
            VoiceActivityDetector::with_threshold(config.vad_threshold),
            config.no_speech_timeout_ms,
            config.max_utterance_ms,
        )
    }

    /// Feed samples. Returns a segment once the attempt is decided; the
    /// segmenter is reset afterwards and can be reused.
    pub fn push(&mut self, samples: &[i16]) -> Option<Segment> {
        self.pending.extend_from_slice(samples);

        while self.pending.len() >= FRAME_SAMPLES {
            let frame: Vec<i16> = self.pending.drain(..FRAME_SAMPLES).collect();
            self.elapsed_samples += frame.len();

            let transition = self.vad.process_frame(&frame);
            if self.vad.is_active() || transition == Some(VadTransition::SpeechEnded) {
                self.recorded.extend_from_slice(&frame);
            }

            match transition {
                Some(VadTransition::SpeechEnded) => return Some(self.finish()),
                _ if self.vad.is_active() && self.recorded.len() >= self.max_utterance_samples => {
                    return Some(self.finish());
                }
                _ if !self.vad.is_active()
                    && self.recorded.is_empty()
                    && self.elapsed_samples >= self.no_speech_samples =>
                {
                    self.reset();
                    return Some(Segment::NoSpeech);
                }
                _ => {}
            }
        }
        None
    }

    /// End of input: whatever was recorded becomes the utterance.
    pub fn flush(&mut self) -> Segment {
        if self.recorded.is_empty() {
            self.reset();
            Segment::NoSpeech
        } else {
            self.finish()
        }
    }

    pub fn reset(&mut self) {
        self.vad.reset();
        self.pending.clear();
        self.recorded.clear();
        self.elapsed_samples = 0;
    }

    fn finish(&mut self) -> Segment {
        let pcm = std::mem::take(&mut self.recorded);
        self.reset();
        Segment::Utterance(pcm)
    }
}

/// Little-endian 16-bit PCM bytes to samples. A trailing odd byte is dropped.
pub fn bytes_to_samples(raw: &[u8]) -> Vec<i16> {
    raw.chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

fn ms_to_samples(ms: u64) -> usize {
    (ms as usize) * (SAMPLE_RATE as usize) / 1000
}

//! Media pipeline: continuous speech capture, VAD, transcription and camera
//! frame sampling.

pub mod recognizer;
pub mod speech;
pub mod stt;
pub mod timer;
pub mod vad;
pub mod vision;

pub use speech::{
    AttemptOutcome, MicrophoneError, RecognitionError, Recognizer, SpeechEvent, SpeechSession,
    SpeechSettings, SpeechState,
};
pub use vision::{EncodedFrame, Frame, FrameSink, FrameSource, VisionSampler};

//! Speech-to-text over Whisper-compatible HTTP APIs.

use anyhow::Result;
use tracing::debug;

use parley_core::config::TranscriptionConfig;

use crate::vad::SAMPLE_RATE;

const GROQ_URL: &str = "https://api.groq.com/openai/v1/audio/transcriptions";
const OPENAI_URL: &str = "https://api.openai.com/v1/audio/transcriptions";

/// Wrap raw 16-bit PCM in a WAV container.
pub fn pcm_to_wav(pcm: &[i16], sample_rate: u32, channels: u16, bits_per_sample: u16) -> Vec<u8> {
    let data_len = pcm.len() * 2;
    let byte_rate = sample_rate * u32::from(channels) * u32::from(bits_per_sample) / 8;
    let block_align = channels * bits_per_sample / 8;

    let mut wav = Vec::with_capacity(44 + data_len);
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len as u32).to_le_bytes());
    wav.extend_from_slice(b"WAVE");

    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());

    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&(data_len as u32).to_le_bytes());
    for &sample in pcm {
        wav.extend_from_slice(&sample.to_le_bytes());
    }
    wav
}

/// Transcription endpoint for the configured provider.
pub fn provider_url(config: &TranscriptionConfig) -> String {
    if let Some(base) = &config.base_url {
        return format!("{}/v1/audio/transcriptions", base.trim_end_matches('/'));
    }
    match config.provider.as_str() {
        "openai" => OPENAI_URL.into(),
        _ => GROQ_URL.into(),
    }
}

fn default_model(provider: &str) -> &'static str {
    match provider {
        "openai" => "whisper-1",
        _ => "whisper-large-v3-turbo",
    }
}

/// Uploads utterances to a transcription API.
pub struct Transcriber {
    url: String,
    api_key: String,
    model: String,
    language: Option<String>,
    client: reqwest::Client,
}

impl Transcriber {
    /// Fails if no API key resolves.
    pub fn from_config(config: &TranscriptionConfig, language: Option<&str>) -> Result<Self> {
        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("No transcription API key configured"))?;
        Ok(Self {
            url: provider_url(config),
            api_key,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| default_model(&config.provider).to_string()),
            // Whisper takes ISO-639-1 ("en"), not a locale ("en-US").
            language: language
                .and_then(|l| l.split(['-', '_']).next())
                .filter(|l| !l.is_empty())
                .map(str::to_lowercase),
            client: reqwest::Client::new(),
        })
    }

    /// Transcribe 16kHz mono PCM. Returns the trimmed transcript.
    pub async fn transcribe(&self, pcm: &[i16]) -> Result<String> {
        let wav = pcm_to_wav(pcm, SAMPLE_RATE, 1, 16);
        debug!(url = %self.url, model = %self.model, wav_bytes = wav.len(), "Sending audio for transcription");

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;
        let mut form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "text")
            .part("file", part);
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Transcription API error {status}: {body}");
        }

        Ok(resp.text().await?.trim().to_string())
    }
}

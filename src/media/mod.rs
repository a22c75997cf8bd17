//! Turns audio and image attachments into text fragments.

use crate::config::MediaConfig;
use crate::errors::{CoalesceError, CoalesceResult};
use crate::utils::http::{MAX_MEDIA_BYTES, http_client, limited_body};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};

const IMAGE_TEXT_PROMPT: &str = "Extract all text visible in the attached image. \
Return the exact text, preserving its order and line breaks. \
Return nothing else.";

const IMAGE_TEXT_MAX_TOKENS: u32 = 500;

/// Resolves a media URL to the text that stands in for it in the buffer.
#[async_trait]
pub trait MediaResolver: Send + Sync {
    async fn transcribe(&self, audio_url: &str) -> CoalesceResult<String>;

    async fn extract_image_text(&self, image_url: &str) -> CoalesceResult<String>;
}

/// OpenAI-compatible backend: Whisper for audio, a vision chat model for images.
pub struct OpenAiMediaResolver {
    client: Client,
    api_base: String,
    api_key: String,
    transcription_model: String,
    vision_model: String,
    prompt: String,
}

impl OpenAiMediaResolver {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            client: http_client(Duration::from_secs(config.timeout_secs)),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            transcription_model: config.transcription_model.clone(),
            vision_model: config.vision_model.clone(),
            prompt: config.whisper_prompt.clone(),
        }
    }

    fn require_key(&self) -> CoalesceResult<&str> {
        if self.api_key.is_empty() {
            return Err(CoalesceError::Media(
                "media API key not configured".to_string(),
            ));
        }
        Ok(&self.api_key)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to download media from {}", url))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("media download returned {}", status);
        }
        let (bytes, truncated) = limited_body(resp, MAX_MEDIA_BYTES).await?;
        if truncated {
            bail!("media file exceeds {} bytes", MAX_MEDIA_BYTES);
        }
        Ok(bytes)
    }

    async fn transcribe_inner(&self, api_key: &str, audio_url: &str) -> Result<String> {
        let data = self.download(audio_url).await?;
        debug!("transcribing {} bytes from {}", data.len(), audio_url);

        let file_part = reqwest::multipart::Part::bytes(data)
            .file_name("audio.mp3")
            .mime_str("audio/mpeg")?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", file_part)
            .text("model", self.transcription_model.clone())
            .text("response_format", "json");
        if !self.prompt.is_empty() {
            form = form.text("prompt", self.prompt.clone());
        }

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.api_base))
            .header("Authorization", format!("Bearer {}", api_key))
            .multipart(form)
            .send()
            .await
            .context("transcription request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("transcription API returned {}: {}", status, body);
        }

        let body: Value = response
            .json()
            .await
            .context("failed to parse transcription response")?;
        let text = body["text"].as_str().unwrap_or("").trim().to_string();
        if text.is_empty() {
            warn!("transcription API returned empty text for {}", audio_url);
        }
        Ok(text)
    }

    async fn image_text_inner(&self, api_key: &str, image_url: &str) -> Result<String> {
        let payload = json!({
            "model": self.vision_model,
            "max_tokens": IMAGE_TEXT_MAX_TOKENS,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": IMAGE_TEXT_PROMPT},
                    {"type": "image_url", "image_url": {"url": image_url, "detail": "high"}}
                ]
            }]
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&payload)
            .send()
            .await
            .context("vision request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("vision API returned {}: {}", status, body);
        }

        let body: Value = response
            .json()
            .await
            .context("failed to parse vision response")?;
        Ok(body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string())
    }
}

#[async_trait]
impl MediaResolver for OpenAiMediaResolver {
    async fn transcribe(&self, audio_url: &str) -> CoalesceResult<String> {
        let api_key = self.require_key()?;
        self.transcribe_inner(api_key, audio_url)
            .await
            .map_err(|e| CoalesceError::Media(format!("audio transcription failed: {:#}", e)))
    }

    async fn extract_image_text(&self, image_url: &str) -> CoalesceResult<String> {
        let api_key = self.require_key()?;
        self.image_text_inner(api_key, image_url)
            .await
            .map_err(|e| CoalesceError::Media(format!("image text extraction failed: {:#}", e)))
    }
}

#[cfg(test)]
mod tests;

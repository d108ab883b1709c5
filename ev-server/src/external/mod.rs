//! Narrow interfaces to the external speech-to-text and text-to-speech
//! providers. Neither provider's wire protocol is specified upstream; these
//! traits exist so the gateway never depends on a concrete HTTP client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize)]
pub struct TranscribeRequest {
    pub audio_base64: String,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscribeResponse {
    pub transcript: String,
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, req: TranscribeRequest) -> AppResult<TranscribeResponse>;
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeakRequest {
    pub text: String,
    pub voice: Option<String>,
    pub language: Option<String>,
    pub accent_goal: Option<String>,
    pub slow: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpeakResponse {
    /// Base64-encoded audio (mp3).
    pub audio_base64: String,
}

#[async_trait]
pub trait Speaker: Send + Sync {
    async fn speak(&self, req: SpeakRequest) -> AppResult<SpeakResponse>;
    async fn synthesize_bytes(&self, text: &str) -> AppResult<Vec<u8>>;
}

/// HTTP-backed client wrapping a configured provider base URL.
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpProvider {
    #[must_use]
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
        }
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let builder = self.client.post(url);
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[async_trait]
impl Transcriber for HttpProvider {
    async fn transcribe(&self, req: TranscribeRequest) -> AppResult<TranscribeResponse> {
        let resp = self
            .request("/transcribe")
            .json(&req)
            .send()
            .await
            .map_err(AppError::internal)?
            .error_for_status()
            .map_err(AppError::internal)?
            .json::<TranscribeResponse>()
            .await
            .map_err(AppError::internal)?;
        Ok(resp)
    }
}

#[async_trait]
impl Speaker for HttpProvider {
    async fn speak(&self, req: SpeakRequest) -> AppResult<SpeakResponse> {
        let resp = self
            .request("/speak")
            .json(&req)
            .send()
            .await
            .map_err(AppError::internal)?
            .error_for_status()
            .map_err(AppError::internal)?
            .json::<SpeakResponse>()
            .await
            .map_err(AppError::internal)?;
        Ok(resp)
    }

    async fn synthesize_bytes(&self, text: &str) -> AppResult<Vec<u8>> {
        let resp = self
            .request("/tts")
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(AppError::internal)?
            .error_for_status()
            .map_err(AppError::internal)?
            .bytes()
            .await
            .map_err(AppError::internal)?;
        Ok(resp.to_vec())
    }
}

/// Provider registry: `None` for a slot means the matching route returns
/// `NotConfigured` rather than attempting a call.
#[derive(Clone, Default)]
pub struct Providers {
    pub transcriber: Option<std::sync::Arc<dyn Transcriber>>,
    pub speaker: Option<std::sync::Arc<dyn Speaker>>,
}

impl Providers {
    #[must_use]
    pub fn from_config(config: &crate::config::Config) -> Self {
        let transcriber = config.transcriber_base_url.as_ref().map(|url| {
            std::sync::Arc::new(HttpProvider::new(url.clone(), config.provider_api_key.clone()))
                as std::sync::Arc<dyn Transcriber>
        });
        let speaker = config.speaker_base_url.as_ref().map(|url| {
            std::sync::Arc::new(HttpProvider::new(url.clone(), config.provider_api_key.clone()))
                as std::sync::Arc<dyn Speaker>
        });
        Self { transcriber, speaker }
    }
}

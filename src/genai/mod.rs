//! The generative-AI SDK surface the middleware wraps.
//!
//! The middleware never talks to Gemini itself. The host supplies a
//! [`GenAiBackend`] (usually a thin adapter over its SDK of choice) and the
//! wrappers in [`crate::middleware`], [`crate::images`] and [`crate::videos`]
//! call through it, reading only finish reasons, usage counts, message parts
//! and generated-artifact counts from the results.

pub mod content;
pub mod media;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

pub use content::{
    Blob, Candidate, Content, FileData, FinishReason, GenerateContentConfig,
    GenerateContentResponse, Part, UsageMetadata,
};
pub use media::{
    EditImageConfig, EditImageResponse, GenerateImagesConfig, GenerateImagesResponse,
    GenerateVideosConfig, GenerateVideosOperation, GenerateVideosResponse, GeneratedImage,
    GeneratedVideo, Image, ReferenceImage, UpscaleImageConfig, UpscaleImageResponse, Video,
};

/// Error produced by the SDK. Returned to the caller exactly as produced.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct GenAiError {
    /// HTTP status reported by the SDK, when there was one.
    pub status: Option<u16>,
    pub message: String,
}

impl GenAiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn unsupported(operation: &str) -> Self {
        Self::new(format!("{operation} is not supported by this backend"))
    }
}

/// Lazily produced response chunks of a streaming generation.
pub type ContentStream = BoxStream<'static, Result<GenerateContentResponse, GenAiError>>;

/// Capability surface of the wrapped SDK.
///
/// Only content generation is mandatory; image and video operations default
/// to an "unsupported" error.
#[async_trait]
pub trait GenAiBackend: Send + Sync {
    async fn generate_content(
        &self,
        model: &str,
        contents: &[Content],
        config: Option<&GenerateContentConfig>,
    ) -> Result<GenerateContentResponse, GenAiError>;

    /// Start a streaming generation. An `Err` here means the stream never
    /// started; failures after that arrive as stream items.
    async fn generate_content_stream(
        &self,
        model: &str,
        contents: &[Content],
        config: Option<&GenerateContentConfig>,
    ) -> Result<ContentStream, GenAiError>;

    async fn generate_images(
        &self,
        model: &str,
        prompt: &str,
        config: Option<&GenerateImagesConfig>,
    ) -> Result<GenerateImagesResponse, GenAiError> {
        let _ = (model, prompt, config);
        Err(GenAiError::unsupported("generate_images"))
    }

    async fn edit_image(
        &self,
        model: &str,
        prompt: &str,
        reference_images: &[ReferenceImage],
        config: Option<&EditImageConfig>,
    ) -> Result<EditImageResponse, GenAiError> {
        let _ = (model, prompt, reference_images, config);
        Err(GenAiError::unsupported("edit_image"))
    }

    async fn upscale_image(
        &self,
        model: &str,
        image: &Image,
        upscale_factor: &str,
        config: Option<&UpscaleImageConfig>,
    ) -> Result<UpscaleImageResponse, GenAiError> {
        let _ = (model, image, upscale_factor, config);
        Err(GenAiError::unsupported("upscale_image"))
    }

    async fn generate_videos(
        &self,
        model: &str,
        prompt: &str,
        image: Option<&Image>,
        config: Option<&GenerateVideosConfig>,
    ) -> Result<GenerateVideosOperation, GenAiError> {
        let _ = (model, prompt, image, config);
        Err(GenAiError::unsupported("generate_videos"))
    }

    /// Fetch the current state of a video operation.
    async fn get_videos_operation(
        &self,
        operation: &GenerateVideosOperation,
    ) -> Result<GenerateVideosOperation, GenAiError> {
        let _ = operation;
        Err(GenAiError::unsupported("get_videos_operation"))
    }
}

/// Credentials handed to the host when the SDK client is constructed.
#[derive(Clone, PartialEq, Eq)]
pub enum BackendSettings {
    GeminiApi { api_key: String },
    VertexAi { project: String, location: String },
}

impl std::fmt::Debug for BackendSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendSettings::GeminiApi { .. } => f
                .debug_struct("GeminiApi")
                .field("api_key", &"<redacted>")
                .finish(),
            BackendSettings::VertexAi { project, location } => f
                .debug_struct("VertexAi")
                .field("project", project)
                .field("location", location)
                .finish(),
        }
    }
}

/// Builds the SDK client for a resolved provider.
pub trait BackendConnector: Send + Sync {
    fn connect(&self, settings: &BackendSettings) -> Result<Arc<dyn GenAiBackend>, GenAiError>;
}

impl<F> BackendConnector for F
where
    F: Fn(&BackendSettings) -> Result<Arc<dyn GenAiBackend>, GenAiError> + Send + Sync,
{
    fn connect(&self, settings: &BackendSettings) -> Result<Arc<dyn GenAiBackend>, GenAiError> {
        self(settings)
    }
}

/// serde adapter: `Vec<u8>` <-> standard base64 string.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(b) => super::serialize(b, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            let encoded: Option<String> = Option::deserialize(deserializer)?;
            encoded
                .map(|s| STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

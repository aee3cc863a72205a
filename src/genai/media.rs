//! Image (Imagen) and video (Veo) generation types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "super::base64_bytes::option"
    )]
    pub image_bytes: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gcs_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedImage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rai_filtered_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateImagesConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_of_images: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person_generation: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateImagesResponse {
    #[serde(default)]
    pub generated_images: Vec<GeneratedImage>,
}

/// Image supplied to an edit call (raw, mask, style...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceImage {
    pub reference_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<i32>,
    pub image: Image,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditImageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_of_images: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edit_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person_generation: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditImageResponse {
    #[serde(default)]
    pub generated_images: Vec<GeneratedImage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpscaleImageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_mime_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpscaleImageResponse {
    #[serde(default)]
    pub generated_images: Vec<GeneratedImage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateVideosConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_of_videos: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedVideo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<Video>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateVideosResponse {
    #[serde(default)]
    pub generated_videos: Vec<GeneratedVideo>,
    #[serde(default)]
    pub rai_media_filtered_count: i32,
    #[serde(default)]
    pub rai_media_filtered_reasons: Vec<String>,
}

/// Long-running video generation handle, polled until `done`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateVideosOperation {
    pub name: String,
    #[serde(default)]
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<GenerateVideosResponse>,
}

impl GenerateVideosOperation {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Operation finished with a non-empty error object.
    pub fn failed(&self) -> bool {
        self.error.as_ref().is_some_and(|e| !e.is_empty())
    }
}

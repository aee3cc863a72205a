//! Metered image generation (Imagen).

use std::result::Result as StdResult;

use chrono::{DateTime, Utc};

use crate::context::CallContext;
use crate::genai::{
    EditImageConfig, EditImageResponse, GenAiError, GenerateImagesConfig, GenerateImagesResponse,
    Image, ReferenceImage, UpscaleImageConfig, UpscaleImageResponse,
};
use crate::middleware::ReveniumGoogle;
use crate::payload::{build_image_payload, CallKind, ImageOperation, ImageUsage, PayloadContext, Timing};

pub struct Images<'a> {
    client: &'a ReveniumGoogle,
}

/// Requested count; absent or zero means one image.
fn requested_count(number_of_images: Option<u32>) -> u32 {
    number_of_images.filter(|n| *n > 0).unwrap_or(1)
}

impl<'a> Images<'a> {
    pub(crate) fn new(client: &'a ReveniumGoogle) -> Self {
        Self { client }
    }

    pub async fn generate_images(
        &self,
        ctx: &CallContext,
        model: &str,
        prompt: &str,
        config: Option<&GenerateImagesConfig>,
    ) -> StdResult<GenerateImagesResponse, GenAiError> {
        let request_time = Utc::now();
        let requested = requested_count(config.and_then(|c| c.number_of_images));
        tracing::debug!(model, prompt_len = prompt.len(), requested, "generate_images");

        let result = self
            .client
            .backend()
            .generate_images(model, prompt, config)
            .await;

        let operation = ImageOperation::Generate {
            aspect_ratio: config.and_then(|c| c.aspect_ratio.clone()),
            output_mime_type: config.and_then(|c| c.output_mime_type.clone()),
            person_generation: config.and_then(|c| c.person_generation.clone()),
        };
        let actual = result.as_ref().map(|r| r.generated_images.len());
        self.meter(ctx, model, request_time, operation, requested, actual);
        result
    }

    pub async fn edit_image(
        &self,
        ctx: &CallContext,
        model: &str,
        prompt: &str,
        reference_images: &[ReferenceImage],
        config: Option<&EditImageConfig>,
    ) -> StdResult<EditImageResponse, GenAiError> {
        let request_time = Utc::now();
        let requested = requested_count(config.and_then(|c| c.number_of_images));
        tracing::debug!(
            model,
            references = reference_images.len(),
            requested,
            "edit_image"
        );

        let result = self
            .client
            .backend()
            .edit_image(model, prompt, reference_images, config)
            .await;

        let operation = ImageOperation::Edit {
            output_mime_type: config.and_then(|c| c.output_mime_type.clone()),
            person_generation: config.and_then(|c| c.person_generation.clone()),
        };
        let actual = result.as_ref().map(|r| r.generated_images.len());
        self.meter(ctx, model, request_time, operation, requested, actual);
        result
    }

    /// Upscale one image. Always metered as one requested image.
    pub async fn upscale_image(
        &self,
        ctx: &CallContext,
        model: &str,
        image: &Image,
        upscale_factor: &str,
        config: Option<&UpscaleImageConfig>,
    ) -> StdResult<UpscaleImageResponse, GenAiError> {
        let request_time = Utc::now();
        tracing::debug!(model, upscale_factor, "upscale_image");

        let result = self
            .client
            .backend()
            .upscale_image(model, image, upscale_factor, config)
            .await;

        let operation = ImageOperation::Upscale {
            upscale_factor: upscale_factor.to_string(),
        };
        let actual = result.as_ref().map(|r| r.generated_images.len());
        self.meter(ctx, model, request_time, operation, 1, actual);
        result
    }

    fn meter(
        &self,
        ctx: &CallContext,
        model: &str,
        request_time: DateTime<Utc>,
        operation: ImageOperation,
        requested: u32,
        actual: StdResult<usize, &GenAiError>,
    ) {
        let timing = Timing::single_response(request_time, Utc::now());
        let usage = match actual {
            Ok(actual) => ImageUsage {
                operation,
                requested,
                actual,
                error: None,
            },
            Err(e) => {
                tracing::debug!(model, error = %e, "image call failed");
                ImageUsage {
                    operation,
                    requested,
                    actual: 0,
                    error: Some(e.to_string()),
                }
            }
        };
        let model = model.to_string();
        let provider = self.client.provider();
        let metadata = ctx.shared_metadata();
        self.client.dispatcher().dispatch(CallKind::Image, move || {
            let ctx = PayloadContext {
                model: &model,
                provider,
                timing,
                metadata: &metadata,
            };
            build_image_payload(&ctx, &usage)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requested_defaults_to_one() {
        assert_eq!(requested_count(None), 1);
        assert_eq!(requested_count(Some(0)), 1);
        assert_eq!(requested_count(Some(4)), 4);
    }
}

//! Metered video generation (Veo).
//!
//! Video generation is a long-running operation. Starting it is metered
//! with a `PENDING` payload; [`Videos::wait_for_video_generation`] polls the
//! operation and meters the final outcome.

use std::result::Result as StdResult;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::context::CallContext;
use crate::genai::{
    GenAiError, GenerateVideosConfig, GenerateVideosOperation, GenerateVideosResponse, Image,
};
use crate::middleware::ReveniumGoogle;
use crate::payload::{build_video_payload, CallKind, PayloadContext, Timing, VideoUsage};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Why waiting for a video operation ended without videos.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VideoWaitError {
    #[error("operation timeout after {0:?}")]
    Timeout(Duration),

    #[error("wait cancelled")]
    Cancelled,

    #[error("video generation failed: {0}")]
    Failed(String),

    #[error("video generation completed but no response")]
    NoResponse,
}

pub struct Videos<'a> {
    client: &'a ReveniumGoogle,
}

impl<'a> Videos<'a> {
    pub(crate) fn new(client: &'a ReveniumGoogle) -> Self {
        Self { client }
    }

    /// Start a video generation. Meters the operation start.
    pub async fn generate_videos(
        &self,
        ctx: &CallContext,
        model: &str,
        prompt: &str,
        image: Option<&Image>,
        config: Option<&GenerateVideosConfig>,
    ) -> StdResult<GenerateVideosOperation, GenAiError> {
        let request_time = Utc::now();
        let requested = config
            .and_then(|c| c.number_of_videos)
            .filter(|n| *n > 0)
            .unwrap_or(1);
        tracing::debug!(model, prompt_len = prompt.len(), requested, "generate_videos");

        let result = self
            .client
            .backend()
            .generate_videos(model, prompt, image, config)
            .await;

        let usage = match &result {
            Ok(operation) => {
                tracing::debug!(model, operation = %operation.name, "video operation started");
                VideoUsage::Started {
                    operation_name: operation.name.clone(),
                    aspect_ratio: config.and_then(|c| c.aspect_ratio.clone()),
                    requested,
                }
            }
            Err(e) => VideoUsage::Failed {
                requested,
                error: e.to_string(),
            },
        };
        self.meter(ctx, model, request_time, usage);
        result
    }

    /// Poll `operation` until it completes, fails, times out, or `ctx` is
    /// cancelled, then meter the outcome.
    ///
    /// `None` or zero selects the defaults (5 s poll, 5 min timeout). Poll
    /// errors are logged and polling continues.
    pub async fn wait_for_video_generation(
        &self,
        ctx: &CallContext,
        operation: &GenerateVideosOperation,
        model: &str,
        poll_interval: Option<Duration>,
        timeout: Option<Duration>,
    ) -> StdResult<GenerateVideosResponse, VideoWaitError> {
        let poll_interval = poll_interval
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        let timeout = timeout.filter(|d| !d.is_zero()).unwrap_or(DEFAULT_WAIT_TIMEOUT);
        let request_time = Utc::now();
        let deadline = Instant::now() + timeout;
        tracing::debug!(
            model,
            operation = %operation.name,
            ?poll_interval,
            ?timeout,
            "waiting for video generation"
        );

        let outcome = self
            .poll_until_done(ctx.cancellation(), operation, deadline, poll_interval, timeout)
            .await;

        let usage = match &outcome {
            Ok(response) => {
                tracing::debug!(
                    model,
                    videos = response.generated_videos.len(),
                    "video generation completed"
                );
                VideoUsage::Completed {
                    actual: response.generated_videos.len(),
                    rai_filtered_count: response.rai_media_filtered_count,
                    rai_filtered_reasons: response.rai_media_filtered_reasons.clone(),
                }
            }
            Err(e) => {
                tracing::debug!(model, error = %e, "video generation did not complete");
                VideoUsage::Failed {
                    requested: 0,
                    error: e.to_string(),
                }
            }
        };
        self.meter(ctx, model, request_time, usage);
        outcome
    }

    async fn poll_until_done(
        &self,
        cancellation: Option<&CancellationToken>,
        operation: &GenerateVideosOperation,
        deadline: Instant,
        poll_interval: Duration,
        timeout: Duration,
    ) -> StdResult<GenerateVideosResponse, VideoWaitError> {
        let mut ticker = interval_at(Instant::now() + poll_interval, poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut current = operation.clone();

        loop {
            tokio::select! {
                biased;
                _ = cancelled(cancellation) => return Err(VideoWaitError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(VideoWaitError::Timeout(timeout)),
                _ = ticker.tick() => {}
            }

            let polled = tokio::select! {
                biased;
                _ = cancelled(cancellation) => return Err(VideoWaitError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(VideoWaitError::Timeout(timeout)),
                polled = self.client.backend().get_videos_operation(&current) => polled,
            };

            let updated = match polled {
                Ok(updated) => updated,
                Err(e) => {
                    tracing::error!(operation = %current.name, error = %e, "failed to get operation status");
                    continue;
                }
            };

            if !updated.done {
                tracing::debug!(operation = %updated.name, "video generation still in progress");
                current = updated;
                continue;
            }

            if updated.failed() {
                let detail = updated
                    .error
                    .map(|e| serde_json::Value::Object(e).to_string())
                    .unwrap_or_default();
                return Err(VideoWaitError::Failed(detail));
            }
            return updated.response.ok_or(VideoWaitError::NoResponse);
        }
    }

    fn meter(&self, ctx: &CallContext, model: &str, request_time: DateTime<Utc>, usage: VideoUsage) {
        let timing = Timing::single_response(request_time, Utc::now());
        let model = model.to_string();
        let provider = self.client.provider();
        let metadata = ctx.shared_metadata();
        self.client.dispatcher().dispatch(CallKind::Video, move || {
            let ctx = PayloadContext {
                model: &model,
                provider,
                timing,
                metadata: &metadata,
            };
            build_video_payload(&ctx, &usage)
        });
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

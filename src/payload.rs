//! Metering payload construction.
//!
//! A payload is a flat JSON object matching the metering wire contract.
//! Billing fields (token counts, stop reason, artifact counts) are always
//! top-level; descriptive detail goes under `attributes`.
//!
//! Caller metadata is copied through [`METADATA_ALLOW_LIST`] only. Keys such
//! as `operationType` or `costType` are fixed per call kind and cannot be
//! overridden from metadata.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::context::UsageMetadata;
use crate::provider::Provider;
use crate::stop_reason::StopReason;
use crate::usage::UsageRecord;
use crate::util::MIDDLEWARE_SOURCE;

pub const COST_TYPE: &str = "AI";

/// Stop reason of a video operation that has started but not finished.
pub const STOP_REASON_PENDING: &str = "PENDING";

/// Metadata keys copied into payloads. Everything else is dropped.
pub const METADATA_ALLOW_LIST: &[&str] = &[
    "organizationId",
    "productId",
    "taskType",
    "taskId",
    "agent",
    "subscriptionId",
    "traceId",
    "transactionId",
    "subscriber",
    "responseQualityScore",
    "modelSource",
    "temperature",
    "mediationLatency",
    "traceType",
    "traceName",
    "environment",
    "region",
    "retryNumber",
    "credentialAlias",
    "parentTransactionId",
];

/// Kind of metered call. Selects the endpoint and the operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Chat,
    Image,
    Video,
}

impl CallKind {
    pub fn endpoint_path(&self) -> &'static str {
        match self {
            CallKind::Chat => "/meter/v2/ai/completions",
            CallKind::Image => "/meter/v2/ai/images",
            CallKind::Video => "/meter/v2/ai/video",
        }
    }

    pub fn operation_type(&self) -> &'static str {
        match self {
            CallKind::Chat => "CHAT",
            CallKind::Image => "IMAGE",
            CallKind::Video => "VIDEO",
        }
    }
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.operation_type())
    }
}

/// Wall-clock timing of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub request_time: DateTime<Utc>,
    /// Time of the first output token. Equals `response_time` for
    /// non-streaming calls.
    pub completion_start_time: DateTime<Utc>,
    pub response_time: DateTime<Utc>,
}

impl Timing {
    pub fn new(
        request_time: DateTime<Utc>,
        completion_start_time: DateTime<Utc>,
        response_time: DateTime<Utc>,
    ) -> Self {
        Self {
            request_time,
            completion_start_time,
            response_time,
        }
    }

    /// Timing for a call whose whole output arrived at once.
    pub fn single_response(request_time: DateTime<Utc>, response_time: DateTime<Utc>) -> Self {
        Self::new(request_time, response_time, response_time)
    }

    pub fn request_duration_ms(&self) -> i64 {
        (self.response_time - self.request_time)
            .num_milliseconds()
            .max(0)
    }

    pub fn time_to_first_token_ms(&self) -> i64 {
        (self.completion_start_time - self.request_time)
            .num_milliseconds()
            .max(0)
    }
}

fn iso8601(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A built metering record. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MeteringPayload(Map<String, Value>);

impl MeteringPayload {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.0.get("transactionId").and_then(Value::as_str)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

impl From<Map<String, Value>> for MeteringPayload {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Call-level facts shared by every payload kind.
#[derive(Debug, Clone, Copy)]
pub struct PayloadContext<'a> {
    pub model: &'a str,
    pub provider: Provider,
    pub timing: Timing,
    pub metadata: &'a UsageMetadata,
}

fn base_payload(kind: CallKind, ctx: &PayloadContext<'_>, stop_reason: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("stopReason".into(), json!(stop_reason));
    map.insert("costType".into(), json!(COST_TYPE));
    map.insert("operationType".into(), json!(kind.operation_type()));
    map.insert("model".into(), json!(ctx.model));
    map.insert("provider".into(), json!(ctx.provider.as_str()));
    map.insert("transactionId".into(), json!(Uuid::new_v4().to_string()));
    map.insert("requestTime".into(), json!(iso8601(ctx.timing.request_time)));
    map.insert("responseTime".into(), json!(iso8601(ctx.timing.response_time)));
    map.insert("requestDuration".into(), json!(ctx.timing.request_duration_ms()));
    map.insert("middlewareSource".into(), json!(MIDDLEWARE_SOURCE));
    map
}

/// Copy allow-listed metadata. A metadata `transactionId` replaces the
/// generated one; a metadata `temperature` replaces the request's.
fn apply_metadata(map: &mut Map<String, Value>, metadata: &UsageMetadata) {
    for key in METADATA_ALLOW_LIST {
        if let Some(value) = metadata.get(key) {
            map.insert((*key).to_string(), value.clone());
        }
    }
    let dropped = metadata
        .iter()
        .filter(|(k, _)| !METADATA_ALLOW_LIST.contains(&k.as_str()))
        .count();
    if dropped > 0 {
        tracing::debug!(dropped, "ignoring metadata keys outside the allow-list");
    }
}

fn finish(map: Map<String, Value>) -> MeteringPayload {
    MeteringPayload(map)
}

// f32 Display is the shortest string that round-trips, so 0.7 stays 0.7.
fn temperature_value(temperature: f32) -> Value {
    let widened = temperature
        .to_string()
        .parse::<f64>()
        .unwrap_or_else(|_| f64::from(temperature));
    json!(widened)
}

/// Payload for a content-generation call.
pub fn build_chat_payload(
    ctx: &PayloadContext<'_>,
    record: &UsageRecord,
    is_streamed: bool,
    error: Option<&str>,
) -> MeteringPayload {
    let mut map = base_payload(CallKind::Chat, ctx, record.stop_reason.as_str());
    let tokens = &record.tokens;
    map.insert("isStreamed".into(), json!(is_streamed));
    map.insert("inputTokenCount".into(), json!(tokens.input));
    map.insert("outputTokenCount".into(), json!(tokens.output));
    map.insert("reasoningTokenCount".into(), json!(tokens.reasoning));
    map.insert("cacheCreationTokenCount".into(), json!(0));
    map.insert("cacheReadTokenCount".into(), json!(tokens.cached));
    map.insert("totalTokenCount".into(), json!(tokens.total));
    map.insert(
        "completionStartTime".into(),
        json!(iso8601(ctx.timing.completion_start_time)),
    );
    map.insert(
        "timeToFirstToken".into(),
        json!(ctx.timing.time_to_first_token_ms()),
    );

    if let Some(reason) = error {
        map.insert("errorReason".into(), json!(reason));
    }
    if let Some(temperature) = record.temperature {
        map.insert("temperature".into(), temperature_value(temperature));
    }
    if let Some(attributes) = record.vision.to_attributes() {
        map.insert("attributes".into(), Value::Object(attributes));
    }
    if let Some(prompts) = &record.prompts {
        if let Some(system) = &prompts.system_prompt {
            map.insert("systemPrompt".into(), json!(system));
        }
        if let Some(messages) = &prompts.input_messages {
            map.insert("inputMessages".into(), json!(messages));
        }
        if let Some(output) = &prompts.output_response {
            map.insert("outputResponse".into(), json!(output));
        }
        if prompts.truncated {
            map.insert("promptsTruncated".into(), json!(true));
        }
    }

    apply_metadata(&mut map, ctx.metadata);
    finish(map)
}

/// Which image operation produced the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOperation {
    Generate {
        aspect_ratio: Option<String>,
        output_mime_type: Option<String>,
        person_generation: Option<String>,
    },
    Edit {
        output_mime_type: Option<String>,
        person_generation: Option<String>,
    },
    Upscale {
        upscale_factor: String,
    },
}

impl ImageOperation {
    fn attributes(&self) -> Map<String, Value> {
        fn put(attrs: &mut Map<String, Value>, key: &str, value: &Option<String>) {
            if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
                attrs.insert(key.to_string(), json!(v));
            }
        }

        let mut attrs = Map::new();
        match self {
            ImageOperation::Generate {
                aspect_ratio,
                output_mime_type,
                person_generation,
            } => {
                put(&mut attrs, "aspectRatio", aspect_ratio);
                put(&mut attrs, "outputMimeType", output_mime_type);
                put(&mut attrs, "personGeneration", person_generation);
            }
            ImageOperation::Edit {
                output_mime_type,
                person_generation,
            } => {
                put(&mut attrs, "outputMimeType", output_mime_type);
                put(&mut attrs, "personGeneration", person_generation);
                attrs.insert("operationSubtype".into(), json!("edit"));
            }
            ImageOperation::Upscale { upscale_factor } => {
                attrs.insert("operationSubtype".into(), json!("upscale"));
                attrs.insert("upscaleFactor".into(), json!(upscale_factor));
            }
        }
        attrs
    }
}

/// Outcome of an image call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUsage {
    pub operation: ImageOperation,
    pub requested: u32,
    /// Images returned. Zero on error.
    pub actual: usize,
    pub error: Option<String>,
}

pub fn build_image_payload(ctx: &PayloadContext<'_>, usage: &ImageUsage) -> MeteringPayload {
    let stop_reason = if usage.error.is_some() {
        StopReason::Error
    } else {
        StopReason::End
    };
    let mut map = base_payload(CallKind::Image, ctx, stop_reason.as_str());
    let actual = if usage.error.is_some() { 0 } else { usage.actual };
    map.insert("actualImageCount".into(), json!(actual));
    map.insert("requestedImageCount".into(), json!(usage.requested));
    if let Some(reason) = &usage.error {
        map.insert("errorReason".into(), json!(reason));
    }
    let attributes = usage.operation.attributes();
    if !attributes.is_empty() {
        map.insert("attributes".into(), Value::Object(attributes));
    }
    apply_metadata(&mut map, ctx.metadata);
    finish(map)
}

/// Phase of a long-running video operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoUsage {
    /// Operation accepted, nothing generated yet.
    Started {
        operation_name: String,
        aspect_ratio: Option<String>,
        requested: u32,
    },
    Completed {
        actual: usize,
        rai_filtered_count: i32,
        rai_filtered_reasons: Vec<String>,
    },
    Failed {
        requested: u32,
        error: String,
    },
}

pub fn build_video_payload(ctx: &PayloadContext<'_>, usage: &VideoUsage) -> MeteringPayload {
    let mut map = match usage {
        VideoUsage::Started {
            operation_name,
            aspect_ratio,
            requested,
        } => {
            let mut map = base_payload(CallKind::Video, ctx, STOP_REASON_PENDING);
            map.insert("actualVideoCount".into(), json!(0));
            map.insert("requestedVideoCount".into(), json!(requested));
            let mut attrs = Map::new();
            attrs.insert("operationPhase".into(), json!("start"));
            if !operation_name.is_empty() {
                attrs.insert("operationName".into(), json!(operation_name));
            }
            if let Some(ratio) = aspect_ratio.as_deref().filter(|r| !r.is_empty()) {
                attrs.insert("aspectRatio".into(), json!(ratio));
            }
            map.insert("attributes".into(), Value::Object(attrs));
            map
        }
        VideoUsage::Completed {
            actual,
            rai_filtered_count,
            rai_filtered_reasons,
        } => {
            let mut map = base_payload(CallKind::Video, ctx, StopReason::End.as_str());
            map.insert("actualVideoCount".into(), json!(actual));
            // The request count is not known at completion time.
            map.insert("requestedVideoCount".into(), json!(actual));
            let mut attrs = Map::new();
            attrs.insert("operationPhase".into(), json!("complete"));
            if *rai_filtered_count > 0 {
                attrs.insert("raiFilteredCount".into(), json!(rai_filtered_count));
                attrs.insert("raiFilteredReasons".into(), json!(rai_filtered_reasons));
            }
            map.insert("attributes".into(), Value::Object(attrs));
            map
        }
        VideoUsage::Failed { requested, error } => {
            let mut map = base_payload(CallKind::Video, ctx, StopReason::Error.as_str());
            map.insert("errorReason".into(), json!(error));
            map.insert("actualVideoCount".into(), json!(0));
            map.insert("requestedVideoCount".into(), json!(requested));
            map
        }
    };
    apply_metadata(&mut map, ctx.metadata);
    finish(map)
}

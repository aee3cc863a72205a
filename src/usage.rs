//! Usage extraction.
//!
//! Turns one request/response pair (or the state accumulated from a stream)
//! into a [`UsageRecord`]. Extraction is a pure function of its inputs:
//! nothing here performs I/O or reads the clock.

use crate::genai::{Content, GenerateContentConfig, GenerateContentResponse, UsageMetadata};
use crate::prompt::{self, PromptData};
use crate::stop_reason::{extract_finish_reason, map_finish_reason, StopReason};
use crate::vision::{detect_vision_content, VisionStats};

/// A content-generation request as the caller issued it.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub model: String,
    pub contents: Vec<Content>,
    pub config: Option<GenerateContentConfig>,
}

impl ChatRequest {
    pub fn new(
        model: impl Into<String>,
        contents: Vec<Content>,
        config: Option<GenerateContentConfig>,
    ) -> Self {
        Self {
            model: model.into(),
            contents,
            config,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCounts {
    pub input: i64,
    pub output: i64,
    pub total: i64,
    pub cached: i64,
    pub reasoning: i64,
}

impl TokenCounts {
    /// Counts from a usage block. Absent usage yields zeros; a zero total is
    /// recomputed as prompt + candidate tokens.
    pub fn from_usage(usage: Option<&UsageMetadata>) -> Self {
        let Some(usage) = usage else {
            return Self::default();
        };
        let input = i64::from(usage.prompt_token_count);
        let output = i64::from(usage.candidates_token_count);
        let total = match i64::from(usage.total_token_count) {
            0 => input + output,
            total => total,
        };
        Self {
            input,
            output,
            total,
            cached: i64::from(usage.cached_content_token_count),
            reasoning: i64::from(usage.thoughts_token_count),
        }
    }
}

/// What the caller got back, in the shape the extractor needs.
#[derive(Debug, Clone, Copy)]
pub enum ResponseView<'a> {
    /// A non-streaming response.
    Complete(&'a GenerateContentResponse),
    /// Usage facts already pulled out of a response, or accumulated from
    /// a stream.
    Summary {
        usage: Option<&'a UsageMetadata>,
        finish_reason: Option<&'a str>,
        text: &'a str,
    },
    /// No response, e.g. the SDK call failed.
    Absent,
}

/// Everything the payload builder needs about one chat call.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub tokens: TokenCounts,
    pub stop_reason: StopReason,
    /// Raw SDK finish reason, before mapping.
    pub finish_reason: Option<String>,
    pub temperature: Option<f32>,
    pub vision: VisionStats,
    /// Only present when prompt capture is enabled.
    pub prompts: Option<PromptData>,
}

/// Build the usage record for a chat call.
///
/// `default_stop` is used when the response carries no finish reason, or one
/// that does not map to a specific stop reason.
pub fn extract_usage(
    request: &ChatRequest,
    response: ResponseView<'_>,
    default_stop: StopReason,
    capture_prompts: bool,
) -> UsageRecord {
    let (usage, finish_reason) = match response {
        ResponseView::Complete(resp) => (
            resp.usage_metadata.as_ref(),
            extract_finish_reason(Some(resp)).map(|r| r.as_str()),
        ),
        ResponseView::Summary {
            usage,
            finish_reason,
            ..
        } => (usage, finish_reason),
        ResponseView::Absent => (None, None),
    };

    let stop_reason = finish_reason
        .map(|reason| map_finish_reason(reason, default_stop))
        .unwrap_or(default_stop);

    let prompts = capture_prompts.then(|| {
        let mut data = prompt::extract_request_prompts(&request.contents, request.config.as_ref());
        let (output, truncated) = match response {
            ResponseView::Complete(resp) => prompt::extract_response_text(Some(resp)),
            ResponseView::Summary { text, .. } => prompt::capture_output(text),
            ResponseView::Absent => (None, false),
        };
        data.output_response = output;
        data.truncated |= truncated;
        data
    });

    UsageRecord {
        tokens: TokenCounts::from_usage(usage),
        stop_reason,
        finish_reason: finish_reason.map(str::to_string),
        temperature: request.config.as_ref().and_then(|c| c.temperature),
        vision: detect_vision_content(&request.contents),
        prompts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genai::{Candidate, Part};

    fn usage(prompt: i32, candidates: i32, total: i32) -> UsageMetadata {
        UsageMetadata {
            prompt_token_count: prompt,
            candidates_token_count: candidates,
            total_token_count: total,
            ..Default::default()
        }
    }

    fn response(finish: &str, usage_block: Option<UsageMetadata>) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content::model_text("X is a letter.")),
                finish_reason: Some(finish.into()),
                index: Some(0),
            }],
            usage_metadata: usage_block,
            model_version: None,
        }
    }

    #[test]
    fn total_is_computed_when_missing() {
        let counts = TokenCounts::from_usage(Some(&usage(10, 5, 0)));
        assert_eq!(counts.total, 15);

        let counts = TokenCounts::from_usage(Some(&usage(10, 5, 42)));
        assert_eq!(counts.total, 42);

        assert_eq!(TokenCounts::from_usage(None), TokenCounts::default());
    }

    #[test]
    fn cached_and_reasoning_tokens() {
        let block = UsageMetadata {
            prompt_token_count: 100,
            candidates_token_count: 20,
            total_token_count: 150,
            cached_content_token_count: 60,
            thoughts_token_count: 30,
        };
        let counts = TokenCounts::from_usage(Some(&block));
        assert_eq!(counts.cached, 60);
        assert_eq!(counts.reasoning, 30);
        assert_eq!(counts.total, 150);
    }

    #[test]
    fn complete_response() {
        let request = ChatRequest::new(
            "gemini-2.0-flash",
            vec![Content::user_text("Explain X")],
            Some(GenerateContentConfig {
                temperature: Some(0.2),
                ..Default::default()
            }),
        );
        let resp = response("STOP", Some(usage(10, 5, 0)));
        let record = extract_usage(&request, ResponseView::Complete(&resp), StopReason::End, false);

        assert_eq!(record.stop_reason, StopReason::End);
        assert_eq!(record.finish_reason.as_deref(), Some("STOP"));
        assert_eq!(record.tokens.total, 15);
        assert_eq!(record.temperature, Some(0.2));
        assert!(!record.vision.has_vision_content);
        assert!(record.prompts.is_none());
    }

    #[test]
    fn absent_response_uses_default_and_zeros() {
        let request = ChatRequest::new("gemini-2.0-flash", vec![Content::user_text("hi")], None);
        let record = extract_usage(&request, ResponseView::Absent, StopReason::Error, true);
        assert_eq!(record.stop_reason, StopReason::Error);
        assert_eq!(record.tokens, TokenCounts::default());
        let prompts = record.prompts.expect("captured");
        assert!(prompts.input_messages.is_some());
        assert!(prompts.output_response.is_none());
    }

    #[test]
    fn streamed_state() {
        let request = ChatRequest::new(
            "gemini-2.0-flash",
            vec![Content::new(
                "user",
                vec![Part::text("what is this?"), Part::inline_data("image/png", vec![0u8; 8])],
            )],
            None,
        );
        let block = usage(7, 3, 10);
        let record = extract_usage(
            &request,
            ResponseView::Summary {
                usage: Some(&block),
                finish_reason: Some("MAX_TOKENS"),
                text: "partial answer",
            },
            StopReason::End,
            true,
        );
        assert_eq!(record.stop_reason, StopReason::TokenLimit);
        assert_eq!(record.tokens.total, 10);
        assert_eq!(record.vision.image_count, 1);
        assert_eq!(
            record.prompts.unwrap().output_response.as_deref(),
            Some("partial answer")
        );
    }

    #[test]
    fn extraction_is_idempotent() {
        let request = ChatRequest::new(
            "gemini-2.0-flash",
            vec![Content::user_text("y".repeat(prompt::MAX_PROMPT_LENGTH))],
            Some(GenerateContentConfig {
                system_instruction: Some(Content::system("sys")),
                ..Default::default()
            }),
        );
        let resp = response("SAFETY", Some(usage(1, 2, 3)));
        let first = extract_usage(&request, ResponseView::Complete(&resp), StopReason::End, true);
        let second = extract_usage(&request, ResponseView::Complete(&resp), StopReason::End, true);
        assert_eq!(first, second);
        assert_eq!(first.stop_reason, StopReason::Error);
        assert!(first.prompts.as_ref().unwrap().truncated);
    }
}

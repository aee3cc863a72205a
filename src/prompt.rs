//! Opt-in prompt and response capture.
//!
//! Every captured field is capped at [`MAX_PROMPT_LENGTH`] characters. Input
//! messages are capped individually at half that limit before the list is
//! serialized, so the JSON array itself is never cut.

use serde::Serialize;

use crate::genai::{Content, GenerateContentConfig, GenerateContentResponse};

pub const MAX_PROMPT_LENGTH: usize = 50_000;
pub const TRUNCATION_MARKER: &str = "...[TRUNCATED]";

/// Captured text for one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptData {
    pub system_prompt: Option<String>,
    /// JSON array of `{"role", "content"}` objects.
    pub input_messages: Option<String>,
    pub output_response: Option<String>,
    /// Set when any field was shortened.
    pub truncated: bool,
}

impl PromptData {
    pub fn is_empty(&self) -> bool {
        self.system_prompt.is_none() && self.input_messages.is_none() && self.output_response.is_none()
    }
}

#[derive(Debug, Serialize)]
struct CapturedMessage<'a> {
    role: &'a str,
    content: String,
}

/// Cap `text` at `limit` characters.
///
/// Longer text keeps its first `limit - marker` characters followed by the
/// marker, so the result is exactly `limit` characters long. Cuts always
/// land on a character boundary.
pub fn truncate_text(text: &str, limit: usize) -> (String, bool) {
    // Byte length bounds the character count from above.
    if text.len() <= limit || text.chars().count() <= limit {
        return (text.to_string(), false);
    }
    let keep = limit.saturating_sub(TRUNCATION_MARKER.chars().count());
    let cut = text
        .char_indices()
        .nth(keep)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    let mut out = String::with_capacity(cut + TRUNCATION_MARKER.len());
    out.push_str(&text[..cut]);
    out.push_str(TRUNCATION_MARKER);
    (out, true)
}

/// System instruction and input messages from a content request.
pub fn extract_request_prompts(
    contents: &[Content],
    config: Option<&GenerateContentConfig>,
) -> PromptData {
    let mut data = PromptData::default();

    if let Some(system) = config.and_then(|c| c.system_instruction.as_ref()) {
        let text = system.text();
        if !text.is_empty() {
            let (text, truncated) = truncate_text(&text, MAX_PROMPT_LENGTH);
            if truncated {
                tracing::debug!(limit = MAX_PROMPT_LENGTH, "system prompt truncated");
            }
            data.truncated |= truncated;
            data.system_prompt = Some(text);
        }
    }

    let half_limit = MAX_PROMPT_LENGTH / 2;
    let messages: Vec<CapturedMessage<'_>> = contents
        .iter()
        .map(|content| {
            let role = content
                .role
                .as_deref()
                .filter(|r| !r.is_empty())
                .unwrap_or("user");
            let (text, truncated) = truncate_text(&content.text(), half_limit);
            data.truncated |= truncated;
            CapturedMessage {
                role,
                content: text,
            }
        })
        .collect();

    if !messages.is_empty() {
        match serde_json::to_string(&messages) {
            Ok(json) => data.input_messages = Some(json),
            Err(e) => tracing::warn!(error = %e, "failed to serialize input messages"),
        }
    }

    data
}

/// Output text of a complete response.
pub fn extract_response_text(response: Option<&GenerateContentResponse>) -> (Option<String>, bool) {
    match response {
        Some(resp) => capture_output(&resp.text()),
        None => (None, false),
    }
}

/// Output text accumulated from a stream.
pub fn capture_output(text: &str) -> (Option<String>, bool) {
    if text.is_empty() {
        return (None, false);
    }
    let (text, truncated) = truncate_text(text, MAX_PROMPT_LENGTH);
    if truncated {
        tracing::debug!(limit = MAX_PROMPT_LENGTH, "output response truncated");
    }
    (Some(text), truncated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genai::{Candidate, Part};

    #[test]
    fn short_text_is_untouched() {
        let (out, truncated) = truncate_text("hello", MAX_PROMPT_LENGTH);
        assert_eq!(out, "hello");
        assert!(!truncated);

        let exact = "a".repeat(MAX_PROMPT_LENGTH);
        let (out, truncated) = truncate_text(&exact, MAX_PROMPT_LENGTH);
        assert_eq!(out.len(), MAX_PROMPT_LENGTH);
        assert!(!truncated);
    }

    #[test]
    fn long_ascii_is_cut_to_limit() {
        let text = "a".repeat(MAX_PROMPT_LENGTH + 1);
        let (out, truncated) = truncate_text(&text, MAX_PROMPT_LENGTH);
        assert!(truncated);
        assert_eq!(out.chars().count(), MAX_PROMPT_LENGTH);
        assert!(out.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn multibyte_text_never_splits_a_character() {
        // 2-, 3- and 4-byte characters interleaved.
        let text = "é中🦀".repeat(MAX_PROMPT_LENGTH);
        let (out, truncated) = truncate_text(&text, MAX_PROMPT_LENGTH);
        assert!(truncated);
        assert_eq!(out.chars().count(), MAX_PROMPT_LENGTH);
        assert!(out.ends_with(TRUNCATION_MARKER));
        assert!(std::str::from_utf8(out.as_bytes()).is_ok());
        let body = out.strip_suffix(TRUNCATION_MARKER).unwrap();
        assert!(text.starts_with(body));
    }

    #[test]
    fn multibyte_text_under_limit_in_characters_is_kept() {
        // More bytes than the limit, fewer characters.
        let text = "中".repeat(MAX_PROMPT_LENGTH - 1);
        assert!(text.len() > MAX_PROMPT_LENGTH);
        let (out, truncated) = truncate_text(&text, MAX_PROMPT_LENGTH);
        assert!(!truncated);
        assert_eq!(out, text);
    }

    #[test]
    fn captures_system_and_messages() {
        let contents = vec![
            Content::user_text("Explain X"),
            Content::model_text("X is..."),
            Content {
                role: None,
                parts: vec![Part::text("line one"), Part::text("line two")],
            },
        ];
        let config = GenerateContentConfig {
            system_instruction: Some(Content::system("Be brief.")),
            ..Default::default()
        };
        let data = extract_request_prompts(&contents, Some(&config));
        assert_eq!(data.system_prompt.as_deref(), Some("Be brief."));
        assert!(!data.truncated);

        let messages: serde_json::Value =
            serde_json::from_str(data.input_messages.as_deref().unwrap()).unwrap();
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"], "Explain X");
        assert_eq!(messages[1]["role"], "model");
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"], "line one\nline two");
    }

    #[test]
    fn message_just_over_half_limit_is_truncated_once() {
        let half = MAX_PROMPT_LENGTH / 2;
        let contents = vec![Content::user_text("\"q\"".repeat(half / 3 + 1))];
        let data = extract_request_prompts(&contents, None);
        assert!(data.truncated);

        let json = data.input_messages.unwrap();
        let messages: Vec<serde_json::Value> = serde_json::from_str(&json).expect("valid JSON");
        let content = messages[0]["content"].as_str().unwrap();
        assert_eq!(content.chars().count(), half);
        assert!(content.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn many_large_messages_stay_valid_json() {
        let contents: Vec<Content> = (0..4)
            .map(|i| Content::user_text(format!("{i}{}", "ü".repeat(MAX_PROMPT_LENGTH))))
            .collect();
        let data = extract_request_prompts(&contents, None);
        assert!(data.truncated);
        let json = data.input_messages.unwrap();
        assert!(json.chars().count() > MAX_PROMPT_LENGTH);
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 4);
    }

    #[test]
    fn response_and_stream_output() {
        assert_eq!(extract_response_text(None), (None, false));

        let resp = GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content::model_text("done")),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(extract_response_text(Some(&resp)), (Some("done".into()), false));

        assert_eq!(capture_output(""), (None, false));
        let (out, truncated) = capture_output(&"z".repeat(MAX_PROMPT_LENGTH * 2));
        assert!(truncated);
        assert_eq!(out.unwrap().chars().count(), MAX_PROMPT_LENGTH);
    }
}

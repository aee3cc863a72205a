//! Finish-reason normalization.
//!
//! Gemini / Vertex finish reasons are mapped onto the closed set of stop
//! reasons the metering API accepts. Mapping never fails: unknown or empty
//! input yields the caller's default.

use serde::{Deserialize, Serialize};

use crate::genai::{FinishReason, GenerateContentResponse};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopReason {
    End,
    EndSequence,
    Timeout,
    TokenLimit,
    CostLimit,
    CompletionLimit,
    Error,
    Cancelled,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::End => "END",
            StopReason::EndSequence => "END_SEQUENCE",
            StopReason::Timeout => "TIMEOUT",
            StopReason::TokenLimit => "TOKEN_LIMIT",
            StopReason::CostLimit => "COST_LIMIT",
            StopReason::CompletionLimit => "COMPLETION_LIMIT",
            StopReason::Error => "ERROR",
            StopReason::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map an SDK finish reason (case-insensitive) to a [`StopReason`].
pub fn map_finish_reason(finish_reason: &str, default: StopReason) -> StopReason {
    let normalized = finish_reason.trim().to_ascii_uppercase();
    match normalized.as_str() {
        "" => default,
        "STOP" => StopReason::End,
        "MAX_TOKENS" => StopReason::TokenLimit,
        // Safety and content filtering
        "SAFETY"
        | "RECITATION"
        | "BLOCKLIST"
        | "PROHIBITED_CONTENT"
        | "SPII"
        | "MODEL_ARMOR"
        | "IMAGE_SAFETY"
        | "IMAGE_PROHIBITED_CONTENT"
        | "IMAGE_RECITATION" => StopReason::Error,
        // Tool call failures
        "MALFORMED_FUNCTION_CALL" | "UNEXPECTED_TOOL_CALL" | "NO_IMAGE" => StopReason::Error,
        "CANCELLED" | "CANCELED" => StopReason::Cancelled,
        "FINISH_REASON_UNSPECIFIED" | "OTHER" | "IMAGE_OTHER" => default,
        _ => {
            tracing::warn!(
                finish_reason,
                fallback = %default,
                "unknown finish reason, using fallback"
            );
            default
        }
    }
}

/// Finish reason of the first candidate, if any.
pub fn extract_finish_reason(response: Option<&GenerateContentResponse>) -> Option<&FinishReason> {
    response?.first_candidate()?.finish_reason.as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genai::Candidate;

    #[test]
    fn maps_documented_reasons() {
        let cases = [
            ("STOP", StopReason::End),
            ("MAX_TOKENS", StopReason::TokenLimit),
            ("SAFETY", StopReason::Error),
            ("RECITATION", StopReason::Error),
            ("BLOCKLIST", StopReason::Error),
            ("PROHIBITED_CONTENT", StopReason::Error),
            ("SPII", StopReason::Error),
            ("MODEL_ARMOR", StopReason::Error),
            ("IMAGE_SAFETY", StopReason::Error),
            ("IMAGE_PROHIBITED_CONTENT", StopReason::Error),
            ("IMAGE_RECITATION", StopReason::Error),
            ("MALFORMED_FUNCTION_CALL", StopReason::Error),
            ("UNEXPECTED_TOOL_CALL", StopReason::Error),
            ("NO_IMAGE", StopReason::Error),
            ("CANCELLED", StopReason::Cancelled),
            ("CANCELED", StopReason::Cancelled),
        ];
        for (input, expected) in cases {
            assert_eq!(map_finish_reason(input, StopReason::End), expected, "{input}");
            assert_eq!(
                map_finish_reason(&input.to_ascii_lowercase(), StopReason::End),
                expected,
                "lowercase {input}"
            );
        }
        assert_eq!(map_finish_reason("Max_Tokens", StopReason::End), StopReason::TokenLimit);
    }

    #[test]
    fn unspecified_and_unknown_use_default() {
        for input in ["", "FINISH_REASON_UNSPECIFIED", "OTHER", "IMAGE_OTHER", "BRAND_NEW_REASON"] {
            assert_eq!(map_finish_reason(input, StopReason::End), StopReason::End);
            assert_eq!(map_finish_reason(input, StopReason::Timeout), StopReason::Timeout);
        }
    }

    #[test]
    fn serializes_as_wire_strings() {
        assert_eq!(
            serde_json::to_value(StopReason::EndSequence).unwrap(),
            serde_json::json!("END_SEQUENCE")
        );
        assert_eq!(StopReason::CompletionLimit.to_string(), "COMPLETION_LIMIT");
    }

    #[test]
    fn extracts_first_candidate_reason() {
        assert!(extract_finish_reason(None).is_none());
        assert!(extract_finish_reason(Some(&GenerateContentResponse::default())).is_none());

        let resp = GenerateContentResponse {
            candidates: vec![
                Candidate {
                    finish_reason: Some("SAFETY".into()),
                    ..Default::default()
                },
                Candidate {
                    finish_reason: Some("STOP".into()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert_eq!(extract_finish_reason(Some(&resp)).map(|r| r.as_str()), Some("SAFETY"));
    }
}

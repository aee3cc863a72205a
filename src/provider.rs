use serde::{Deserialize, Serialize};

use crate::config::Config;

/// Backend a call is routed to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Provider {
    /// Direct Gemini API, authenticated with an API key.
    #[serde(rename = "GOOGLE_AI")]
    GoogleAi,
    /// Vertex AI, addressed by project and location.
    #[serde(rename = "VERTEX_AI")]
    VertexAi,
}

impl Provider {
    /// Explicit disable forces the direct API; otherwise a project id
    /// selects Vertex AI.
    pub fn detect(vertex_disabled: bool, project_id: Option<&str>) -> Self {
        if vertex_disabled {
            return Provider::GoogleAi;
        }
        match project_id.map(str::trim) {
            Some(id) if !id.is_empty() => Provider::VertexAi,
            _ => Provider::GoogleAi,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::GoogleAi => "GOOGLE_AI",
            Provider::VertexAi => "VERTEX_AI",
        }
    }

    pub fn is_vertex_ai(&self) -> bool {
        matches!(self, Provider::VertexAi)
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn detect_provider(config: &Config) -> Provider {
    Provider::detect(config.vertex_disabled, config.project_id.as_deref())
}

#![forbid(unsafe_code)]
#![doc = r#"
Revenium metering middleware for Google Gemini and Vertex AI.

Wraps a GenAI SDK backend, returns every SDK result unchanged, and reports
usage (tokens, timing, stop reason, image/video counts) to the Revenium
metering API from background tasks.

Crate highlights
- `ReveniumGoogle`: metered client. `models()` for content generation and
  streaming, `images()` for Imagen, `videos()` for Veo.
- `initialize` / `get_client`: one shared client per process.
- `CallContext`: per-call business metadata (organization, trace, subscriber).
- `flush().await`: wait for pending metering before shutdown.

Modules
- `config`: Configuration builder, environment and `.env` loading.
- `genai`: SDK request/response types and the `GenAiBackend` seam.
- `usage`, `stop_reason`, `vision`, `prompt`: usage extraction.
- `payload`: Metering payload construction.
- `delivery`, `dispatch`: Background delivery with retry.
- `middleware`, `images`, `videos`: Metered wrappers.

Note: Metering failures are logged and never reach the caller.
"#]

pub mod config;
pub mod context;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod genai;
pub mod images;
pub mod middleware;
pub mod payload;
pub mod prompt;
pub mod provider;
pub mod stop_reason;
pub mod usage;
pub mod util;
pub mod videos;
pub mod vision;

pub use crate::config::{Config, ConfigBuilder};
pub use crate::context::{CallContext, UsageMetadata};
pub use crate::dispatch::DispatchStats;
pub use crate::error::{Error, Result};
pub use crate::genai::{BackendConnector, BackendSettings, GenAiBackend, GenAiError};
pub use crate::images::Images;
pub use crate::middleware::{
    get_client, initialize, is_initialized, reset, MeteredStream, Models, ReveniumGoogle,
};
pub use crate::provider::Provider;
pub use crate::stop_reason::{map_finish_reason, StopReason};
pub use crate::videos::{VideoWaitError, Videos};

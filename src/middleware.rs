//! Metered GenAI client.
//!
//! [`ReveniumGoogle`] owns the wrapped SDK backend and the metering
//! dispatcher. Each wrapper call runs the SDK operation, returns its result
//! untouched, and hands usage facts to a background task.
//!
//! A process-wide client can be installed with [`initialize`] and fetched
//! with [`get_client`]; hosts that prefer explicit ownership construct
//! [`ReveniumGoogle::new`] directly.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, Stream, StreamExt};
use once_cell::sync::Lazy;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::config::{Config, ConfigBuilder};
use crate::context::{CallContext, UsageMetadata};
use crate::delivery::MeteringDelivery;
use crate::dispatch::{DispatchStats, MeteringDispatcher};
use crate::error::{Error, Result};
use crate::genai::{
    BackendConnector, BackendSettings, Content, GenAiBackend, GenAiError, GenerateContentConfig,
    GenerateContentResponse, UsageMetadata as TokenUsage,
};
use crate::images::Images;
use crate::payload::{build_chat_payload, CallKind, PayloadContext, Timing};
use crate::provider::{detect_provider, Provider};
use crate::stop_reason::{extract_finish_reason, StopReason};
use crate::usage::{extract_usage, ChatRequest, ResponseView};
use crate::videos::Videos;

/// Published client. Readers load it without locking.
static GLOBAL_CLIENT: Lazy<ArcSwapOption<ReveniumGoogle>> = Lazy::new(ArcSwapOption::empty);
/// Serializes `initialize` and `reset`.
static LIFECYCLE: Mutex<()> = Mutex::new(());

/// Install the process-wide client.
///
/// Explicit builder values win over the environment. Calling this again
/// once a client is installed is a no-op.
pub fn initialize(builder: ConfigBuilder, connector: &dyn BackendConnector) -> Result<()> {
    let _lifecycle = LIFECYCLE.lock().unwrap_or_else(PoisonError::into_inner);
    if GLOBAL_CLIENT.load().is_some() {
        tracing::debug!("middleware already initialized");
        return Ok(());
    }

    let config = builder.build_with_env()?;
    crate::util::init_tracing(config.debug);
    let client = ReveniumGoogle::new(config, connector)?;
    tracing::info!(provider = %client.provider(), "Revenium Google middleware initialized");
    GLOBAL_CLIENT.store(Some(Arc::new(client)));
    Ok(())
}

pub fn is_initialized() -> bool {
    GLOBAL_CLIENT.load().is_some()
}

/// The process-wide client installed by [`initialize`].
pub fn get_client() -> Result<Arc<ReveniumGoogle>> {
    GLOBAL_CLIENT
        .load_full()
        .ok_or_else(|| Error::config("middleware not initialized, call initialize() first"))
}

/// Flush and remove the process-wide client.
pub async fn reset() {
    let previous = {
        let _lifecycle = LIFECYCLE.lock().unwrap_or_else(PoisonError::into_inner);
        GLOBAL_CLIENT.swap(None)
    };
    if let Some(client) = previous {
        client.flush().await;
        tracing::debug!("middleware reset");
    }
}

/// Metered wrapper around a GenAI backend.
pub struct ReveniumGoogle {
    config: Arc<Config>,
    provider: Provider,
    backend: Arc<dyn GenAiBackend>,
    dispatcher: MeteringDispatcher,
    closed: AtomicBool,
}

impl std::fmt::Debug for ReveniumGoogle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReveniumGoogle")
            .field("config", &self.config)
            .field("provider", &self.provider)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ReveniumGoogle {
    /// Validate credentials for the detected provider and build the SDK
    /// client through `connector`.
    pub fn new(config: Config, connector: &dyn BackendConnector) -> Result<Self> {
        config.validate()?;
        let provider = detect_provider(&config);
        let settings = backend_settings(&config, provider)?;
        tracing::debug!(%provider, settings = ?settings, "creating GenAI client");
        let backend = connector
            .connect(&settings)
            .map_err(|e| Error::provider("failed to create GenAI client", e))?;
        Self::with_backend(config, backend)
    }

    /// Wrap an already constructed backend. Provider detection still
    /// follows the configuration.
    pub fn with_backend(config: Config, backend: Arc<dyn GenAiBackend>) -> Result<Self> {
        config.validate()?;
        let provider = detect_provider(&config);
        let delivery = MeteringDelivery::new(&config)?;
        Ok(Self {
            config: Arc::new(config),
            provider,
            backend,
            dispatcher: MeteringDispatcher::new(delivery),
            closed: AtomicBool::new(false),
        })
    }

    pub fn models(&self) -> Models<'_> {
        Models { client: self }
    }

    pub fn images(&self) -> Images<'_> {
        Images::new(self)
    }

    pub fn videos(&self) -> Videos<'_> {
        Videos::new(self)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// The wrapped SDK backend, for calls that need no metering.
    pub fn backend(&self) -> &Arc<dyn GenAiBackend> {
        &self.backend
    }

    pub(crate) fn dispatcher(&self) -> &MeteringDispatcher {
        &self.dispatcher
    }

    /// Wait for all pending metering tasks.
    pub async fn flush(&self) {
        self.dispatcher.flush().await;
    }

    /// Flush pending metering and mark the client closed.
    pub async fn close(&self) {
        self.flush().await;
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("middleware client closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    fn chat_meter(&self) -> ChatMeter {
        ChatMeter {
            dispatcher: self.dispatcher.clone(),
            provider: self.provider,
            capture_prompts: self.config.capture_prompts,
        }
    }
}

fn backend_settings(config: &Config, provider: Provider) -> Result<BackendSettings> {
    match provider {
        Provider::VertexAi => match (&config.project_id, &config.location) {
            (Some(project), Some(location)) => Ok(BackendSettings::VertexAi {
                project: project.clone(),
                location: location.clone(),
            }),
            _ => Err(Error::config(
                "GOOGLE_CLOUD_PROJECT and GOOGLE_CLOUD_LOCATION are required for Vertex AI",
            )),
        },
        Provider::GoogleAi => match &config.google_api_key {
            Some(api_key) => Ok(BackendSettings::GeminiApi {
                api_key: api_key.clone(),
            }),
            None => Err(Error::config("GOOGLE_API_KEY is required for the Gemini API")),
        },
    }
}

/// Content-generation wrappers.
pub struct Models<'a> {
    client: &'a ReveniumGoogle,
}

impl Models<'_> {
    /// Generate content and meter the call.
    pub async fn generate_content(
        &self,
        ctx: &CallContext,
        model: &str,
        contents: Vec<Content>,
        config: Option<GenerateContentConfig>,
    ) -> std::result::Result<GenerateContentResponse, GenAiError> {
        let request_time = Utc::now();
        tracing::debug!(model, messages = contents.len(), "generate_content");

        let result = self
            .client
            .backend
            .generate_content(model, &contents, config.as_ref())
            .await;

        let timing = Timing::single_response(request_time, Utc::now());
        let outcome = match &result {
            Ok(resp) => ChatOutcome::Complete(ResponseFacts::from_response(
                resp,
                self.client.config.capture_prompts,
            )),
            Err(e) => {
                tracing::debug!(model, error = %e, "generate_content failed");
                ChatOutcome::Failed(e.to_string())
            }
        };
        self.client.chat_meter().dispatch(
            ChatRequest::new(model, contents, config),
            outcome,
            timing,
            false,
            ctx.shared_metadata(),
        );
        result
    }

    /// Start a streaming generation.
    ///
    /// Chunks are forwarded unchanged. Exactly one metering payload is sent
    /// when the stream ends, errors, is cancelled through `ctx`, or is
    /// dropped by the caller.
    pub async fn generate_content_stream(
        &self,
        ctx: &CallContext,
        model: &str,
        contents: Vec<Content>,
        config: Option<GenerateContentConfig>,
    ) -> std::result::Result<MeteredStream, GenAiError> {
        let request_time = Utc::now();
        tracing::debug!(model, messages = contents.len(), "generate_content_stream");

        let meter = self.client.chat_meter();
        let started = self
            .client
            .backend
            .generate_content_stream(model, &contents, config.as_ref())
            .await;
        let request = ChatRequest::new(model, contents, config);

        let inner = match started {
            Ok(inner) => inner,
            Err(e) => {
                tracing::debug!(model, error = %e, "stream failed to start");
                let timing = Timing::single_response(request_time, Utc::now());
                meter.dispatch(
                    request,
                    ChatOutcome::Failed(e.to_string()),
                    timing,
                    true,
                    ctx.shared_metadata(),
                );
                return Err(e);
            }
        };

        let finalizer = StreamFinalizer {
            capture_text: meter.capture_prompts,
            meter,
            request: Some(request),
            metadata: ctx.shared_metadata(),
            request_time,
            state: StreamState::default(),
        };
        Ok(MeteredStream::new(inner, finalizer, ctx.cancellation().cloned()))
    }
}

/// The parts of a response metering reads. Text is kept only when prompt
/// capture is on.
#[derive(Debug, Default)]
struct ResponseFacts {
    usage: Option<TokenUsage>,
    finish_reason: Option<String>,
    text: String,
}

impl ResponseFacts {
    fn from_response(resp: &GenerateContentResponse, capture_text: bool) -> Self {
        let mut facts = Self::default();
        facts.absorb(resp, capture_text);
        facts
    }

    /// Fold one response or stream chunk in. Later usage and finish
    /// reasons replace earlier ones; text is appended.
    fn absorb(&mut self, resp: &GenerateContentResponse, capture_text: bool) {
        if let Some(usage) = resp.usage_metadata {
            self.usage = Some(usage);
        }
        if let Some(reason) = extract_finish_reason(Some(resp)) {
            self.finish_reason = Some(reason.as_str().to_string());
        }
        if capture_text {
            self.text.push_str(&resp.text());
        }
    }

    fn view(&self) -> ResponseView<'_> {
        ResponseView::Summary {
            usage: self.usage.as_ref(),
            finish_reason: self.finish_reason.as_deref(),
            text: &self.text,
        }
    }
}

enum ChatOutcome {
    Complete(ResponseFacts),
    Streamed { state: StreamState, end: StreamEnd },
    Failed(String),
}

#[derive(Debug, Default)]
struct StreamState {
    facts: ResponseFacts,
    chunks: usize,
    first_chunk_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamEnd {
    Exhausted,
    Errored(String),
    Cancelled,
    Dropped,
}

impl StreamEnd {
    fn default_stop(&self) -> StopReason {
        match self {
            StreamEnd::Exhausted | StreamEnd::Dropped => StopReason::End,
            StreamEnd::Errored(_) => StopReason::Error,
            StreamEnd::Cancelled => StopReason::Cancelled,
        }
    }

    fn error(&self) -> Option<&str> {
        match self {
            StreamEnd::Errored(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Clone)]
struct ChatMeter {
    dispatcher: MeteringDispatcher,
    provider: Provider,
    capture_prompts: bool,
}

impl ChatMeter {
    fn dispatch(
        &self,
        request: ChatRequest,
        outcome: ChatOutcome,
        timing: Timing,
        is_streamed: bool,
        metadata: Arc<UsageMetadata>,
    ) {
        let provider = self.provider;
        let capture_prompts = self.capture_prompts;
        self.dispatcher.dispatch(CallKind::Chat, move || {
            let (view, default_stop, error) = match &outcome {
                ChatOutcome::Complete(facts) => (facts.view(), StopReason::End, None),
                ChatOutcome::Streamed { state, end } => {
                    (state.facts.view(), end.default_stop(), end.error())
                }
                ChatOutcome::Failed(e) => (ResponseView::Absent, StopReason::Error, Some(e.as_str())),
            };
            let record = extract_usage(&request, view, default_stop, capture_prompts);
            tracing::debug!(
                model = %request.model,
                stop_reason = %record.stop_reason,
                total_tokens = record.tokens.total,
                is_streamed,
                "building chat metering payload"
            );
            let ctx = PayloadContext {
                model: &request.model,
                provider,
                timing,
                metadata: &metadata,
            };
            build_chat_payload(&ctx, &record, is_streamed, error)
        });
    }
}

/// Accumulates stream state and dispatches metering exactly once.
struct StreamFinalizer {
    meter: ChatMeter,
    /// Taken on the first finish; `None` afterwards.
    request: Option<ChatRequest>,
    metadata: Arc<UsageMetadata>,
    request_time: DateTime<Utc>,
    state: StreamState,
    capture_text: bool,
}

impl StreamFinalizer {
    fn observe(&mut self, chunk: &GenerateContentResponse) {
        if self.state.first_chunk_at.is_none() {
            self.state.first_chunk_at = Some(Utc::now());
        }
        self.state.chunks += 1;
        self.state.facts.absorb(chunk, self.capture_text);
    }

    fn finish(&mut self, end: StreamEnd) {
        let Some(request) = self.request.take() else {
            return;
        };
        let response_time = Utc::now();
        let completion_start = self.state.first_chunk_at.unwrap_or(response_time);
        let timing = Timing::new(self.request_time, completion_start, response_time);
        let state = std::mem::take(&mut self.state);
        tracing::debug!(
            model = %request.model,
            chunks = state.chunks,
            end = ?end,
            "stream finished"
        );
        self.meter.dispatch(
            request,
            ChatOutcome::Streamed { state, end },
            timing,
            true,
            Arc::clone(&self.metadata),
        );
    }
}

impl Drop for StreamFinalizer {
    fn drop(&mut self) {
        self.finish(StreamEnd::Dropped);
    }
}

type SharedFinalizer = Arc<Mutex<StreamFinalizer>>;

fn lock(finalizer: &Mutex<StreamFinalizer>) -> MutexGuard<'_, StreamFinalizer> {
    finalizer.lock().unwrap_or_else(PoisonError::into_inner)
}

fn observe(finalizer: &SharedFinalizer, chunk: &GenerateContentResponse) {
    lock(finalizer).observe(chunk);
}

fn finish(finalizer: &SharedFinalizer, end: StreamEnd) {
    lock(finalizer).finish(end);
}

/// Finish the stream as cancelled as soon as `token` fires, even if the
/// caller holds the stream without polling it. The watcher exits when the
/// returned guard is dropped.
fn watch_cancellation(
    token: CancellationToken,
    finalizer: Weak<Mutex<StreamFinalizer>>,
) -> Option<DropGuard> {
    let handle = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
            tracing::debug!("no tokio runtime, stream cancellation is observed on poll only");
            return None;
        }
    };
    let stream_gone = CancellationToken::new();
    let watcher_stop = stream_gone.clone();
    handle.spawn(async move {
        tokio::select! {
            biased;
            _ = watcher_stop.cancelled() => {}
            _ = token.cancelled() => {
                if let Some(finalizer) = finalizer.upgrade() {
                    tracing::debug!("stream cancelled by caller");
                    finish(&finalizer, StreamEnd::Cancelled);
                }
            }
        }
    });
    Some(stream_gone.drop_guard())
}

enum Step {
    Item(Option<std::result::Result<GenerateContentResponse, GenAiError>>),
    Cancelled,
}

/// A streaming generation with metering attached.
pub struct MeteredStream {
    inner: BoxStream<'static, std::result::Result<GenerateContentResponse, GenAiError>>,
    _cancel_watch: Option<DropGuard>,
}

impl MeteredStream {
    fn new(
        mut upstream: crate::genai::ContentStream,
        finalizer: StreamFinalizer,
        cancellation: Option<CancellationToken>,
    ) -> Self {
        let finalizer: SharedFinalizer = Arc::new(Mutex::new(finalizer));
        let cancel_watch = cancellation
            .clone()
            .and_then(|token| watch_cancellation(token, Arc::downgrade(&finalizer)));

        let inner = async_stream::stream! {
            loop {
                let step = match &cancellation {
                    Some(token) => tokio::select! {
                        biased;
                        _ = token.cancelled() => Step::Cancelled,
                        item = upstream.next() => Step::Item(item),
                    },
                    None => Step::Item(upstream.next().await),
                };
                match step {
                    Step::Cancelled => {
                        finish(&finalizer, StreamEnd::Cancelled);
                        break;
                    }
                    Step::Item(None) => {
                        finish(&finalizer, StreamEnd::Exhausted);
                        break;
                    }
                    Step::Item(Some(Ok(chunk))) => {
                        observe(&finalizer, &chunk);
                        yield Ok(chunk);
                    }
                    Step::Item(Some(Err(e))) => {
                        finish(&finalizer, StreamEnd::Errored(e.to_string()));
                        yield Err(e);
                        break;
                    }
                }
            }
        };
        Self {
            inner: inner.boxed(),
            _cancel_watch: cancel_watch,
        }
    }
}

impl Stream for MeteredStream {
    type Item = std::result::Result<GenerateContentResponse, GenAiError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConfigBuilder {
        Config::builder().revenium_api_key("hak_test_key")
    }

    struct NoopBackend;

    #[async_trait::async_trait]
    impl GenAiBackend for NoopBackend {
        async fn generate_content(
            &self,
            _model: &str,
            _contents: &[Content],
            _config: Option<&GenerateContentConfig>,
        ) -> std::result::Result<GenerateContentResponse, GenAiError> {
            Ok(GenerateContentResponse::default())
        }

        async fn generate_content_stream(
            &self,
            _model: &str,
            _contents: &[Content],
            _config: Option<&GenerateContentConfig>,
        ) -> std::result::Result<crate::genai::ContentStream, GenAiError> {
            Ok(futures::stream::empty().boxed())
        }
    }

    fn connect_noop(
        _settings: &BackendSettings,
    ) -> std::result::Result<Arc<dyn GenAiBackend>, GenAiError> {
        Ok(Arc::new(NoopBackend))
    }

    #[test]
    fn gemini_requires_google_api_key() {
        let err = ReveniumGoogle::new(config().build().unwrap(), &connect_noop).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("GOOGLE_API_KEY"));
    }

    #[test]
    fn vertex_requires_location() {
        let cfg = config().project_id("proj").build().unwrap();
        let err = ReveniumGoogle::new(cfg, &connect_noop).unwrap_err();
        assert!(err.to_string().contains("GOOGLE_CLOUD_LOCATION"));
    }

    #[test]
    fn connector_failure_is_provider_error() {
        let cfg = config().google_api_key("AIza-test").build().unwrap();
        let failing = |_: &BackendSettings| -> std::result::Result<Arc<dyn GenAiBackend>, GenAiError> {
            Err(GenAiError::new("credentials rejected"))
        };
        let err = ReveniumGoogle::new(cfg, &failing).unwrap_err();
        assert!(matches!(err, Error::Provider { .. }));
    }

    #[test]
    fn connector_receives_vertex_settings() {
        let cfg = config()
            .project_id("proj")
            .location("us-central1")
            .google_api_key("AIza-test")
            .build()
            .unwrap();
        let seen = std::sync::Mutex::new(None);
        let recording = |settings: &BackendSettings| -> std::result::Result<Arc<dyn GenAiBackend>, GenAiError> {
            *seen.lock().unwrap() = Some(settings.clone());
            Ok(Arc::new(NoopBackend))
        };
        let client = ReveniumGoogle::new(cfg, &recording).unwrap();
        assert_eq!(client.provider(), Provider::VertexAi);
        assert_eq!(
            seen.lock().unwrap().clone(),
            Some(BackendSettings::VertexAi {
                project: "proj".into(),
                location: "us-central1".into()
            })
        );
    }

    #[test]
    fn vertex_disable_forces_gemini() {
        let cfg = config()
            .project_id("proj")
            .vertex_disabled(true)
            .google_api_key("AIza-test")
            .build()
            .unwrap();
        let client = ReveniumGoogle::new(cfg, &connect_noop).unwrap();
        assert_eq!(client.provider(), Provider::GoogleAi);
    }

    #[test]
    fn stream_end_defaults() {
        assert_eq!(StreamEnd::Exhausted.default_stop(), StopReason::End);
        assert_eq!(StreamEnd::Dropped.default_stop(), StopReason::End);
        assert_eq!(StreamEnd::Cancelled.default_stop(), StopReason::Cancelled);
        let errored = StreamEnd::Errored("boom".into());
        assert_eq!(errored.default_stop(), StopReason::Error);
        assert_eq!(errored.error(), Some("boom"));
    }

    fn chunk(text: &str, finish: Option<&str>, total: i32) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![crate::genai::Candidate {
                content: Some(Content::model_text(text)),
                finish_reason: finish.map(Into::into),
                index: Some(0),
            }],
            usage_metadata: Some(TokenUsage {
                total_token_count: total,
                ..Default::default()
            }),
            model_version: None,
        }
    }

    #[test]
    fn response_facts_keep_text_only_when_capturing() {
        let resp = chunk("hello", Some("STOP"), 12);
        let facts = ResponseFacts::from_response(&resp, false);
        assert_eq!(facts.usage.map(|u| u.total_token_count), Some(12));
        assert_eq!(facts.finish_reason.as_deref(), Some("STOP"));
        assert!(facts.text.is_empty());

        let facts = ResponseFacts::from_response(&resp, true);
        assert_eq!(facts.text, "hello");
    }

    #[test]
    fn response_facts_fold_chunks() {
        let mut facts = ResponseFacts::default();
        facts.absorb(&chunk("a", None, 3), true);
        facts.absorb(&chunk("b", Some("MAX_TOKENS"), 7), true);
        assert_eq!(facts.text, "ab");
        assert_eq!(facts.usage.map(|u| u.total_token_count), Some(7));
        assert_eq!(facts.finish_reason.as_deref(), Some("MAX_TOKENS"));
    }

    #[tokio::test]
    async fn close_flushes_and_marks_closed() {
        let cfg = config().google_api_key("AIza-test").build().unwrap();
        let client = ReveniumGoogle::new(cfg, &connect_noop).unwrap();
        assert!(!client.is_closed());
        client.close().await;
        assert!(client.is_closed());
        assert_eq!(client.stats().dispatched, 0);
    }
}

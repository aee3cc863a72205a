//! Call-scoped business metadata.
//!
//! A [`CallContext`] is built by the caller before invoking a wrapped SDK
//! method and is read once by the background metering task. It is immutable
//! after construction; cloning shares the same metadata.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

/// Free-form metadata attached to a call.
///
/// Any key may be set here, but only the allow-listed keys in
/// [`crate::payload::METADATA_ALLOW_LIST`] reach the metering payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UsageMetadata(Map<String, Value>);

impl UsageMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn organization_id(self, id: impl Into<String>) -> Self {
        self.with("organizationId", id.into())
    }

    pub fn product_id(self, id: impl Into<String>) -> Self {
        self.with("productId", id.into())
    }

    pub fn subscription_id(self, id: impl Into<String>) -> Self {
        self.with("subscriptionId", id.into())
    }

    pub fn task_type(self, task_type: impl Into<String>) -> Self {
        self.with("taskType", task_type.into())
    }

    pub fn agent(self, agent: impl Into<String>) -> Self {
        self.with("agent", agent.into())
    }

    pub fn trace_id(self, trace_id: impl Into<String>) -> Self {
        self.with("traceId", trace_id.into())
    }

    /// Subscriber object, e.g. `{"id": ..., "email": ..., "credential": {...}}`.
    pub fn subscriber(self, subscriber: Value) -> Self {
        self.with("subscriber", subscriber)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl From<Map<String, Value>> for UsageMetadata {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for UsageMetadata {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Per-call scope: metadata plus an optional cancellation signal.
///
/// Cancelling the token stops a metered stream from forwarding further
/// chunks; metering for what was already received is still dispatched and
/// delivered independently of the token.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    metadata: Arc<UsageMetadata>,
    cancellation: Option<CancellationToken>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_usage_metadata(mut self, metadata: UsageMetadata) -> Self {
        self.metadata = Arc::new(metadata);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn usage_metadata(&self) -> &UsageMetadata {
        &self.metadata
    }

    pub(crate) fn shared_metadata(&self) -> Arc<UsageMetadata> {
        Arc::clone(&self.metadata)
    }

    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_builders() {
        let metadata = UsageMetadata::new()
            .organization_id("org-acme")
            .task_type("support")
            .with("responseQualityScore", 95.5)
            .subscriber(json!({"id": "user-1", "email": "u@example.com"}));

        assert_eq!(metadata.len(), 4);
        assert_eq!(metadata.get("organizationId"), Some(&json!("org-acme")));
        assert_eq!(metadata.get("responseQualityScore"), Some(&json!(95.5)));
        assert_eq!(metadata.get("subscriber").unwrap()["id"], "user-1");
    }

    #[test]
    fn empty_context_reads_empty_metadata() {
        let ctx = CallContext::new();
        assert!(ctx.usage_metadata().is_empty());
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn clones_share_metadata_and_token() {
        let token = CancellationToken::new();
        let ctx = CallContext::new()
            .with_usage_metadata([("traceId", "t-1")].into_iter().collect())
            .with_cancellation(token.clone());
        let copy = ctx.clone();
        token.cancel();
        assert!(copy.is_cancelled());
        assert!(Arc::ptr_eq(&ctx.shared_metadata(), &copy.shared_metadata()));
    }
}

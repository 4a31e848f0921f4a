//! Request/user trace context propagated through a call chain.
//!
//! The active context lives in a tokio task-local. Scopes restore the outer
//! context when they end, including on panic. Spawned branches receive a copy
//! of the parent's context at spawn time; nothing a branch does is visible to
//! its parent or siblings.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use tokio::task::JoinHandle;
use uuid::Uuid;

tokio::task_local! {
    static CURRENT_TRACE: TraceContext;
}

/// Header carrying the request id on upstream calls.
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Header carrying the user id on upstream calls.
pub const USER_ID_HEADER: &str = "X-User-ID";

/// Correlation identifiers for one logical call chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    /// The request ID.
    pub request_id: String,
    /// The user ID, once authentication has resolved it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl TraceContext {
    /// Creates a context for the given request id.
    #[must_use]
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            user_id: None,
        }
    }

    /// Creates a context with a freshly generated request id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    /// Sets the user ID.
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Returns the context active for the current task, if any.
    #[must_use]
    pub fn current() -> Option<Self> {
        CURRENT_TRACE.try_with(Clone::clone).ok()
    }

    /// Returns the active request id, if any.
    #[must_use]
    pub fn current_request_id() -> Option<String> {
        CURRENT_TRACE.try_with(|t| t.request_id.clone()).ok()
    }

    /// Returns the active user id, if any.
    #[must_use]
    pub fn current_user_id() -> Option<String> {
        CURRENT_TRACE.try_with(|t| t.user_id.clone()).ok().flatten()
    }

    /// Runs `fut` with this context active.
    pub async fn scope<F>(self, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_TRACE.scope(self, fut).await
    }

    /// Runs a synchronous closure with this context active.
    pub fn sync_scope<R>(self, f: impl FnOnce() -> R) -> R {
        CURRENT_TRACE.sync_scope(self, f)
    }

    /// Headers to attach to upstream requests.
    #[must_use]
    pub fn headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert(REQUEST_ID_HEADER.to_string(), self.request_id.clone());
        if let Some(ref user_id) = self.user_id {
            headers.insert(USER_ID_HEADER.to_string(), user_id.clone());
        }
        headers
    }

    /// Converts to a dictionary with string values (or null).
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("request_id".to_string(), serde_json::json!(self.request_id));
        map.insert(
            "user_id".to_string(),
            self.user_id
                .as_ref()
                .map_or(serde_json::Value::Null, |id| serde_json::json!(id)),
        );
        map
    }
}

/// Runs `body` with a context built from `request_id` and `user_id` active.
pub async fn with_context<F>(
    request_id: impl Into<String>,
    user_id: Option<String>,
    body: F,
) -> F::Output
where
    F: Future,
{
    let ctx = TraceContext {
        request_id: request_id.into(),
        user_id,
    };
    ctx.scope(body).await
}

/// Spawns a task that inherits a copy of the current trace context.
pub fn spawn_traced<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match TraceContext::current() {
        Some(ctx) => tokio::spawn(ctx.scope(fut)),
        None => tokio::spawn(fut),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_context_outside_scope() {
        assert!(TraceContext::current().is_none());
        assert!(TraceContext::current_request_id().is_none());
    }

    #[tokio::test]
    async fn test_scope_activates_and_restores() {
        let outer = TraceContext::new("req-outer");
        outer
            .scope(async {
                assert_eq!(TraceContext::current_request_id().as_deref(), Some("req-outer"));

                with_context("req-inner", Some("u-1".to_string()), async {
                    assert_eq!(TraceContext::current_request_id().as_deref(), Some("req-inner"));
                    assert_eq!(TraceContext::current_user_id().as_deref(), Some("u-1"));
                })
                .await;

                assert_eq!(TraceContext::current_request_id().as_deref(), Some("req-outer"));
                assert!(TraceContext::current_user_id().is_none());
            })
            .await;

        assert!(TraceContext::current().is_none());
    }

    #[test]
    fn test_restored_after_panic() {
        let result = std::panic::catch_unwind(|| {
            TraceContext::new("req-panic").sync_scope(|| panic!("boom"));
        });
        assert!(result.is_err());
        assert!(TraceContext::current().is_none());
    }

    #[test]
    fn test_headers() {
        let ctx = TraceContext::new("req-1").with_user_id("user-9");
        let headers = ctx.headers();
        assert_eq!(headers.get(REQUEST_ID_HEADER), Some(&"req-1".to_string()));
        assert_eq!(headers.get(USER_ID_HEADER), Some(&"user-9".to_string()));

        let anonymous = TraceContext::new("req-2").headers();
        assert!(!anonymous.contains_key(USER_ID_HEADER));
    }

    #[test]
    fn test_generate_is_unique() {
        assert_ne!(TraceContext::generate().request_id, TraceContext::generate().request_id);
    }

    #[test]
    fn test_to_dict() {
        let dict = TraceContext::new("req-1").to_dict();
        assert_eq!(dict["request_id"], "req-1");
        assert!(dict["user_id"].is_null());
    }
}

//! Before/after request observers
//!
//! Hooks are dispatched synchronously, in insertion order, on the calling
//! task. A hook that panics is not contained; observers are expected to be
//! well-behaved.

use crate::context::RequestContext;
use crate::errors::Error;
use crate::mirror::{HttpRequestMirror, ResponseRaw};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::sync::Arc;

/// Snapshot of one call handed to observers
///
/// The before-request snapshot never carries a response; the after-request
/// snapshot carries the call's final error.
#[derive(Debug, Clone, Serialize)]
pub struct HookData<'a> {
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<&'a Error>,
    pub url: &'a str,
    pub curl: &'a str,
    pub start_time: DateTime<Utc>,
    pub request: &'a HttpRequestMirror,
    pub response: Option<&'a ResponseRaw>,
    pub correlation_id: &'a str,
    /// Set when closing the response body failed; never replaces `error`
    pub body_close_error: Option<&'a str>,
}

fn serialize_error<S: Serializer>(
    error: &Option<&Error>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.collect_str(e),
        None => serializer.serialize_none(),
    }
}

/// Observer notified before and after every call
pub trait Hook: Send + Sync {
    fn before_request(&self, ctx: &RequestContext, data: &HookData<'_>);

    fn after_request(&self, ctx: &RequestContext, data: &HookData<'_>);
}

/// Hook that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHook;

impl Hook for NoopHook {
    fn before_request(&self, _ctx: &RequestContext, _data: &HookData<'_>) {}

    fn after_request(&self, _ctx: &RequestContext, _data: &HookData<'_>) {}
}

/// Hook that logs each snapshot as JSON at debug level
#[derive(Debug, Clone)]
pub struct TracingHook {
    tag: String,
}

impl TracingHook {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }

    fn log(&self, phase: &'static str, data: &HookData<'_>) {
        match serde_json::to_string(data) {
            Ok(json) => tracing::debug!(
                tag = %self.tag,
                phase,
                correlation_id = data.correlation_id,
                data = %json,
                "http request"
            ),
            Err(e) => {
                tracing::warn!(tag = %self.tag, phase, error = %e, "failed to serialize hook data")
            }
        }
    }
}

impl Default for TracingHook {
    fn default() -> Self {
        Self::new("rest")
    }
}

impl Hook for TracingHook {
    fn before_request(&self, _ctx: &RequestContext, data: &HookData<'_>) {
        self.log("before", data);
    }

    fn after_request(&self, _ctx: &RequestContext, data: &HookData<'_>) {
        self.log("after", data);
    }
}

/// Ordered list of observers; absent slots are skipped
#[derive(Clone, Default)]
pub struct HookDispatcher {
    hooks: Vec<Option<Arc<dyn Hook>>>,
}

impl HookDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_slots<I>(slots: I) -> Self
    where
        I: IntoIterator<Item = Option<Arc<dyn Hook>>>,
    {
        Self {
            hooks: slots.into_iter().collect(),
        }
    }

    pub fn push(&mut self, hook: Arc<dyn Hook>) {
        self.hooks.push(Some(hook));
    }

    pub fn push_slot(&mut self, hook: Option<Arc<dyn Hook>>) {
        self.hooks.push(hook);
    }

    /// Number of configured hooks, absent slots excluded
    pub fn len(&self) -> usize {
        self.hooks.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn before(&self, ctx: &RequestContext, data: &HookData<'_>) {
        for hook in self.hooks.iter().flatten() {
            hook.before_request(ctx, data);
        }
    }

    pub fn after(&self, ctx: &RequestContext, data: &HookData<'_>) {
        for hook in self.hooks.iter().flatten() {
            hook.after_request(ctx, data);
        }
    }
}

impl std::fmt::Debug for HookDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookDispatcher")
            .field("hooks", &self.len())
            .field("slots", &self.hooks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        name: &'static str,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Hook for Recorder {
        fn before_request(&self, _ctx: &RequestContext, data: &HookData<'_>) {
            self.events
                .lock()
                .push(format!("{}:before:{}", self.name, data.correlation_id));
        }

        fn after_request(&self, _ctx: &RequestContext, data: &HookData<'_>) {
            self.events
                .lock()
                .push(format!("{}:after:{}", self.name, data.error.is_some()));
        }
    }

    fn data<'a>(request: &'a HttpRequestMirror, error: Option<&'a Error>) -> HookData<'a> {
        HookData {
            error,
            url: "http://localhost/orders",
            curl: "",
            start_time: Utc::now(),
            request,
            response: None,
            correlation_id: "corr-1",
            body_close_error: None,
        }
    }

    #[test]
    fn test_dispatch_in_insertion_order_skipping_absent() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let first: Arc<dyn Hook> = Arc::new(Recorder {
            name: "first",
            events: events.clone(),
        });
        let second: Arc<dyn Hook> = Arc::new(Recorder {
            name: "second",
            events: events.clone(),
        });

        let dispatcher = HookDispatcher::from_slots([Some(first), None, Some(second)]);
        assert_eq!(dispatcher.len(), 2);

        let request = HttpRequestMirror::default();
        let ctx = RequestContext::new();
        dispatcher.before(&ctx, &data(&request, None));
        dispatcher.after(&ctx, &data(&request, Some(&Error::Timeout)));

        assert_eq!(
            *events.lock(),
            vec![
                "first:before:corr-1",
                "second:before:corr-1",
                "first:after:true",
                "second:after:true",
            ]
        );
    }

    #[test]
    fn test_empty_dispatcher_is_noop() {
        let dispatcher = HookDispatcher::new();
        let request = HttpRequestMirror::default();

        assert!(dispatcher.is_empty());
        dispatcher.before(&RequestContext::new(), &data(&request, None));
    }

    #[test]
    fn test_hook_data_serializes_error_as_message() {
        let request = HttpRequestMirror::default();
        let json = serde_json::to_value(data(&request, Some(&Error::Timeout))).unwrap();

        assert_eq!(
            json["error"],
            "Client.Timeout exceeded while awaiting headers"
        );
        assert_eq!(json["correlation_id"], "corr-1");
        assert!(json["response"].is_null());
    }

    #[test]
    fn test_builtin_hooks_accept_data() {
        let request = HttpRequestMirror::default();
        let ctx = RequestContext::new();
        let mut dispatcher = HookDispatcher::new();
        dispatcher.push(Arc::new(NoopHook));
        dispatcher.push(Arc::new(TracingHook::default()));
        dispatcher.push_slot(None);

        dispatcher.before(&ctx, &data(&request, None));
        dispatcher.after(&ctx, &data(&request, Some(&Error::NilResponse)));
        assert_eq!(dispatcher.len(), 2);
    }
}

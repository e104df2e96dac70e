use std::cell::{Cell, RefCell};

use super::span::{Span, SpanKind, SpanStatus, TraceId};
use super::TraceError;
use crate::export::SpanSink;
use tracewire_proto::types::AttrValue;

/// Snapshot of the active position in a trace, for correlating
/// application logs with exported spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSnapshot {
    pub trace_id: TraceId,
    pub span_id: Option<u64>,
}

/// Active-span stack for one logical request.
///
/// A context is created per request and threaded explicitly through the
/// call chain; there is no ambient process-global current span. The
/// type is deliberately not `Sync` (interior `RefCell`), so one context
/// can never be mutated from two execution contexts and spans of
/// different requests cannot corrupt each other.
///
/// Spans are pushed and popped in strict LIFO order matching call
/// nesting. Closed spans are handed to the exporter sink at pop time;
/// the context retains nothing about finished spans.
#[derive(Debug)]
pub struct TraceContext {
    trace_id: TraceId,
    remote_parent: Option<u64>,
    stack: RefCell<Vec<Span>>,
    sink: SpanSink,
    pushes: Cell<u64>,
    pops: Cell<u64>,
}

impl TraceContext {
    /// A context starting a fresh trace.
    pub fn new(sink: SpanSink) -> Self {
        TraceContext {
            trace_id: TraceId::generate(),
            remote_parent: None,
            stack: RefCell::new(Vec::new()),
            sink,
            pushes: Cell::new(0),
            pops: Cell::new(0),
        }
    }

    /// A context joining a trace propagated by an upstream service.
    /// The first span entered here parents onto `parent_span_id`.
    pub fn with_remote_parent(sink: SpanSink, trace_id: TraceId, parent_span_id: u64) -> Self {
        TraceContext {
            trace_id,
            remote_parent: Some(parent_span_id),
            stack: RefCell::new(Vec::new()),
            sink,
            pushes: Cell::new(0),
            pops: Cell::new(0),
        }
    }

    /// Start a span as a child of the current span (or of the remote
    /// parent when the stack is empty) and push it as the new current.
    ///
    /// The returned guard completes the span: explicitly through
    /// [`SpanGuard::exit_ok`] / [`SpanGuard::exit_err`], or implicitly
    /// on drop, including drops during a panic unwind. Every `enter` is
    /// therefore matched by exactly one pop, whatever path the traced
    /// call takes out.
    pub fn enter<N: Into<String>>(&self, name: N, kind: SpanKind) -> SpanGuard<'_> {
        let parent = self
            .stack
            .borrow()
            .last()
            .map(|span| span.span_id)
            .or(self.remote_parent);
        let span = Span::new_in_trace(self.trace_id, parent, name, kind);
        let span_id = span.span_id;
        self.stack.borrow_mut().push(span);
        self.pushes.set(self.pushes.get() + 1);
        SpanGuard {
            ctx: self,
            span_id,
            completed: false,
        }
    }

    /// Set an attribute on the currently active span.
    ///
    /// With no active span the attribute is logged and discarded;
    /// nothing propagates to the caller.
    pub fn set_attr<K: Into<String>, V: Into<AttrValue>>(&self, key: K, value: V) {
        let mut stack = self.stack.borrow_mut();
        match stack.last_mut() {
            Some(span) => {
                if let Err(e) = span.set_attr(key, value) {
                    log::debug!("attribute dropped: {e}");
                }
            }
            None => log::debug!("attribute dropped: no active span"),
        }
    }

    /// Run `f` against the currently active span, if any. Used by the
    /// instrumentation layer to apply decorators at span start.
    pub fn with_current<F: FnOnce(&mut Span)>(&self, f: F) {
        let mut stack = self.stack.borrow_mut();
        match stack.last_mut() {
            Some(span) => f(span),
            None => log::debug!("no active span to decorate"),
        }
    }

    /// The trace id every span of this context shares.
    pub fn current_trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// The id of the currently active span, or `None` outside any
    /// traced call.
    pub fn current_span_id(&self) -> Option<u64> {
        self.stack.borrow().last().map(|span| span.span_id)
    }

    pub fn current(&self) -> ContextSnapshot {
        ContextSnapshot {
            trace_id: self.trace_id,
            span_id: self.current_span_id(),
        }
    }

    /// Current nesting depth.
    pub fn depth(&self) -> usize {
        self.stack.borrow().len()
    }

    pub fn pushes(&self) -> u64 {
        self.pushes.get()
    }

    pub fn pops(&self) -> u64 {
        self.pops.get()
    }

    fn finish(&self, span_id: u64, status: SpanStatus, message: Option<&str>) {
        loop {
            let popped = self.stack.borrow_mut().pop();
            let Some(mut span) = popped else {
                log::warn!("span {span_id} finished but was no longer on the stack");
                return;
            };
            self.pops.set(self.pops.get() + 1);

            let matched = span.span_id == span_id;
            let close: Result<(), TraceError> = if matched {
                match status {
                    SpanStatus::Ok => span.end_ok(),
                    SpanStatus::Error => span.end_error(message),
                }
            } else {
                // A guard further out finished first; close the inner
                // span rather than leak it on the stack.
                log::warn!(
                    "out-of-order completion: closing span {} while finishing {span_id}",
                    span.span_id
                );
                span.end_error(Some("closed by out-of-order completion"))
            };
            if let Err(e) = close {
                log::debug!("closing span {}: {e}", span.span_id);
            }
            self.sink.offer(span.into_record());

            if matched {
                return;
            }
        }
    }
}

/// RAII completion for one entered span.
pub struct SpanGuard<'a> {
    ctx: &'a TraceContext,
    span_id: u64,
    completed: bool,
}

impl SpanGuard<'_> {
    pub fn span_id(&self) -> u64 {
        self.span_id
    }

    /// Pop and close the span with ok status.
    pub fn exit_ok(mut self) {
        self.completed = true;
        self.ctx.finish(self.span_id, SpanStatus::Ok, None);
    }

    /// Pop and close the span with error status, recording the message
    /// as the `error.message` attribute.
    pub fn exit_err(mut self, message: &str) {
        self.completed = true;
        self.ctx.finish(self.span_id, SpanStatus::Error, Some(message));
    }
}

impl Drop for SpanGuard<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if std::thread::panicking() {
            self.ctx
                .finish(self.span_id, SpanStatus::Error, Some("panic during traced call"));
        } else {
            self.ctx.finish(self.span_id, SpanStatus::Ok, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    fn context() -> (TraceContext, SpanSink) {
        let sink = SpanSink::detached(64);
        (TraceContext::new(sink.clone()), sink)
    }

    #[test]
    fn test_nested_spans_share_trace_and_parent() {
        let (ctx, sink) = context();

        let outer = ctx.enter("handle_request", SpanKind::Function);
        let outer_id = outer.span_id();
        for _ in 0..3 {
            let inner = ctx.enter("db.query", SpanKind::Database);
            assert_eq!(ctx.depth(), 2);
            inner.exit_ok();
        }
        outer.exit_ok();

        assert_eq!(ctx.depth(), 0);
        assert_eq!(ctx.pushes(), 4);
        assert_eq!(ctx.pops(), 4, "every push is matched by a pop");

        let records = sink.drain_pending();
        assert_eq!(records.len(), 4);
        let trace_id = ctx.current_trace_id().to_hex();
        assert!(
            records.iter().all(|r| r.trace_id == trace_id),
            "all spans share one trace id"
        );

        let children: Vec<_> = records.iter().filter(|r| r.name == "db.query").collect();
        assert_eq!(children.len(), 3);
        assert!(
            children.iter().all(|r| r.parent_span_id == Some(outer_id)),
            "each child's parent is the outer span"
        );

        let root = records.iter().find(|r| r.name == "handle_request").unwrap();
        assert_eq!(root.parent_span_id, None, "root span has no parent");
        assert_eq!(
            records.last().unwrap().span_id,
            root.span_id,
            "outer span closes last"
        );
    }

    #[test]
    fn test_panic_still_pops_and_marks_error() {
        let (ctx, sink) = context();

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _outer = ctx.enter("outer", SpanKind::Function);
            let _inner = ctx.enter("inner", SpanKind::Function);
            panic!("traced call blew up");
        }));
        assert!(result.is_err());

        assert_eq!(ctx.depth(), 0, "unwind must not leak stack entries");
        assert_eq!(ctx.pushes(), ctx.pops());

        let records = sink.drain_pending();
        assert_eq!(records.len(), 2);
        assert!(
            records
                .iter()
                .all(|r| r.status == SpanStatus::Error),
            "spans closed during unwind carry error status"
        );
    }

    #[test]
    fn test_exit_err_records_message() {
        let (ctx, sink) = context();

        let guard = ctx.enter("db.query", SpanKind::Database);
        guard.exit_err("connection refused");

        let records = sink.drain_pending();
        assert_eq!(records[0].status, SpanStatus::Error);
        assert_eq!(
            records[0].attributes.get("error.message"),
            Some(&AttrValue::Text("connection refused".to_string()))
        );
    }

    #[test]
    fn test_remote_parent_adoption() {
        let sink = SpanSink::detached(8);
        let trace_id = TraceId::generate();
        let ctx = TraceContext::with_remote_parent(sink.clone(), trace_id, 9999);

        assert_eq!(ctx.current_trace_id(), trace_id);
        let guard = ctx.enter("handle_request", SpanKind::Function);
        guard.exit_ok();

        let records = sink.drain_pending();
        assert_eq!(records[0].trace_id, trace_id.to_hex());
        assert_eq!(
            records[0].parent_span_id,
            Some(9999),
            "first local span parents onto the remote span id"
        );
    }

    #[test]
    fn test_context_snapshot() {
        let (ctx, _sink) = context();
        assert_eq!(ctx.current_span_id(), None, "no active span initially");

        let guard = ctx.enter("outer", SpanKind::Function);
        let snapshot = ctx.current();
        assert_eq!(snapshot.trace_id, ctx.current_trace_id());
        assert_eq!(snapshot.span_id, Some(guard.span_id()));

        guard.exit_ok();
        assert_eq!(ctx.current().span_id, None);
    }

    #[test]
    fn test_attribute_on_current_span() {
        let (ctx, sink) = context();

        // No active span: dropped quietly.
        ctx.set_attr("http.method", "GET");

        let guard = ctx.enter("handle_request", SpanKind::Function);
        ctx.set_attr("http.method", "GET");
        guard.exit_ok();

        let records = sink.drain_pending();
        assert_eq!(
            records[0].attributes.get("http.method"),
            Some(&AttrValue::Text("GET".to_string()))
        );
    }

    #[test]
    fn test_out_of_order_completion_closes_inner_spans() {
        let (ctx, sink) = context();

        let outer = ctx.enter("outer", SpanKind::Function);
        let inner = ctx.enter("inner", SpanKind::Function);
        let inner_id = inner.span_id();
        std::mem::forget(inner); // simulate a lost guard

        outer.exit_ok();
        assert_eq!(ctx.depth(), 0, "outer completion reclaims the lost entry");

        let records = sink.drain_pending();
        assert_eq!(records.len(), 2);
        let inner_record = records.iter().find(|r| r.span_id == inner_id).unwrap();
        assert_eq!(inner_record.status, SpanStatus::Error);
    }
}

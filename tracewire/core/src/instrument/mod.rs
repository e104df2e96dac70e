//! Instrumentation hooks: wrap designated functions and methods so a
//! call transparently opens and closes a span.
//!
//! Targets are declared up front (by the application or the built-in
//! presets) and resolved once, at initialization, into [`TargetHandle`]
//! values held by the call sites. The traced call path never performs a
//! name lookup. A handle whose target was never enabled forwards the
//! call untouched, so instrumented code runs identically with tracing
//! off.

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Display;
use std::sync::{Arc, RwLock};

use once_cell::sync::OnceCell;
use serde::Deserialize;

use crate::trace::{Span, SpanKind, TraceContext, TraceError};
use tracewire_proto::types::AttrValue;

/// Hook run against a freshly started span, before the traced call
/// body. Decorators may rename the span and attach attributes; they
/// come from code (presets), not from configuration.
pub type SpanDecorator = dyn Fn(&mut Span) + Send + Sync;

/// One external registration entry: enable tracing for a declared
/// target, optionally overriding the span name, kind and static
/// attributes.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TargetSpec {
    /// Declared target name, `"function"` or `"Type::method"` style.
    pub target: String,
    #[serde(default)]
    pub kind: Option<SpanKind>,
    #[serde(default)]
    pub rename: Option<String>,
    #[serde(default)]
    pub attrs: BTreeMap<String, AttrValue>,
}

impl TargetSpec {
    pub fn named<N: Into<String>>(target: N) -> Self {
        TargetSpec {
            target: target.into(),
            kind: None,
            rename: None,
            attrs: BTreeMap::new(),
        }
    }

    /// Entry for a method target, keyed `"Type::method"`.
    pub fn method(class: &str, method: &str) -> Self {
        Self::named(format!("{class}::{method}")).with_kind(SpanKind::Method)
    }

    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_rename<N: Into<String>>(mut self, name: N) -> Self {
        self.rename = Some(name.into());
        self
    }

    pub fn with_attr<K: Into<String>, V: Into<AttrValue>>(mut self, key: K, value: V) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }
}

/// Resolved per-target tracing parameters, fixed at apply time.
#[derive(Debug)]
struct EnabledSpec {
    span_name: String,
    kind: SpanKind,
    attrs: Vec<(String, AttrValue)>,
}

struct TargetState {
    name: String,
    declared_kind: SpanKind,
    decorator: Option<Arc<SpanDecorator>>,
    enabled: OnceCell<EnabledSpec>,
}

impl fmt::Debug for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetState")
            .field("name", &self.name)
            .field("declared_kind", &self.declared_kind)
            .field("decorated", &self.decorator.is_some())
            .field("enabled", &self.enabled.get().is_some())
            .finish()
    }
}

/// Registry of instrumentable targets.
///
/// `declare` makes a target known; `apply` turns tracing on for it.
/// Both sides are idempotent-safe: re-declaring returns the existing
/// handle, and a second `apply` is rejected with `AlreadyInstrumented`
/// so a call can never be double-traced.
#[derive(Debug, Default)]
pub struct Registry {
    targets: RwLock<BTreeMap<String, Arc<TargetState>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an instrumentable target and get its handle.
    pub fn declare<N: Into<String>>(&self, name: N, kind: SpanKind) -> TargetHandle {
        self.declare_state(name.into(), kind, None)
    }

    /// Declare a target together with a start decorator.
    pub fn declare_with_decorator<N: Into<String>>(
        &self,
        name: N,
        kind: SpanKind,
        decorator: Arc<SpanDecorator>,
    ) -> TargetHandle {
        self.declare_state(name.into(), kind, Some(decorator))
    }

    fn declare_state(
        &self,
        name: String,
        kind: SpanKind,
        decorator: Option<Arc<SpanDecorator>>,
    ) -> TargetHandle {
        let mut targets = self.targets.write().unwrap();
        let state = targets
            .entry(name.clone())
            .or_insert_with(|| {
                Arc::new(TargetState {
                    name,
                    declared_kind: kind,
                    decorator,
                    enabled: OnceCell::new(),
                })
            })
            .clone();
        TargetHandle { state }
    }

    /// Enable tracing for a declared target.
    ///
    /// `TargetNotFound` if the name was never declared;
    /// `AlreadyInstrumented` if tracing is already on for it. Both are
    /// recoverable: callers wiring up configuration log and skip.
    pub fn apply(&self, spec: &TargetSpec) -> Result<(), TraceError> {
        let state = self
            .targets
            .read()
            .unwrap()
            .get(&spec.target)
            .cloned()
            .ok_or_else(|| TraceError::TargetNotFound(spec.target.clone()))?;

        let enabled = EnabledSpec {
            span_name: spec.rename.clone().unwrap_or_else(|| state.name.clone()),
            kind: spec.kind.unwrap_or(state.declared_kind),
            attrs: spec
                .attrs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        state
            .enabled
            .set(enabled)
            .map_err(|_| TraceError::AlreadyInstrumented(spec.target.clone()))
    }

    /// Apply a registration list, logging and skipping entries that
    /// fail. Initialization must not abort over a stale target name.
    /// Returns the number of targets enabled.
    pub fn apply_all(&self, specs: &[TargetSpec]) -> usize {
        let mut applied = 0;
        for spec in specs {
            match self.apply(spec) {
                Ok(()) => {
                    log::info!("tracing enabled for target {}", spec.target);
                    applied += 1;
                }
                Err(e) => log::warn!("skipping target {}: {e}", spec.target),
            }
        }
        applied
    }

    /// Look up the handle for a declared target.
    pub fn handle(&self, name: &str) -> Option<TargetHandle> {
        self.targets
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .map(|state| TargetHandle { state })
    }

    /// Names of all declared targets.
    pub fn names(&self) -> Vec<String> {
        self.targets.read().unwrap().keys().cloned().collect()
    }
}

/// Call-site handle for one instrumentation target. Cheap to clone;
/// resolved once from the [`Registry`] and held for the life of the
/// call site.
#[derive(Debug, Clone)]
pub struct TargetHandle {
    state: Arc<TargetState>,
}

impl TargetHandle {
    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn is_enabled(&self) -> bool {
        self.state.enabled.get().is_some()
    }

    /// Invoke a fallible operation under this target.
    ///
    /// Disabled target: `f` runs untouched. Enabled target: a span is
    /// opened around `f`; `Ok` closes it with ok status, `Err` with
    /// error status and the error text in `error.message`. The result
    /// itself passes through unchanged, value and error type alike, and
    /// a panic inside `f` propagates after the span is closed with
    /// error status.
    pub fn call<T, E, F>(&self, ctx: &TraceContext, f: F) -> Result<T, E>
    where
        E: Display,
        F: FnOnce(&TraceContext) -> Result<T, E>,
    {
        let Some(guard) = self.begin(ctx) else {
            return f(ctx);
        };
        match f(ctx) {
            Ok(value) => {
                guard.exit_ok();
                Ok(value)
            }
            Err(error) => {
                guard.exit_err(&error.to_string());
                Err(error)
            }
        }
    }

    /// Invoke an infallible operation under this target. The return
    /// value passes through unchanged.
    pub fn call_value<T, F>(&self, ctx: &TraceContext, f: F) -> T
    where
        F: FnOnce(&TraceContext) -> T,
    {
        let Some(guard) = self.begin(ctx) else {
            return f(ctx);
        };
        let value = f(ctx);
        guard.exit_ok();
        value
    }

    fn begin<'a>(&self, ctx: &'a TraceContext) -> Option<crate::trace::SpanGuard<'a>> {
        let spec = self.state.enabled.get()?;
        let guard = ctx.enter(spec.span_name.clone(), spec.kind);
        ctx.with_current(|span| {
            for (key, value) in &spec.attrs {
                if let Err(e) = span.set_attr(key.clone(), value.clone()) {
                    log::debug!("static attribute dropped on {}: {e}", spec.span_name);
                }
            }
            if let Some(decorator) = &self.state.decorator {
                decorator(span);
            }
        });
        Some(guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::SpanSink;
    use crate::trace::SpanStatus;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    fn setup() -> (Registry, TraceContext, SpanSink) {
        let sink = SpanSink::detached(64);
        (Registry::new(), TraceContext::new(sink.clone()), sink)
    }

    fn foo(ctx: &TraceContext, handle: &TargetHandle, n: i64) -> i64 {
        handle.call_value(ctx, |_ctx| n)
    }

    #[test]
    fn test_wrapping_preserves_return_value() {
        let (registry, ctx, sink) = setup();
        let handle = registry.declare("foo", SpanKind::Function);

        // Untraced.
        assert_eq!(foo(&ctx, &handle, 5), 5);
        assert_eq!(sink.pending(), 0, "disabled target emits no spans");

        registry.apply(&TargetSpec::named("foo")).unwrap();

        // Traced: same value, one span.
        assert_eq!(foo(&ctx, &handle, 5), 5);
        let records = sink.drain_pending();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "foo");
        assert_eq!(records[0].status, SpanStatus::Ok);
    }

    #[test]
    fn test_wrapping_preserves_errors() {
        let (registry, ctx, sink) = setup();
        let handle = registry.declare("db.query", SpanKind::Database);
        registry.apply(&TargetSpec::named("db.query")).unwrap();

        let result: Result<(), String> =
            handle.call(&ctx, |_ctx| Err("connection refused".to_string()));
        assert_eq!(
            result,
            Err("connection refused".to_string()),
            "the error passes through unchanged"
        );

        let records = sink.drain_pending();
        assert_eq!(records[0].status, SpanStatus::Error);
        assert_eq!(
            records[0].attributes.get("error.message"),
            Some(&AttrValue::Text("connection refused".to_string()))
        );
    }

    #[test]
    fn test_panic_propagates_after_span_closes() {
        let (registry, ctx, sink) = setup();
        let handle = registry.declare("explode", SpanKind::Function);
        registry.apply(&TargetSpec::named("explode")).unwrap();

        let result = catch_unwind(AssertUnwindSafe(|| {
            handle.call_value(&ctx, |_ctx| -> i64 { panic!("boom") })
        }));
        assert!(result.is_err(), "the panic reaches the caller");
        assert_eq!(ctx.depth(), 0);
        assert_eq!(ctx.pushes(), ctx.pops());

        let records = sink.drain_pending();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, SpanStatus::Error);
    }

    #[test]
    fn test_apply_unknown_target() {
        let (registry, _ctx, _sink) = setup();
        let result = registry.apply(&TargetSpec::named("no.such.target"));
        assert!(matches!(result, Err(TraceError::TargetNotFound(_))));
    }

    #[test]
    fn test_apply_all_skips_bad_entries() {
        let (registry, _ctx, _sink) = setup();
        registry.declare("db.query", SpanKind::Database);

        let applied = registry.apply_all(&[
            TargetSpec::named("db.query"),
            TargetSpec::named("no.such.target"),
            TargetSpec::named("db.query"), // duplicate
        ]);
        assert_eq!(applied, 1, "one valid entry applied, the rest skipped");
        assert!(registry.handle("db.query").unwrap().is_enabled());
    }

    #[test]
    fn test_double_apply_never_double_traces() {
        let (registry, ctx, sink) = setup();
        let handle = registry.declare("foo", SpanKind::Function);
        registry.apply(&TargetSpec::named("foo")).unwrap();

        let second = registry.apply(&TargetSpec::named("foo").with_rename("other"));
        assert!(matches!(second, Err(TraceError::AlreadyInstrumented(_))));

        handle.call_value(&ctx, |_ctx| ());
        let records = sink.drain_pending();
        assert_eq!(records.len(), 1, "one call still produces one span");
        assert_eq!(records[0].name, "foo", "the first application stands");
    }

    #[test]
    fn test_rename_kind_and_static_attrs() {
        let (registry, ctx, sink) = setup();
        let handle = registry.declare("Builder::get_models", SpanKind::Method);
        registry
            .apply(
                &TargetSpec::named("Builder::get_models")
                    .with_rename("orm/get")
                    .with_kind(SpanKind::Database)
                    .with_attr("component", "orm"),
            )
            .unwrap();

        handle.call_value(&ctx, |_ctx| ());

        let records = sink.drain_pending();
        assert_eq!(records[0].name, "orm/get");
        assert_eq!(records[0].kind, SpanKind::Database);
        assert_eq!(
            records[0].attributes.get("component"),
            Some(&AttrValue::Text("orm".to_string()))
        );
    }

    #[test]
    fn test_decorator_runs_at_span_start() {
        let (registry, ctx, sink) = setup();
        let handle = registry.declare_with_decorator(
            "render",
            SpanKind::Template,
            Arc::new(|span: &mut Span| {
                span.name = "template/render".to_string();
                let _ = span.set_attr("engine", "compiler");
            }),
        );
        registry.apply(&TargetSpec::named("render")).unwrap();

        handle.call_value(&ctx, |_ctx| ());

        let records = sink.drain_pending();
        assert_eq!(records[0].name, "template/render");
        assert_eq!(
            records[0].attributes.get("engine"),
            Some(&AttrValue::Text("compiler".to_string()))
        );
    }

    #[test]
    fn test_nested_instrumented_calls() {
        let (registry, ctx, sink) = setup();
        let outer = registry.declare("foo", SpanKind::Function);
        let inner = registry.declare("bar", SpanKind::Function);
        registry.apply_all(&[TargetSpec::named("foo"), TargetSpec::named("bar")]);

        let total = outer.call_value(&ctx, |ctx| {
            (0..3).map(|_| inner.call_value(ctx, |_ctx| 1)).sum::<i64>()
        });
        assert_eq!(total, 3);

        let records = sink.drain_pending();
        assert_eq!(records.len(), 4);
        let foo_record = records.iter().find(|r| r.name == "foo").unwrap();
        for bar_record in records.iter().filter(|r| r.name == "bar") {
            assert_eq!(bar_record.parent_span_id, Some(foo_record.span_id));
        }
    }

    #[test]
    fn test_target_spec_deserializes_from_json() {
        let json = r#"{
            "target": "PDO::exec",
            "kind": "database",
            "rename": "db/exec",
            "attrs": {"component": "pdo", "pooled": true}
        }"#;
        let spec: TargetSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.target, "PDO::exec");
        assert_eq!(spec.kind, Some(SpanKind::Database));
        assert_eq!(spec.rename.as_deref(), Some("db/exec"));
        assert_eq!(spec.attrs.get("pooled"), Some(&AttrValue::Bool(true)));

        let minimal: TargetSpec = serde_json::from_str(r#"{"target": "curl_exec"}"#).unwrap();
        assert_eq!(minimal, TargetSpec::named("curl_exec"));
    }

    #[test]
    fn test_method_spec_key() {
        let spec = TargetSpec::method("PDOStatement", "execute");
        assert_eq!(spec.target, "PDOStatement::execute");
        assert_eq!(spec.kind, Some(SpanKind::Method));
    }
}

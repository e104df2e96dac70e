//! Built-in instrumentation presets.
//!
//! A curated table of well-known call sites (database clients, http
//! clients, caches, ORMs, template engines) declared on every agent so
//! deployments can turn them on from configuration alone. Names are
//! flat `component.operation` keys; the configured spec may still
//! rename or re-kind them.

use std::sync::Arc;

use tracewire_core::instrument::Registry;
use tracewire_core::trace::{Span, SpanKind};

/// Preset targets declared without decorators.
pub const BUILTIN_TARGETS: &[(&str, SpanKind)] = &[
    // database clients
    ("db.connect", SpanKind::Database),
    ("db.query", SpanKind::Database),
    ("db.exec", SpanKind::Database),
    ("db.prepare", SpanKind::Database),
    ("db.commit", SpanKind::Database),
    ("db.statement.execute", SpanKind::Database),
    // http clients
    ("http.request", SpanKind::Http),
    ("http.multi.add", SpanKind::Http),
    ("http.multi.remove", SpanKind::Http),
    // caches
    ("cache.get", SpanKind::Cache),
    ("cache.set", SpanKind::Cache),
    ("cache.delete", SpanKind::Cache),
    ("cache.flush", SpanKind::Cache),
    ("cache.replace", SpanKind::Cache),
    ("cache.increment", SpanKind::Cache),
    ("cache.decrement", SpanKind::Cache),
    // ORM write path
    ("orm.insert", SpanKind::Database),
    ("orm.update", SpanKind::Database),
    ("orm.delete", SpanKind::Database),
];

/// Declare every preset on the registry. Called once per agent during
/// initialization; re-declaration is harmless.
pub fn declare_builtin(registry: &Registry) {
    for (name, kind) in BUILTIN_TARGETS {
        registry.declare(*name, *kind);
    }

    // The ORM read path and template rendering carry decorators that
    // normalize the span name the way collectors index them.
    registry.declare_with_decorator(
        "orm.get",
        SpanKind::Database,
        Arc::new(|span: &mut Span| {
            span.name = "orm/get".to_string();
            let _ = span.set_attr("component", "orm");
        }),
    );
    registry.declare_with_decorator(
        "template.render",
        SpanKind::Template,
        Arc::new(|span: &mut Span| {
            span.name = "template/render".to_string();
            let _ = span.set_attr("component", "template");
        }),
    );
}

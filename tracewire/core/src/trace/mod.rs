mod context;
mod span;

pub use context::{ContextSnapshot, SpanGuard, TraceContext};
pub use span::{Span, SpanState, Timestamp, TraceId};

pub use tracewire_proto::dto::span::{SpanKind, SpanStatus};
pub use tracewire_proto::types::AttrValue;

/// Errors raised by tracing operations.
///
/// None of these ever cross the instrumentation boundary into traced
/// application code: callers at that boundary log them once and absorb
/// them.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    /// An operation was attempted on a span that has already been closed.
    #[error("span already closed")]
    AlreadyClosed,

    /// Tracing was applied twice to the same target; the second
    /// application is rejected so a call is never double-traced.
    #[error("target already instrumented: {0}")]
    AlreadyInstrumented(String),

    /// A registration entry names a target that was never declared.
    #[error("instrumentation target not found: {0}")]
    TargetNotFound(String),
}

pub mod config;
pub mod export;
pub mod instrument;
pub mod trace;

pub mod prelude {
    // --- Span Model ---
    pub use crate::trace::{Span, SpanGuard, SpanState, Timestamp, TraceContext, TraceId};
    pub use tracewire_proto::prelude::{AttrValue, SpanKind, SpanRecord, SpanStatus};

    // --- Instrumentation ---
    pub use crate::instrument::{Registry, TargetHandle, TargetSpec};

    // --- Export ---
    pub use crate::export::{
        Exporter, ExporterConfig, MemoryTransport, SpanSink, StatsSnapshot, TcpTransport,
        Transport, TransportError,
    };

    // --- Configuration ---
    pub use crate::config::AgentSettings;

    // --- Error Handling ---
    pub use crate::trace::TraceError;
}

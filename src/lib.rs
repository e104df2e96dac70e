//! tracewire: an in-process request-tracing agent.
//!
//! The agent ties the pieces of `tracewire-core` together: it loads
//! settings, declares the built-in instrumentation presets, applies the
//! configured target list, and runs the background exporter. Traced
//! code interacts with two values only: a [`TraceContext`] per request
//! and a [`TargetHandle`] per instrumented call site.

pub mod presets;

use std::sync::Arc;

use anyhow::Result;

use tracewire_core::export::{Exporter, SpanSink};

pub use tracewire_core::config::AgentSettings;
pub use tracewire_core::export::{
    MemoryTransport, StatsSnapshot, TcpTransport, Transport, TransportError,
};
pub use tracewire_core::instrument::{Registry, TargetHandle, TargetSpec};
pub use tracewire_core::trace::{
    ContextSnapshot, Span, SpanGuard, SpanKind, SpanStatus, TraceContext, TraceError, TraceId,
};
pub use tracewire_proto::dto::span::SpanRecord;

const ENV_LOGLEVEL: &str = "TRACEWIRE_LOGLEVEL";

fn init_logging() {
    let filters = std::env::var(ENV_LOGLEVEL).unwrap_or_else(|_| "info".to_string());
    let _ = env_logger::Builder::new().parse_filters(&filters).try_init();
}

/// The running tracing agent.
///
/// One agent per process; each incoming request gets its own
/// [`TraceContext`] from [`Agent::context`]. Dropping the agent (or
/// calling [`Agent::shutdown`]) drains the exporter within its bounded
/// timeout.
pub struct Agent {
    registry: Arc<Registry>,
    exporter: Option<Exporter>,
    sink: SpanSink,
}

impl Agent {
    /// Initialize with explicit settings. The transport is chosen from
    /// the settings: TCP when a collector address is configured, an
    /// in-process buffer otherwise.
    pub fn init(settings: AgentSettings) -> Result<Self> {
        let transport: Arc<dyn Transport> = match &settings.collector_addr {
            Some(addr) => Arc::new(TcpTransport::new(addr.clone())),
            None => {
                log::info!("no collector configured, exporting to an in-process buffer");
                Arc::new(MemoryTransport::new())
            }
        };
        Self::init_with_transport(settings, transport)
    }

    /// Initialize from `TRACEWIRE_*` environment variables.
    pub fn init_from_env() -> Result<Self> {
        Self::init(AgentSettings::from_env())
    }

    /// Initialize with a caller-provided transport.
    pub fn init_with_transport(
        settings: AgentSettings,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        init_logging();
        settings.record();

        let registry = Arc::new(Registry::new());
        presets::declare_builtin(&registry);
        let applied = registry.apply_all(&settings.targets);
        log::info!(
            "tracing enabled for {applied} of {} configured targets",
            settings.targets.len()
        );

        let exporter = Exporter::spawn(settings.exporter_config(), transport)?;
        let sink = exporter.sink();
        Ok(Agent {
            registry,
            exporter: Some(exporter),
            sink,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Declare an application-specific instrumentable target. Combine
    /// with [`Agent::apply`] to enable it outside the configured list.
    pub fn declare(&self, name: &str, kind: SpanKind) -> TargetHandle {
        self.registry.declare(name, kind)
    }

    pub fn apply(&self, spec: &TargetSpec) -> std::result::Result<(), TraceError> {
        self.registry.apply(spec)
    }

    /// Handle for an instrumented call site.
    pub fn handle(&self, name: &str) -> Option<TargetHandle> {
        self.registry.handle(name)
    }

    /// A context starting a fresh trace for one logical request.
    pub fn context(&self) -> TraceContext {
        TraceContext::new(self.sink.clone())
    }

    /// Join a trace propagated by an upstream service. An unparseable
    /// trace id falls back to a fresh trace with a log; the request
    /// path never sees an error.
    pub fn context_with_remote_parent(&self, trace_id: &str, parent_span_id: u64) -> TraceContext {
        match TraceId::from_hex(trace_id) {
            Some(id) => TraceContext::with_remote_parent(self.sink.clone(), id, parent_span_id),
            None => {
                log::warn!("invalid upstream trace id {trace_id:?}, starting a fresh trace");
                TraceContext::new(self.sink.clone())
            }
        }
    }

    /// Exporter counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.sink.stats()
    }

    /// Drain pending spans within the configured timeout and stop the
    /// exporter. The process can always exit afterwards.
    pub fn shutdown(mut self) {
        if let Some(exporter) = self.exporter.take() {
            exporter.shutdown();
        }
    }
}

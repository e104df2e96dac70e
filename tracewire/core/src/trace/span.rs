use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use uuid::Uuid;

use super::TraceError;
pub use tracewire_proto::dto::span::{SpanKind, SpanRecord, SpanStatus};
pub use tracewire_proto::types::AttrValue;

// Span ids only need to be unique within the process; a counter keeps
// them cheap and collision-free.
static NEXT_SPAN_ID: AtomicU64 = AtomicU64::new(1);

fn next_span_id() -> u64 {
    NEXT_SPAN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Obtain a numeric thread identifier using platform facilities where possible.
///
/// On macOS we use `pthread_self()` which is stable per thread lifetime.
/// On Linux we use the `gettid` syscall for the OS thread id.
/// On other platforms we hash the opaque `std::thread::ThreadId` debug output
/// to yield a reproducible u64 within process lifetime.
pub(crate) fn current_thread_id() -> u64 {
    #[cfg(target_os = "macos")]
    unsafe {
        return libc::pthread_self() as u64;
    }
    #[cfg(target_os = "linux")]
    unsafe {
        return libc::syscall(libc::SYS_gettid) as u64;
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let tid = std::thread::current().id();
        let mut h = DefaultHasher::new();
        // ThreadId only implements Debug; convert to string and hash.
        format!("{:?}", tid).hash(&mut h);
        h.finish()
    }
}

/// Trace identifier shared by every span of one logical request.
///
/// Generated locally as a v4 UUID, or adopted from an upstream service
/// via [`TraceId::from_hex`]. On the wire it travels as 32 lowercase
/// hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId(Uuid);

impl TraceId {
    pub fn generate() -> Self {
        TraceId(Uuid::new_v4())
    }

    /// Parse a 32-hex trace id propagated by an upstream service.
    pub fn from_hex(s: &str) -> Option<Self> {
        Uuid::try_parse(s).ok().map(TraceId)
    }

    pub fn to_hex(&self) -> String {
        self.0.simple().to_string()
    }
}

impl Display for TraceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// --- Timestamp ---
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(pub u128);

impl Timestamp {
    pub fn now() -> Self {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_or_else(
                |_| Timestamp(0), // Fallback for systems where time might be before UNIX_EPOCH
                |d| Timestamp(d.as_nanos()),
            )
    }

    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        if self.0 > earlier.0 {
            Duration::from_nanos((self.0 - earlier.0) as u64)
        } else {
            Duration::from_nanos(0) // Avoid panic if earlier is not actually earlier
        }
    }

    pub fn as_unix_nanos(&self) -> u64 {
        u64::try_from(self.0).unwrap_or(u64::MAX)
    }
}

/// Lifecycle position of a span while it is still owned by the tracer.
///
/// - `Open`: the span is running (end time is unset)
/// - `Closed`: the span has been ended and is ready for handoff
///
/// The later `Exported`/`Dropped` stages belong to the exporter queue,
/// which owns the serialized record after handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpanState {
    Open,
    Closed,
}

impl SpanState {
    pub fn from_end_time(end: Option<Timestamp>) -> Self {
        if end.is_some() {
            SpanState::Closed
        } else {
            SpanState::Open
        }
    }
}

/// A timed record of one unit of work within a trace.
#[derive(Debug, Clone)]
pub struct Span {
    pub trace_id: TraceId,
    pub span_id: u64,
    pub parent_id: Option<u64>,
    pub thread_id: u64, // stable numeric id for the originating thread

    pub name: String,
    pub kind: SpanKind,

    pub start: Timestamp,
    pub end: Option<Timestamp>,
    pub status: SpanStatus,

    pub attrs: BTreeMap<String, AttrValue>,
}

impl Span {
    /// Creates a span at an arbitrary position in an existing trace.
    ///
    /// The propagator uses this to parent spans onto a remote span id
    /// it never held a `Span` value for.
    pub fn new_in_trace<N: Into<String>>(
        trace_id: TraceId,
        parent_id: Option<u64>,
        name: N,
        kind: SpanKind,
    ) -> Self {
        Span {
            trace_id,
            span_id: next_span_id(),
            parent_id,
            thread_id: current_thread_id(),
            name: name.into(),
            kind,
            start: Timestamp::now(),
            end: None,
            status: SpanStatus::Ok,
            attrs: BTreeMap::new(),
        }
    }

    /// Creates a new root span (starts a new trace).
    pub fn new_root<N: Into<String>>(name: N, kind: SpanKind) -> Self {
        Self::new_in_trace(TraceId::generate(), None, name, kind)
    }

    /// Creates a new child span within an existing trace.
    pub fn new_child<N: Into<String>>(parent: &Span, name: N, kind: SpanKind) -> Self {
        Self::new_in_trace(parent.trace_id, Some(parent.span_id), name, kind)
    }

    /// Adds an attribute to this span.
    ///
    /// Returns an error if the span has already been ended.
    pub fn set_attr<K: Into<String>, V: Into<AttrValue>>(
        &mut self,
        key: K,
        value: V,
    ) -> Result<(), TraceError> {
        if self.end.is_some() {
            return Err(TraceError::AlreadyClosed);
        }
        self.attrs.insert(key.into(), value.into());
        Ok(())
    }

    /// Ends this span with the given final status.
    ///
    /// The end timestamp is clamped so it never precedes the start
    /// timestamp, even if the system clock stepped backwards. Ending a
    /// span twice returns `AlreadyClosed` on the second call; the first
    /// end time and status stand.
    pub fn end(&mut self, status: SpanStatus) -> Result<(), TraceError> {
        if self.end.is_some() {
            return Err(TraceError::AlreadyClosed);
        }
        let now = Timestamp::now();
        self.end = Some(if now < self.start { self.start } else { now });
        self.status = status;
        Ok(())
    }

    /// Ends this span with success status.
    pub fn end_ok(&mut self) -> Result<(), TraceError> {
        self.end(SpanStatus::Ok)
    }

    /// Ends this span with error status, optionally recording the error
    /// message as an attribute.
    pub fn end_error(&mut self, message: Option<&str>) -> Result<(), TraceError> {
        if let Some(msg) = message {
            self.set_attr("error.message", msg)?;
        }
        self.end(SpanStatus::Error)
    }

    pub fn state(&self) -> SpanState {
        SpanState::from_end_time(self.end)
    }

    /// Returns the duration of this span if it has been ended.
    pub fn duration(&self) -> Option<Duration> {
        self.end.map(|et| et.duration_since(self.start))
    }

    pub fn is_ended(&self) -> bool {
        self.end.is_some()
    }

    /// Consumes the span into its immutable exported form.
    ///
    /// An open span is treated as ending now; the propagator only hands
    /// closed spans to the exporter, so that path never hits the
    /// fallback.
    pub fn into_record(self) -> SpanRecord {
        let end = self.end.unwrap_or_else(Timestamp::now);
        SpanRecord {
            trace_id: self.trace_id.to_hex(),
            span_id: self.span_id,
            parent_span_id: self.parent_id,
            thread_id: self.thread_id,
            name: self.name,
            kind: self.kind,
            status: self.status,
            start_unix_nanos: self.start.as_unix_nanos(),
            end_unix_nanos: end.as_unix_nanos().max(self.start.as_unix_nanos()),
            attributes: self.attrs,
        }
    }
}

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::AttrValue;

/// The flavor of the call a span covers.
///
/// `Function` and `Method` mirror the two shapes an instrumentation
/// target can take; the remaining kinds exist for the built-in presets
/// that cover database clients, http clients, caches and template
/// rendering.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Function,
    Method,
    Database,
    Http,
    Cache,
    Template,
}

impl Display for SpanKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SpanKind::Function => "function",
            SpanKind::Method => "method",
            SpanKind::Database => "database",
            SpanKind::Http => "http",
            SpanKind::Cache => "cache",
            SpanKind::Template => "template",
        };
        f.write_str(name)
    }
}

/// Final status of a closed span.
#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    #[default]
    Ok,
    Error,
}

/// Immutable snapshot of one closed span, as shipped to the collector.
///
/// Records are produced exactly once, when a span is closed and handed
/// to the exporter; nothing mutates them afterwards.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct SpanRecord {
    /// 32-hex trace identifier shared by every span of one request.
    pub trace_id: String,
    pub span_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<u64>,
    /// Numeric id of the OS thread the span was opened on.
    pub thread_id: u64,
    pub name: String,
    pub kind: SpanKind,
    pub status: SpanStatus,
    pub start_unix_nanos: u64,
    pub end_unix_nanos: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttrValue>,
}

impl SpanRecord {
    pub fn duration(&self) -> Duration {
        Duration::from_nanos(self.end_unix_nanos.saturating_sub(self.start_unix_nanos))
    }
}

impl Display for SpanRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let start: DateTime<Utc> =
            (SystemTime::UNIX_EPOCH + Duration::from_nanos(self.start_unix_nanos)).into();
        write!(
            f,
            "{} [{}] {} @ {} ({:?})",
            self.trace_id,
            self.kind,
            self.name,
            start.to_rfc3339(),
            self.duration()
        )
    }
}

/// One transport send: a sequence-numbered batch of span records.
///
/// The sequence number increases monotonically per exporter and lets a
/// collector spot gaps left by dropped batches.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct ExportBatch {
    pub seq: u64,
    pub spans: Vec<SpanRecord>,
}

impl ExportBatch {
    pub fn new(seq: u64, spans: Vec<SpanRecord>) -> Self {
        ExportBatch { seq, spans }
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> SpanRecord {
        SpanRecord {
            trace_id: "4bf92f3577b34da6a3ce929d0e0e4736".to_string(),
            span_id: 17,
            parent_span_id: Some(4),
            thread_id: 1001,
            name: "db.query".to_string(),
            kind: SpanKind::Database,
            status: SpanStatus::Ok,
            start_unix_nanos: 1_000_000_000,
            end_unix_nanos: 1_250_000_000,
            attributes: BTreeMap::from([(
                "statement".to_string(),
                AttrValue::Text("select 1".to_string()),
            )]),
        }
    }

    #[test]
    fn test_record_duration() {
        let record = sample_record();
        assert_eq!(record.duration(), Duration::from_millis(250));
    }

    #[test]
    fn test_duration_saturates_on_inverted_timestamps() {
        let mut record = sample_record();
        record.end_unix_nanos = 0;
        assert_eq!(
            record.duration(),
            Duration::ZERO,
            "inverted timestamps must not underflow"
        );
    }

    #[test]
    fn test_record_round_trip() {
        let record = sample_record();
        let json = serde_json::to_string(&record).unwrap();
        let back: SpanRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_root_span_omits_parent() {
        let mut record = sample_record();
        record.parent_span_id = None;
        record.attributes.clear();
        let json = serde_json::to_string(&record).unwrap();
        assert!(
            !json.contains("parent_span_id"),
            "root spans serialize without a parent field"
        );
        assert!(!json.contains("attributes"));
    }

    #[test]
    fn test_kind_and_status_wire_names() {
        let json = serde_json::to_string(&SpanKind::Database).unwrap();
        assert_eq!(json, "\"database\"");
        let json = serde_json::to_string(&SpanStatus::Error).unwrap();
        assert_eq!(json, "\"error\"");
    }

    #[test]
    fn test_batch_accessors() {
        let batch = ExportBatch::new(3, vec![sample_record()]);
        assert_eq!(batch.seq, 3);
        assert_eq!(batch.len(), 1);
        assert!(!batch.is_empty());
        assert!(ExportBatch::new(4, vec![]).is_empty());
    }
}

pub mod dto;
pub mod types;

pub mod prelude {
    // --- Span Records ---
    pub use crate::dto::span::{ExportBatch, SpanKind, SpanRecord, SpanStatus};

    // --- Core Data Types ---
    pub use crate::types::AttrValue;
}

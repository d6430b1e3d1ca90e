//! Core data model: spans, traces, tenants.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Fixed-width 128-bit trace identifier. Ordered byte-wise so blocks can be
/// sorted and binary-searched by trace ID.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TraceId(pub [u8; 16]);

impl TraceId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Convenience constructor for tests and examples: low 64 bits set.
    pub fn from_u64(v: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[8..].copy_from_slice(&v.to_be_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({})", self)
    }
}

/// 64-bit span identifier, unique within a trace.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpanId(pub [u8; 8]);

impl SpanId {
    pub fn from_u64(v: u64) -> Self {
        Self(v.to_be_bytes())
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId({})", self)
    }
}

/// Tenant identifier; the isolation boundary for all routing and storage.
pub type TenantId = String;

/// Span attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanStatus {
    Unset,
    Ok,
    Error,
}

/// A single recorded unit of work. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub service: String,
    pub operation: String,
    /// Start time, unix nanoseconds.
    pub start_unix_nanos: i64,
    pub duration_nanos: u64,
    pub attributes: HashMap<String, AttrValue>,
    pub status: SpanStatus,
}

impl Span {
    /// End time, saturating at the representable maximum for hostile
    /// durations instead of wrapping.
    pub fn end_unix_nanos(&self) -> i64 {
        let duration = i64::try_from(self.duration_nanos).unwrap_or(i64::MAX);
        self.start_unix_nanos.saturating_add(duration)
    }
}

/// A fully assembled trace: every known span sharing one trace ID, ordered
/// by start time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: TraceId,
    pub spans: Vec<Span>,
}

impl Trace {
    /// Merge spans from multiple sources (live buffers, several blocks) into
    /// one trace, deduplicating by span ID. A span seen both buffered and
    /// flushed must appear once.
    pub fn assemble(trace_id: TraceId, spans: Vec<Span>) -> Self {
        let mut seen = std::collections::HashSet::new();
        let mut out: Vec<Span> = spans
            .into_iter()
            .filter(|s| seen.insert(s.span_id))
            .collect();
        out.sort_by_key(|s| (s.start_unix_nanos, s.span_id));
        Self { trace_id, spans: out }
    }

    pub fn start_unix_nanos(&self) -> i64 {
        self.spans.iter().map(|s| s.start_unix_nanos).min().unwrap_or(0)
    }

    /// Root span: the first span without a parent, falling back to the
    /// earliest span when the root never arrived.
    pub fn root_span(&self) -> Option<&Span> {
        self.spans
            .iter()
            .find(|s| s.parent_span_id.is_none())
            .or_else(|| self.spans.first())
    }
}

/// Condensed search result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub trace_id: TraceId,
    pub root_service: String,
    pub root_operation: String,
    pub start_unix_nanos: i64,
    pub duration_nanos: u64,
    pub span_count: usize,
}

impl TraceSummary {
    pub fn from_spans(trace_id: TraceId, spans: &[Span]) -> Self {
        let root = spans
            .iter()
            .find(|s| s.parent_span_id.is_none())
            .or_else(|| spans.iter().min_by_key(|s| s.start_unix_nanos));
        let start = spans.iter().map(|s| s.start_unix_nanos).min().unwrap_or(0);
        let end = spans.iter().map(|s| s.end_unix_nanos()).max().unwrap_or(start);
        Self {
            trace_id,
            root_service: root.map(|s| s.service.clone()).unwrap_or_default(),
            root_operation: root.map(|s| s.operation.clone()).unwrap_or_default(),
            start_unix_nanos: start,
            duration_nanos: (end - start).max(0) as u64,
            span_count: spans.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(id: u64, parent: Option<u64>, start: i64) -> Span {
        Span {
            trace_id: TraceId::from_u64(1),
            span_id: SpanId::from_u64(id),
            parent_span_id: parent.map(SpanId::from_u64),
            service: "svc".into(),
            operation: "op".into(),
            start_unix_nanos: start,
            duration_nanos: 100,
            attributes: HashMap::new(),
            status: SpanStatus::Ok,
        }
    }

    #[test]
    fn assemble_dedupes_by_span_id() {
        let spans = vec![span(1, None, 10), span(2, Some(1), 20), span(1, None, 10)];
        let trace = Trace::assemble(TraceId::from_u64(1), spans);
        assert_eq!(trace.spans.len(), 2);
        assert_eq!(trace.spans[0].span_id, SpanId::from_u64(1));
    }

    #[test]
    fn summary_picks_root_without_parent() {
        let spans = vec![span(2, Some(1), 20), span(1, None, 10)];
        let summary = TraceSummary::from_spans(TraceId::from_u64(1), &spans);
        assert_eq!(summary.span_count, 2);
        assert_eq!(summary.start_unix_nanos, 10);
        assert_eq!(summary.duration_nanos, 110);
    }

    #[test]
    fn end_time_saturates_on_huge_durations() {
        let mut s = span(1, None, i64::MAX - 10);
        s.duration_nanos = u64::MAX;
        assert_eq!(s.end_unix_nanos(), i64::MAX);

        let mut s = span(1, None, 100);
        s.duration_nanos = u64::MAX;
        assert_eq!(s.end_unix_nanos(), i64::MAX);
        assert!(s.end_unix_nanos() >= s.start_unix_nanos);
    }

    #[test]
    fn trace_id_ordering_is_bytewise() {
        assert!(TraceId::from_u64(1) < TraceId::from_u64(2));
        assert!(TraceId::from_u64(255) < TraceId::from_u64(256));
    }
}

//! Per-tenant shard state.
//!
//! A shard owns one ACTIVE head buffer, a queue of cut (frozen) buffers
//! waiting to be flushed, and one in-flight slot for the buffer currently
//! being flushed. Cutting swaps a fresh head in atomically, so writes never
//! block on a flush in progress. All three stages stay on the live-query
//! surface: a buffer becomes invisible only once its block is durable.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::IngesterConfig;
use crate::model::{Span, TenantId, TraceId};

/// Mutable ACTIVE-phase buffer.
#[derive(Debug)]
pub struct HeadBuffer {
    pub traces: BTreeMap<TraceId, Vec<Span>>,
    pub bytes: usize,
    pub span_count: usize,
    pub created_at: Instant,
}

impl HeadBuffer {
    fn new() -> Self {
        Self {
            traces: BTreeMap::new(),
            bytes: 0,
            span_count: 0,
            created_at: Instant::now(),
        }
    }

    fn push(&mut self, span: Span) {
        self.bytes += span_size_estimate(&span);
        self.span_count += 1;
        self.traces.entry(span.trace_id).or_default().push(span);
    }
}

/// A cut buffer: frozen, CUTTING/FLUSHING phase, immutable content. Traces
/// sit behind an `Arc` so the flush path and the in-flight slot share one
/// copy.
#[derive(Debug, Clone)]
pub struct FrozenBuffer {
    pub traces: Arc<BTreeMap<TraceId, Vec<Span>>>,
    pub bytes: usize,
    pub span_count: usize,
    /// Flush attempts so far; drives the retry backoff.
    pub attempts: u32,
    /// Earliest time the next flush attempt may run.
    pub not_before: Instant,
}

pub struct TenantShard {
    pub tenant: TenantId,
    head: Mutex<HeadBuffer>,
    frozen: Mutex<VecDeque<FrozenBuffer>>,
    flushing: Mutex<Option<FrozenBuffer>>,
}

impl TenantShard {
    pub fn new(tenant: TenantId) -> Self {
        Self {
            tenant,
            head: Mutex::new(HeadBuffer::new()),
            frozen: Mutex::new(VecDeque::new()),
            flushing: Mutex::new(None),
        }
    }

    /// Append spans to the head buffer. Returns true when the head has
    /// crossed the size threshold and should be cut.
    pub fn push(&self, spans: Vec<Span>, config: &IngesterConfig) -> bool {
        let mut head = self.head.lock();
        for span in spans {
            head.push(span);
        }
        head.span_count > 0 && head.bytes >= config.max_buffer_bytes
    }

    /// ACTIVE → CUTTING: freeze the head and install a fresh one. No-op on an
    /// empty head.
    pub fn cut(&self) -> bool {
        let mut head = self.head.lock();
        if head.span_count == 0 {
            return false;
        }
        let cut = std::mem::replace(&mut *head, HeadBuffer::new());
        drop(head);

        self.frozen.lock().push_back(FrozenBuffer {
            traces: Arc::new(cut.traces),
            bytes: cut.bytes,
            span_count: cut.span_count,
            attempts: 0,
            not_before: Instant::now(),
        });
        true
    }

    /// Cut when the head is older than the configured max age.
    pub fn cut_if_stale(&self, config: &IngesterConfig) -> bool {
        let stale = {
            let head = self.head.lock();
            head.span_count > 0 && head.created_at.elapsed() >= config.max_buffer_age
        };
        if stale {
            self.cut()
        } else {
            false
        }
    }

    /// Move the next due frozen buffer into the in-flight slot and hand it to
    /// the flusher. The buffer stays on the live-query surface until
    /// `complete_flush` confirms the block is durable. Returns None while a
    /// flush is already in flight.
    pub fn take_flushable(&self, now: Instant) -> Option<FrozenBuffer> {
        let mut flushing = self.flushing.lock();
        if flushing.is_some() {
            return None;
        }
        let mut frozen = self.frozen.lock();
        let pos = frozen.iter().position(|b| b.not_before <= now)?;
        let buffer = frozen.remove(pos)?;
        *flushing = Some(buffer.clone());
        Some(buffer)
    }

    /// FLUSHING → durable: the block is committed, drop the buffer.
    pub fn complete_flush(&self) {
        *self.flushing.lock() = None;
    }

    /// Re-queue a buffer whose flush failed; it is never discarded.
    pub fn requeue(&self, buffer: FrozenBuffer) {
        *self.flushing.lock() = None;
        self.frozen.lock().push_front(buffer);
    }

    /// Live-query surface: all buffered spans for a trace, across head,
    /// frozen queue, and the in-flight flush.
    pub fn spans_for_trace(&self, trace_id: &TraceId) -> Vec<Span> {
        let mut out = Vec::new();
        if let Some(spans) = self.head.lock().traces.get(trace_id) {
            out.extend(spans.iter().cloned());
        }
        for buffer in self.frozen.lock().iter() {
            if let Some(spans) = buffer.traces.get(trace_id) {
                out.extend(spans.iter().cloned());
            }
        }
        if let Some(buffer) = self.flushing.lock().as_ref() {
            if let Some(spans) = buffer.traces.get(trace_id) {
                out.extend(spans.iter().cloned());
            }
        }
        out
    }

    /// All buffered spans, for live search scans.
    pub fn all_spans(&self) -> Vec<Span> {
        let mut out = Vec::new();
        for spans in self.head.lock().traces.values() {
            out.extend(spans.iter().cloned());
        }
        for buffer in self.frozen.lock().iter() {
            for spans in buffer.traces.values() {
                out.extend(spans.iter().cloned());
            }
        }
        if let Some(buffer) = self.flushing.lock().as_ref() {
            for spans in buffer.traces.values() {
                out.extend(spans.iter().cloned());
            }
        }
        out
    }

    /// Buffered-but-unflushed volume, the operator-visible loss window.
    /// Counts the in-flight buffer too; it is only durable once committed.
    pub fn unflushed(&self) -> (usize, usize) {
        let head = self.head.lock();
        let mut bytes = head.bytes;
        let mut spans = head.span_count;
        drop(head);
        for buffer in self.frozen.lock().iter() {
            bytes += buffer.bytes;
            spans += buffer.span_count;
        }
        if let Some(buffer) = self.flushing.lock().as_ref() {
            bytes += buffer.bytes;
            spans += buffer.span_count;
        }
        (bytes, spans)
    }

    pub fn pending_flushes(&self) -> usize {
        self.frozen.lock().len()
    }
}

/// Rough in-memory footprint of a span; drives the cut threshold. An exact
/// serialized size is not needed, only a stable monotonic estimate.
fn span_size_estimate(span: &Span) -> usize {
    let attrs: usize = span
        .attributes
        .iter()
        .map(|(k, v)| {
            k.len()
                + match v {
                    crate::model::AttrValue::String(s) => s.len(),
                    _ => 8,
                }
        })
        .sum();
    48 + span.service.len() + span.operation.len() + attrs
}

// Declared key spans of a command

use crate::hlc::HLCTimestamp;
use crate::keys::Span;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpanAccess {
    ReadOnly,
    ReadWrite,
}

/// A span a command will touch, and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredSpan {
    pub span: Span,
    pub access: SpanAccess,
    /// MVCC timestamp of the access. `None` declares a non-MVCC access,
    /// which conflicts at every timestamp.
    pub timestamp: Option<HLCTimestamp>,
}

impl DeclaredSpan {
    pub fn conflicts_with(&self, other: &DeclaredSpan) -> bool {
        if !self.span.overlaps(&other.span) {
            return false;
        }
        match (self.access, other.access) {
            (SpanAccess::ReadOnly, SpanAccess::ReadOnly) => false,
            (SpanAccess::ReadWrite, SpanAccess::ReadWrite) => true,
            (SpanAccess::ReadOnly, SpanAccess::ReadWrite) => {
                read_write_conflict(self.timestamp, other.timestamp)
            }
            (SpanAccess::ReadWrite, SpanAccess::ReadOnly) => {
                read_write_conflict(other.timestamp, self.timestamp)
            }
        }
    }
}

// A write only affects reads at or above its timestamp.
fn read_write_conflict(read: Option<HLCTimestamp>, write: Option<HLCTimestamp>) -> bool {
    match (read, write) {
        (Some(read), Some(write)) => write <= read,
        _ => true,
    }
}

/// The full set of spans a command declares before evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpanSet {
    spans: Vec<DeclaredSpan>,
}

impl SpanSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_mvcc(&mut self, access: SpanAccess, span: Span, timestamp: HLCTimestamp) {
        self.spans.push(DeclaredSpan {
            span,
            access,
            timestamp: Some(timestamp),
        });
    }

    pub fn add_non_mvcc(&mut self, access: SpanAccess, span: Span) {
        self.spans.push(DeclaredSpan {
            span,
            access,
            timestamp: None,
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeclaredSpan> {
        self.spans.iter()
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn conflicts_with(&self, other: &SpanSet) -> bool {
        self.spans
            .iter()
            .any(|a| other.spans.iter().any(|b| a.conflicts_with(b)))
    }
}

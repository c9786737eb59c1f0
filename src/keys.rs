// Key and span model for latching
//
// Range-local keys (lease record, range descriptor) live in their own
// keyspace and never overlap user keys.

use crate::RangeId;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

const LOCAL_RANGE_ID_PREFIX: &[u8] = b"\x01i";
const LEASE_SUFFIX: &[u8] = b"rll-";
const DESCRIPTOR_SUFFIX: &[u8] = b"rdsc";

/// Which keyspace a span addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpanScope {
    /// Range-local keys such as the lease record.
    Local,
    /// User keys.
    Global,
}

/// A key or key range `[start, end)`. A missing `end` addresses the single key `start`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub scope: SpanScope,
    pub start: Bytes,
    pub end: Option<Bytes>,
}

impl Span {
    pub fn key(scope: SpanScope, key: impl Into<Bytes>) -> Self {
        Self {
            scope,
            start: key.into(),
            end: None,
        }
    }

    pub fn range(scope: SpanScope, start: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        Self {
            scope,
            start: start.into(),
            end: Some(end.into()),
        }
    }

    /// Everything in a scope.
    pub fn everything(scope: SpanScope) -> Self {
        Self::range(scope, Bytes::new(), Bytes::from_static(&[0xff; 8]))
    }

    fn contains_key(&self, key: &[u8]) -> bool {
        match &self.end {
            None => self.start.as_ref() == key,
            Some(end) => self.start.as_ref() <= key && key < end.as_ref(),
        }
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        if self.scope != other.scope {
            return false;
        }
        match (&self.end, &other.end) {
            (None, None) => self.start == other.start,
            (None, Some(_)) => other.contains_key(&self.start),
            (Some(_), None) => self.contains_key(&other.start),
            (Some(end), Some(other_end)) => self.start < *other_end && other.start < *end,
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scope = match self.scope {
            SpanScope::Local => "local",
            SpanScope::Global => "global",
        };
        match &self.end {
            None => write!(f, "{scope}:{:?}", self.start),
            Some(end) => write!(f, "{scope}:[{:?}, {:?})", self.start, end),
        }
    }
}

fn range_id_prefix(range_id: RangeId) -> BytesMut {
    let mut key = BytesMut::with_capacity(LOCAL_RANGE_ID_PREFIX.len() + 8 + 4);
    key.put_slice(LOCAL_RANGE_ID_PREFIX);
    key.put_u64(range_id.0);
    key
}

/// The key holding the range's lease record.
pub fn range_lease_key(range_id: RangeId) -> Bytes {
    let mut key = range_id_prefix(range_id);
    key.put_slice(LEASE_SUFFIX);
    key.freeze()
}

/// The key holding the range's membership descriptor.
pub fn range_descriptor_key(range_id: RangeId) -> Bytes {
    let mut key = range_id_prefix(range_id);
    key.put_slice(DESCRIPTOR_SUFFIX);
    key.freeze()
}

/// All range-local keys of a range.
pub fn range_local_span(range_id: RangeId) -> Span {
    let start = range_id_prefix(range_id).freeze();
    let end = prefix_end(&start);
    Span::range(SpanScope::Local, start, end)
}

/// The first key after every key starting with `prefix`: the prefix with its
/// last non-0xff byte incremented and the trailing 0xff bytes dropped.
fn prefix_end(prefix: &[u8]) -> Bytes {
    match prefix.iter().rposition(|&b| b != 0xff) {
        Some(i) => {
            let mut end = BytesMut::from(&prefix[..=i]);
            end[i] += 1;
            end.freeze()
        }
        None => Span::everything(SpanScope::Local).end.unwrap_or_default(),
    }
}

// In-memory span latches serializing commands on a range
//
// A command waits for every earlier command whose declared spans conflict
// with its own, and holds its latches until its guard is dropped. Waiting
// only on earlier arrivals keeps the wait graph acyclic.

pub mod declare;
pub mod spanset;

pub use declare::{
    declare_all_keys, declare_keys_change_membership, declare_keys_get, declare_keys_put,
    declare_keys_request_lease, declare_keys_transfer_lease,
};
pub use spanset::{DeclaredSpan, SpanAccess, SpanSet};

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

#[derive(Debug)]
struct Latch {
    spans: SpanSet,
    // Closes when the holder's guard drops.
    released: watch::Receiver<()>,
}

#[derive(Debug, Default)]
struct LatchTable {
    next_id: u64,
    // Keyed by arrival order; includes latches still waiting.
    latches: BTreeMap<u64, Latch>,
}

#[derive(Debug, Default)]
pub struct LatchManager {
    table: Arc<Mutex<LatchTable>>,
}

impl LatchManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires latches over `spans`, waiting for every conflicting latch that
    /// arrived earlier to be released.
    ///
    /// The latch is registered before waiting, so later conflicting commands
    /// queue behind it. Dropping the returned future before it completes
    /// releases the registration.
    pub async fn acquire(&self, spans: SpanSet) -> LatchGuard {
        let (released_tx, released_rx) = watch::channel(());
        let (id, prerequisites) = {
            let mut table = self.table.lock();
            let id = table.next_id;
            table.next_id += 1;
            let prerequisites: Vec<watch::Receiver<()>> = table
                .latches
                .values()
                .filter(|latch| latch.spans.conflicts_with(&spans))
                .map(|latch| latch.released.clone())
                .collect();
            table.latches.insert(
                id,
                Latch {
                    spans,
                    released: released_rx,
                },
            );
            (id, prerequisites)
        };

        let guard = LatchGuard {
            id,
            table: Arc::clone(&self.table),
            _released: released_tx,
        };

        if !prerequisites.is_empty() {
            trace!(latch = id, waiting_on = prerequisites.len(), "waiting for conflicting latches");
        }
        for mut released in prerequisites {
            // Nothing is ever sent; the channel only closes.
            while released.changed().await.is_ok() {}
        }
        guard
    }

    /// Latches currently held or waiting.
    pub fn len(&self) -> usize {
        self.table.lock().latches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held latches. Releases on drop, on every exit path.
#[derive(Debug)]
pub struct LatchGuard {
    id: u64,
    table: Arc<Mutex<LatchTable>>,
    _released: watch::Sender<()>,
}

impl Drop for LatchGuard {
    fn drop(&mut self) {
        self.table.lock().latches.remove(&self.id);
    }
}

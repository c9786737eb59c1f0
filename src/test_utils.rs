use crate::config::ReplicaConfig;
use crate::consensus::InMemoryLog;
use crate::hlc::{HLCTimestamp, HLC};
use crate::membership::{RangeDescriptor, ReplicaDescriptor};
use crate::replica::{RangeHandles, Replica};
use crate::store::{LeaseStateStore, MvccData};
use crate::{NodeId, RangeId, ReplicaId, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Physical time that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(millis: u64) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(millis)),
        }
    }

    pub fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }

    /// The current physical time as a timestamp with no logical component.
    pub fn timestamp(&self) -> HLCTimestamp {
        HLCTimestamp::new(self.now_millis(), 0)
    }

    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.millis.fetch_add(by, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    /// A fresh hybrid clock driven by this physical clock.
    pub fn hlc(&self, max_offset: Duration) -> HLC {
        let millis = Arc::clone(&self.millis);
        HLC::new_with_clock(Box::new(move || millis.load(Ordering::SeqCst)), max_offset)
    }
}

pub const TEST_RANGE: RangeId = RangeId(1);

/// One range replicated on three nodes: voters 1 and 2, learner 3. Every
/// replica has its own hybrid clock over a shared manual physical clock.
#[derive(Debug)]
pub struct TestRange {
    pub clock: ManualClock,
    pub store: Arc<LeaseStateStore>,
    pub log: Arc<InMemoryLog>,
    pub replicas: Vec<Arc<Replica>>,
}

impl TestRange {
    pub fn new(config: ReplicaConfig) -> Result<Self> {
        let desc = RangeDescriptor::new(
            TEST_RANGE,
            "a",
            "z",
            vec![
                ReplicaDescriptor::voter(NodeId(1), ReplicaId(1)),
                ReplicaDescriptor::voter(NodeId(2), ReplicaId(2)),
                ReplicaDescriptor::learner(NodeId(3), ReplicaId(3)),
            ],
        );
        Self::with_descriptor(desc, config)
    }

    pub fn with_descriptor(desc: RangeDescriptor, config: ReplicaConfig) -> Result<Self> {
        let clock = ManualClock::new(1_000_000);
        let store = Arc::new(LeaseStateStore::new());
        store.add_range(desc.clone())?;
        let log = Arc::new(InMemoryLog::new(Arc::clone(&store)));
        let handles = RangeHandles {
            store: Arc::clone(&store),
            data: Arc::new(MvccData::new()),
            proposer: log.clone(),
        };

        let replicas = desc
            .replicas
            .iter()
            .map(|ident| {
                Arc::new(Replica::new(
                    desc.range_id,
                    *ident,
                    Arc::new(clock.hlc(config.max_clock_offset())),
                    handles.clone(),
                    config.clone(),
                ))
            })
            .collect();

        Ok(Self {
            clock,
            store,
            log,
            replicas,
        })
    }

    /// The replica with `replica_id`. Panics if there is none.
    pub fn replica(&self, replica_id: u32) -> Arc<Replica> {
        self.replicas
            .iter()
            .find(|r| r.ident().replica_id == ReplicaId(replica_id))
            .cloned()
            .unwrap_or_else(|| panic!("no replica {replica_id} in test range"))
    }

    pub fn ident(&self, replica_id: u32) -> ReplicaDescriptor {
        self.replica(replica_id).ident()
    }
}

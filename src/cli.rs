// Command line driver for in-memory range simulations

use crate::config::{LeaseKindConfig, ReplicaConfig};
use crate::hlc::HLCTimestamp;
use crate::leases::Lease;
use crate::membership::{RangeDescriptor, ReplicaDescriptor};
use crate::replica::LeaseMetricsSnapshot;
use crate::test_utils::{TestRange, TEST_RANGE};
use crate::{NodeId, ReplicaId, Result};
use bytes::Bytes;
use clap::{ArgAction, Parser, Subcommand};
use futures_util::future::join_all;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "range-lease", version, about, long_about = None)]
pub struct Cli {
    /// Replica config file (JSON)
    #[arg(short, long, value_name = "FILE", env = "RANGE_LEASE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbose mode (-v, -vv)
    #[arg(short, action = ArgAction::Count)]
    pub verbosity: u8,

    /// Maximum clock offset in milliseconds
    #[arg(long)]
    pub max_clock_offset: Option<u64>,

    /// Lease duration in milliseconds
    #[arg(long)]
    pub lease_duration: Option<u64>,

    /// Consensus wait in milliseconds
    #[arg(long)]
    pub proposal_timeout: Option<u64>,

    /// Use epoch-based leases
    #[arg(long)]
    pub epoch: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Acquires a lease on replica 1, serves some reads, then transfers it
    Transfer {
        /// Target replica (2 is a voter, 3 a learner)
        #[arg(long, default_value_t = 2)]
        to: u32,
        /// Reads served before the transfer
        #[arg(long, default_value_t = 3)]
        reads: u32,
        /// Fail the transfer's proposal
        #[arg(long)]
        fail_proposal: bool,
    },
    /// Races transfers from replica 1 to every other voter
    Race {
        #[arg(long, default_value_t = 3)]
        voters: u32,
        /// Consensus latency in milliseconds
        #[arg(long, default_value_t = 5)]
        latency: u64,
    },
    /// Prints the effective configuration
    Config,
}

#[derive(Debug, Serialize)]
pub struct Outcome {
    pub target: ReplicaId,
    pub lease: Option<Lease>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub config: ReplicaConfig,
    pub max_served: Option<HLCTimestamp>,
    pub outcomes: Vec<Outcome>,
    pub active_lease: Option<Lease>,
    pub log_entries: usize,
    pub metrics: Option<LeaseMetricsSnapshot>,
}

impl Cli {
    /// File config, then flag overrides.
    pub fn replica_config(&self) -> Result<ReplicaConfig> {
        let mut config = match &self.config {
            Some(path) => ReplicaConfig::from_file(path)?,
            None => ReplicaConfig::default(),
        };
        if let Some(offset) = self.max_clock_offset {
            config.max_clock_offset = offset;
        }
        if let Some(duration) = self.lease_duration {
            config.lease_duration = duration;
        }
        if let Some(timeout) = self.proposal_timeout {
            config.proposal_timeout = timeout;
        }
        if self.epoch {
            config.lease_kind = LeaseKindConfig::Epoch;
        }
        Ok(config)
    }
}

pub async fn run(cli: &Cli) -> Result<Report> {
    let config = cli.replica_config()?;
    match cli.command.clone() {
        Commands::Transfer {
            to,
            reads,
            fail_proposal,
        } => run_transfer(config, ReplicaId(to), reads, fail_proposal).await,
        Commands::Race { voters, latency } => run_race(config, voters, latency).await,
        Commands::Config => Ok(Report {
            config,
            max_served: None,
            outcomes: Vec::new(),
            active_lease: None,
            log_entries: 0,
            metrics: None,
        }),
    }
}

async fn run_transfer(
    config: ReplicaConfig,
    target: ReplicaId,
    reads: u32,
    fail_proposal: bool,
) -> Result<Report> {
    let range = TestRange::new(config.clone())?;
    let holder = range.replica(1);
    holder.request_lease().await?;

    for i in 0..reads {
        range.clock.advance(Duration::from_millis(10));
        let key = Bytes::from(format!("key-{i}"));
        holder.get(key, holder.clock().now()).await?;
    }

    if fail_proposal {
        range.log.fail_next(1);
    }
    let target_ident = range
        .replicas
        .iter()
        .map(|r| r.ident())
        .find(|ident| ident.replica_id == target)
        .unwrap_or(ReplicaDescriptor::voter(NodeId(target.0), target));
    info!(target = %target_ident, "transferring lease");
    let outcome = outcome(target, holder.transfer_lease(target_ident).await);

    Ok(Report {
        config,
        max_served: Some(holder.tscache().max_served()),
        outcomes: vec![outcome],
        active_lease: range.store.get_active_lease(TEST_RANGE)?,
        log_entries: range.log.len(),
        metrics: Some(holder.metrics()),
    })
}

async fn run_race(config: ReplicaConfig, voters: u32, latency: u64) -> Result<Report> {
    let replicas = (1..=voters.max(2))
        .map(|id| ReplicaDescriptor::voter(NodeId(id), ReplicaId(id)))
        .collect();
    let desc = RangeDescriptor::new(TEST_RANGE, "a", "z", replicas);
    let range = TestRange::with_descriptor(desc, config.clone())?;
    let holder = range.replica(1);
    holder.request_lease().await?;
    range.log.set_latency(Duration::from_millis(latency));

    let targets: Vec<ReplicaDescriptor> = range
        .replicas
        .iter()
        .map(|r| r.ident())
        .filter(|ident| ident.replica_id != ReplicaId(1))
        .collect();
    let results = join_all(targets.iter().map(|t| holder.transfer_lease(*t))).await;
    let outcomes = targets
        .iter()
        .zip(results)
        .map(|(t, result)| outcome(t.replica_id, result))
        .collect();

    Ok(Report {
        config,
        max_served: None,
        outcomes,
        active_lease: range.store.get_active_lease(TEST_RANGE)?,
        log_entries: range.log.len(),
        metrics: Some(holder.metrics()),
    })
}

fn outcome(target: ReplicaId, result: Result<Lease>) -> Outcome {
    match result {
        Ok(lease) => Outcome {
            target,
            lease: Some(lease),
            error: None,
        },
        Err(e) => Outcome {
            target,
            lease: None,
            error: Some(e.to_string()),
        },
    }
}

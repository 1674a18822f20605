//! Suspicion bookkeeping
//!
//! Per-replica evidence counts against a configured threshold. Crossing the
//! threshold produces a [`SuspicionReport`]; what to do about it is left to
//! the surrounding system.

use crate::messages::ReplicaId;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Raised when a replica's evidence count reaches the threshold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspicionReport {
    /// Replica whose evidence just crossed the threshold
    pub newly_suspected: ReplicaId,
    /// All replicas currently suspected, ascending
    pub suspects: Vec<ReplicaId>,
    /// More than `f` suspects: the fault assumption may no longer hold
    pub exceeds_fault_tolerance: bool,
}

#[derive(Debug, Clone)]
pub struct SuspicionTracker {
    threshold: u32,
    faulty: usize,
    evidence: BTreeMap<ReplicaId, u32>,
    suspects: BTreeSet<ReplicaId>,
}

impl SuspicionTracker {
    pub fn new(threshold: u32, faulty: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            faulty,
            evidence: BTreeMap::new(),
            suspects: BTreeSet::new(),
        }
    }

    /// Count one piece of evidence against `replica`
    pub fn record(&mut self, replica: ReplicaId) -> Option<SuspicionReport> {
        let count = self.evidence.entry(replica).or_insert(0);
        *count += 1;
        if *count < self.threshold || !self.suspects.insert(replica) {
            return None;
        }

        let report = SuspicionReport {
            newly_suspected: replica,
            suspects: self.suspects.iter().copied().collect(),
            exceeds_fault_tolerance: self.suspects.len() > self.faulty,
        };
        warn!(
            replica,
            evidence = *count,
            suspects = report.suspects.len(),
            "Replica crossed suspicion threshold"
        );
        Some(report)
    }

    pub fn evidence(&self, replica: ReplicaId) -> u32 {
        self.evidence.get(&replica).copied().unwrap_or(0)
    }

    pub fn is_suspect(&self, replica: ReplicaId) -> bool {
        self.suspects.contains(&replica)
    }

    pub fn suspects(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.suspects.iter().copied()
    }
}

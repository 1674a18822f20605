//! Checkpoints
//!
//! The replica state is summarised by a BLAKE3 hash chain over every
//! executed `(sequence, command digest)`. Results are not part of it, since
//! each replica answers from its own storage node. Every `interval`
//! sequences replicas exchange that digest; `2f+1` matching votes, our own
//! included, make the checkpoint stable. A replica that fell behind may
//! instead adopt a checkpoint proven by a quorum of signed peer votes.
//! Stability only moves forward.

use crate::error::InvalidMessage;
use crate::messages::{CheckpointMessage, ReplicaId, SequenceNumber};
use std::collections::BTreeMap;
use tessera_core::crypto::Digest;

/// Running digest of executed state
#[derive(Debug, Clone)]
pub struct StateHasher {
    current: Digest,
}

impl Default for StateHasher {
    fn default() -> Self {
        Self {
            current: Digest::zero(),
        }
    }
}

impl StateHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend the chain with one executed command
    pub fn apply(&mut self, sequence: SequenceNumber, command: &Digest) -> Digest {
        self.current = Digest::compute_parts(&[
            self.current.as_bytes(),
            &sequence.to_be_bytes(),
            command.as_bytes(),
        ]);
        self.current
    }

    pub fn current(&self) -> Digest {
        self.current
    }

    /// Continue the chain from a digest reached elsewhere
    pub fn resume_from(&mut self, digest: Digest) {
        self.current = digest;
    }
}

/// A checkpoint certified by a quorum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StableCheckpoint {
    pub sequence: SequenceNumber,
    pub state_digest: Digest,
}

impl Default for StableCheckpoint {
    fn default() -> Self {
        Self {
            sequence: 0,
            state_digest: Digest::zero(),
        }
    }
}

/// Collects checkpoint votes and decides stability
#[derive(Debug)]
pub struct CheckpointTracker {
    local: ReplicaId,
    interval: u64,
    window: u64,
    quorum: usize,
    stable: StableCheckpoint,
    votes: BTreeMap<SequenceNumber, BTreeMap<ReplicaId, Digest>>,
}

impl CheckpointTracker {
    pub fn new(local: ReplicaId, interval: u64, window: u64, quorum: usize) -> Self {
        Self {
            local,
            interval,
            window,
            quorum,
            stable: StableCheckpoint::default(),
            votes: BTreeMap::new(),
        }
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn stable(&self) -> StableCheckpoint {
        self.stable
    }

    /// Low watermark: the stable checkpoint sequence
    pub fn low_watermark(&self) -> SequenceNumber {
        self.stable.sequence
    }

    /// Highest sequence number that may currently be assigned
    pub fn high_watermark(&self) -> SequenceNumber {
        self.stable.sequence + self.window
    }

    /// Whether `sequence` closes a checkpoint interval
    pub fn is_checkpoint(&self, sequence: SequenceNumber) -> bool {
        sequence > 0 && sequence % self.interval == 0
    }

    /// Structural checks that do not depend on previously recorded votes
    pub fn validate(&self, checkpoint: &CheckpointMessage) -> Result<(), InvalidMessage> {
        if !self.is_checkpoint(checkpoint.sequence) {
            return Err(InvalidMessage::UnalignedCheckpoint {
                sequence: checkpoint.sequence,
                interval: self.interval,
            });
        }
        if checkpoint.sequence <= self.stable.sequence {
            return Err(InvalidMessage::StaleCheckpoint {
                sequence: checkpoint.sequence,
                stable: self.stable.sequence,
            });
        }
        if checkpoint.sequence > self.high_watermark() {
            return Err(InvalidMessage::CheckpointAboveWindow {
                sequence: checkpoint.sequence,
                high: self.high_watermark(),
            });
        }
        Ok(())
    }

    /// Record a vote; returns the new stable checkpoint if this vote made one
    pub fn record(&mut self, checkpoint: &CheckpointMessage) -> Result<Option<StableCheckpoint>, InvalidMessage> {
        self.validate(checkpoint)?;

        let votes = self.votes.entry(checkpoint.sequence).or_default();
        match votes.get(&checkpoint.replica) {
            Some(existing) if *existing != checkpoint.state_digest => {
                return Err(InvalidMessage::ConflictingCheckpoint(checkpoint.sequence));
            }
            Some(_) => return Ok(None),
            None => {
                votes.insert(checkpoint.replica, checkpoint.state_digest);
            }
        }

        Ok(self.try_stabilize(checkpoint.sequence))
    }

    fn try_stabilize(&mut self, sequence: SequenceNumber) -> Option<StableCheckpoint> {
        let votes = self.votes.get(&sequence)?;
        // Only adopt what we have executed ourselves
        let own = *votes.get(&self.local)?;
        let matching = votes.values().filter(|d| **d == own).count();
        if matching < self.quorum {
            return None;
        }

        self.stable = StableCheckpoint {
            sequence,
            state_digest: own,
        };
        let retained = self.votes.split_off(&(sequence + 1));
        self.votes = retained;
        Some(self.stable)
    }

    /// Take over a checkpoint certified by peers
    ///
    /// Returns `false` (and changes nothing) unless it is above the current
    /// stable checkpoint.
    pub fn adopt(&mut self, checkpoint: StableCheckpoint) -> bool {
        if checkpoint.sequence <= self.stable.sequence || !self.is_checkpoint(checkpoint.sequence) {
            return false;
        }
        self.stable = checkpoint;
        let retained = self.votes.split_off(&(checkpoint.sequence + 1));
        self.votes = retained;
        true
    }

    /// Number of sequences with outstanding votes
    pub fn pending(&self) -> usize {
        self.votes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(replica: ReplicaId, sequence: SequenceNumber, digest: Digest) -> CheckpointMessage {
        CheckpointMessage {
            replica,
            sequence,
            state_digest: digest,
        }
    }

    #[test]
    fn test_state_hasher_is_order_sensitive() {
        let a = Digest::compute(b"a");
        let b = Digest::compute(b"b");

        let mut first = StateHasher::new();
        first.apply(1, &a);
        first.apply(2, &b);

        let mut second = StateHasher::new();
        second.apply(1, &b);
        second.apply(2, &a);

        assert_ne!(first.current(), second.current());
    }

    #[test]
    fn test_stable_after_quorum_including_own() {
        let mut tracker = CheckpointTracker::new(0, 4, 16, 3);
        let digest = Digest::compute(b"state");

        assert_eq!(tracker.record(&vote(1, 4, digest)), Ok(None));
        assert_eq!(tracker.record(&vote(2, 4, digest)), Ok(None));
        assert_eq!(tracker.record(&vote(3, 4, digest)), Ok(None));
        assert_eq!(tracker.stable().sequence, 0);

        let stable = tracker.record(&vote(0, 4, digest)).unwrap().unwrap();
        assert_eq!(stable.sequence, 4);
        assert_eq!(tracker.low_watermark(), 4);
        assert_eq!(tracker.high_watermark(), 20);
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_divergent_votes_do_not_stabilize() {
        let mut tracker = CheckpointTracker::new(0, 4, 16, 3);
        tracker.record(&vote(0, 4, Digest::compute(b"ours"))).unwrap();
        tracker.record(&vote(1, 4, Digest::compute(b"theirs"))).unwrap();
        tracker.record(&vote(2, 4, Digest::compute(b"theirs"))).unwrap();
        assert_eq!(tracker.record(&vote(3, 4, Digest::compute(b"theirs"))), Ok(None));
        assert_eq!(tracker.stable().sequence, 0);
    }

    #[test]
    fn test_invalid_checkpoints_rejected() {
        let mut tracker = CheckpointTracker::new(0, 4, 16, 3);
        let d = Digest::compute(b"state");

        assert!(matches!(
            tracker.record(&vote(1, 6, d)),
            Err(InvalidMessage::UnalignedCheckpoint { .. })
        ));
        assert!(matches!(
            tracker.record(&vote(1, 0, d)),
            Err(InvalidMessage::UnalignedCheckpoint { .. })
        ));
        assert!(matches!(
            tracker.record(&vote(1, 40, d)),
            Err(InvalidMessage::CheckpointAboveWindow { .. })
        ));

        tracker.record(&vote(1, 8, d)).unwrap();
        assert_eq!(
            tracker.record(&vote(1, 8, Digest::compute(b"other"))),
            Err(InvalidMessage::ConflictingCheckpoint(8))
        );

        for replica in 0..3 {
            tracker.record(&vote(replica, 8, d)).unwrap();
        }
        assert_eq!(tracker.stable().sequence, 8);
        assert!(matches!(
            tracker.record(&vote(3, 4, d)),
            Err(InvalidMessage::StaleCheckpoint { .. })
        ));
        assert_eq!(tracker.stable().sequence, 8);
    }

    #[test]
    fn test_adopt_moves_window_without_own_vote() {
        let mut tracker = CheckpointTracker::new(3, 4, 16, 3);
        let d = Digest::compute(b"state");
        tracker.record(&vote(1, 4, d)).unwrap();
        tracker.record(&vote(1, 12, d)).unwrap();

        let adopted = StableCheckpoint {
            sequence: 8,
            state_digest: d,
        };
        assert!(tracker.adopt(adopted));
        assert_eq!(tracker.stable(), adopted);
        assert_eq!(tracker.high_watermark(), 24);
        assert_eq!(tracker.pending(), 1);

        assert!(!tracker.adopt(StableCheckpoint {
            sequence: 4,
            state_digest: d,
        }));
        assert!(!tracker.adopt(StableCheckpoint {
            sequence: 10,
            state_digest: d,
        }));
        assert_eq!(tracker.stable().sequence, 8);
    }

    #[test]
    fn test_resumed_hasher_continues_chain() {
        let a = Digest::compute(b"a");
        let b = Digest::compute(b"b");

        let mut full = StateHasher::new();
        let midpoint = full.apply(1, &a);
        full.apply(2, &b);

        let mut resumed = StateHasher::new();
        resumed.resume_from(midpoint);
        resumed.apply(2, &b);
        assert_eq!(resumed.current(), full.current());
    }
}

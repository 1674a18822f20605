//! Ordering log
//!
//! One [`Slot`] per sequence number inside the watermark window. Votes are
//! kept per sender together with the digest they vouch for, so prepares and
//! commits that arrive before their pre-prepare are retained and counted
//! once it shows up. Signed commits are kept as well: they certify the slot
//! to replicas that missed it.

use crate::error::InvalidMessage;
use crate::messages::{PrePrepare, ProtocolMessage, ReplicaId, SequenceNumber, SignedMessage, ViewNumber};
use std::collections::BTreeMap;
use tessera_core::crypto::Digest;

/// Protocol state for one sequence number
#[derive(Debug, Clone, Default)]
pub struct Slot {
    pub view: ViewNumber,
    pub pre_prepare: Option<PrePrepare>,
    prepares: BTreeMap<ReplicaId, Digest>,
    commits: BTreeMap<ReplicaId, Digest>,
    certificate: BTreeMap<ReplicaId, SignedMessage>,
    pub commit_sent: bool,
    pub committed: bool,
    pub executed: bool,
}

impl Slot {
    fn new(view: ViewNumber) -> Self {
        Self {
            view,
            ..Default::default()
        }
    }

    /// Digest bound to this slot by the accepted pre-prepare
    pub fn digest(&self) -> Option<Digest> {
        self.pre_prepare.as_ref().map(|p| p.digest)
    }

    /// Record the pre-prepare, rejecting a second one with a different digest
    ///
    /// Returns `false` when an identical pre-prepare was already accepted.
    pub fn accept_pre_prepare(&mut self, pre_prepare: PrePrepare) -> Result<bool, InvalidMessage> {
        match &self.pre_prepare {
            Some(existing) if existing.digest != pre_prepare.digest => {
                Err(InvalidMessage::ConflictingPrePrepare(pre_prepare.sequence))
            }
            Some(_) => Ok(false),
            None => {
                self.view = pre_prepare.view;
                self.pre_prepare = Some(pre_prepare);
                Ok(true)
            }
        }
    }

    pub fn add_prepare(&mut self, sender: ReplicaId, digest: Digest, sequence: SequenceNumber) -> Result<bool, InvalidMessage> {
        add_vote(&mut self.prepares, sender, digest, sequence)
    }

    pub fn add_commit(&mut self, sender: ReplicaId, digest: Digest, sequence: SequenceNumber) -> Result<bool, InvalidMessage> {
        add_vote(&mut self.commits, sender, digest, sequence)
    }

    /// Keep a signed commit already counted by `add_commit`
    pub fn certify(&mut self, signed: SignedMessage) {
        self.certificate.entry(signed.sender).or_insert(signed);
    }

    /// Signed commits for the accepted pre-prepare
    pub fn commit_certificate(&self) -> Vec<SignedMessage> {
        let Some(pre_prepare) = &self.pre_prepare else {
            return Vec::new();
        };
        self.certificate
            .values()
            .filter(|signed| match &signed.message {
                ProtocolMessage::Commit(vote) => {
                    vote.view == pre_prepare.view
                        && vote.sequence == pre_prepare.sequence
                        && vote.digest == pre_prepare.digest
                }
                _ => false,
            })
            .cloned()
            .collect()
    }

    /// Mark the slot committed on the strength of a verified certificate
    ///
    /// A conflicting uncommitted proposal is replaced.
    pub fn install_committed(&mut self, pre_prepare: PrePrepare, certificate: Vec<SignedMessage>) {
        if self.digest() != Some(pre_prepare.digest) {
            self.certificate.clear();
        }
        self.view = pre_prepare.view;
        self.pre_prepare = Some(pre_prepare);
        for signed in certificate {
            self.certify(signed);
        }
        self.committed = true;
    }

    /// Prepares matching the accepted pre-prepare
    pub fn matching_prepares(&self) -> usize {
        count_matching(&self.prepares, self.digest())
    }

    /// Commits matching the accepted pre-prepare
    pub fn matching_commits(&self) -> usize {
        count_matching(&self.commits, self.digest())
    }

    /// Pre-prepare plus `2f` matching prepares
    pub fn is_prepared(&self, faulty: usize) -> bool {
        self.pre_prepare.is_some() && self.matching_prepares() >= 2 * faulty
    }

    /// Prepared plus `2f+1` matching commits
    pub fn is_committed_locally(&self, faulty: usize) -> bool {
        self.is_prepared(faulty) && self.matching_commits() >= 2 * faulty + 1
    }
}

fn add_vote(
    votes: &mut BTreeMap<ReplicaId, Digest>,
    sender: ReplicaId,
    digest: Digest,
    sequence: SequenceNumber,
) -> Result<bool, InvalidMessage> {
    match votes.get(&sender) {
        Some(existing) if *existing != digest => Err(InvalidMessage::ConflictingVote(sequence)),
        Some(_) => Ok(false),
        None => {
            votes.insert(sender, digest);
            Ok(true)
        }
    }
}

fn count_matching(votes: &BTreeMap<ReplicaId, Digest>, digest: Option<Digest>) -> usize {
    match digest {
        Some(digest) => votes.values().filter(|d| **d == digest).count(),
        None => 0,
    }
}

/// Slots keyed by sequence number
#[derive(Debug, Default)]
pub struct MessageLog {
    slots: BTreeMap<SequenceNumber, Slot>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, sequence: SequenceNumber) -> Option<&Slot> {
        self.slots.get(&sequence)
    }

    pub fn get_mut(&mut self, sequence: SequenceNumber) -> Option<&mut Slot> {
        self.slots.get_mut(&sequence)
    }

    /// Slot for `sequence`, created for `view` when absent
    pub fn slot(&mut self, sequence: SequenceNumber, view: ViewNumber) -> &mut Slot {
        self.slots.entry(sequence).or_insert_with(|| Slot::new(view))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Highest sequence number that has a slot
    pub fn highest(&self) -> Option<SequenceNumber> {
        self.slots.keys().next_back().copied()
    }

    /// Drop every slot at or below `sequence`
    pub fn truncate(&mut self, sequence: SequenceNumber) -> usize {
        let retained = self.slots.split_off(&(sequence + 1));
        let removed = self.slots.len();
        self.slots = retained;
        removed
    }

    /// Remove every slot that has not committed, returning them in order
    pub fn drain_uncommitted(&mut self) -> Vec<(SequenceNumber, Slot)> {
        let abandoned: Vec<SequenceNumber> = self
            .slots
            .iter()
            .filter(|(_, slot)| !slot.committed)
            .map(|(seq, _)| *seq)
            .collect();
        abandoned
            .into_iter()
            .filter_map(|seq| self.slots.remove(&seq).map(|slot| (seq, slot)))
            .collect()
    }
}

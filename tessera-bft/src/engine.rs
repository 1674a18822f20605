//! Agreement engine
//!
//! A sans-IO, PBFT-style normal case: the primary of the current view
//! assigns sequence numbers with a `PrePrepare`, backups answer with
//! `Prepare`, and a transaction commits with `2f+1` matching `Commit`s.
//! Committed transactions execute strictly in sequence order. Every
//! `checkpoint_interval` executions the replica votes on its state digest,
//! and a quorum-certified checkpoint garbage-collects the log.
//!
//! A replica that missed traffic notices it through a committed slot it
//! cannot execute yet, a checkpoint vote ahead of it, or a message above its
//! window. It then asks its peers for state: they answer with the signed
//! votes of their stable checkpoint and the commit certificates of every
//! slot executed since, which the replica verifies before adopting.
//!
//! The engine is driven by exactly one owner, which feeds it client
//! commands and authenticated-or-not protocol messages; all output goes
//! through [`BftEngineCallbacks`].

use crate::callbacks::BftEngineCallbacks;
use crate::checkpoint::{CheckpointTracker, StableCheckpoint, StateHasher};
use crate::error::InvalidMessage;
use crate::log::MessageLog;
use crate::messages::{
    CheckpointMessage, ClientCommand, CommittedSlot, PrePrepare, ProtocolMessage, ReplicaId,
    SequenceNumber, SignedMessage, StateTransfer, TransactionResult, ViewNumber, Vote,
};
use crate::replica_set::ReplicaSet;
use crate::suspicion::SuspicionTracker;
use ed25519_dalek::SigningKey;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tessera_core::config::ClusterConfig;
use tessera_core::crypto::Digest;
use tessera_core::error::{Result, TesseraError};
use tracing::{debug, info, trace, warn};

/// Per-replica engine settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub replica_id: ReplicaId,
    /// Executed sequences between checkpoints
    pub checkpoint_interval: u64,
    /// Sequence numbers accepted above the stable checkpoint
    pub log_window: u64,
    /// Evidence count at which a replica is reported as suspect
    pub suspicion_threshold: u32,
}

impl EngineConfig {
    pub fn new(replica_id: ReplicaId) -> Self {
        Self {
            replica_id,
            checkpoint_interval: 16,
            log_window: 256,
            suspicion_threshold: 3,
        }
    }

    pub fn from_cluster(replica_id: ReplicaId, config: &ClusterConfig) -> Self {
        Self {
            replica_id,
            checkpoint_interval: config.agreement.checkpoint_interval,
            log_window: config.agreement.log_window,
            suspicion_threshold: config.agreement.suspicion_threshold,
        }
    }

    pub fn with_checkpoint_interval(mut self, interval: u64) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn with_log_window(mut self, window: u64) -> Self {
        self.log_window = window;
        self
    }

    pub fn with_suspicion_threshold(mut self, threshold: u32) -> Self {
        self.suspicion_threshold = threshold;
        self
    }
}

/// Last result per client, for exactly-once execution
#[derive(Debug, Clone)]
struct CachedReply {
    request_id: u64,
    sequence: SequenceNumber,
    result: Vec<u8>,
}

/// Position of a sequence number relative to the watermarks
enum Window {
    /// At or below the stable checkpoint; already garbage-collected
    Below,
    Inside,
    Above,
}

pub struct BftEngine<C: BftEngineCallbacks> {
    config: EngineConfig,
    replicas: ReplicaSet,
    signing_key: SigningKey,
    callbacks: C,

    view: ViewNumber,
    /// Highest sequence number assigned while primary
    last_assigned: SequenceNumber,
    last_executed: SequenceNumber,

    log: MessageLog,
    checkpoints: CheckpointTracker,
    /// Signed checkpoint votes above the stable checkpoint
    checkpoint_votes: BTreeMap<SequenceNumber, Vec<SignedMessage>>,
    /// Quorum of signed votes for the stable checkpoint
    stable_proof: Vec<SignedMessage>,
    /// Last state request as (after, highest sequence seen)
    state_request: Option<(SequenceNumber, SequenceNumber)>,
    state: StateHasher,
    suspicion: SuspicionTracker,

    replies: HashMap<String, CachedReply>,
    /// Proposed but not yet executed, keyed by (client, request)
    in_flight: HashMap<(String, u64), SequenceNumber>,
    /// Requests waiting for room in the window
    backlog: VecDeque<ClientCommand>,
}

impl<C: BftEngineCallbacks> BftEngine<C> {
    pub fn new(
        config: EngineConfig,
        replicas: ReplicaSet,
        signing_key: SigningKey,
        callbacks: C,
    ) -> Result<Self> {
        let own = replicas.get(config.replica_id).ok_or_else(|| {
            TesseraError::Configuration(format!(
                "replica {} is not part of the replica set",
                config.replica_id
            ))
        })?;
        if own.verifying_key != signing_key.verifying_key() {
            return Err(TesseraError::Configuration(format!(
                "signing key does not match the registered key of replica {}",
                config.replica_id
            )));
        }
        if config.checkpoint_interval == 0 || config.log_window < config.checkpoint_interval {
            return Err(TesseraError::Configuration(
                "log_window must be at least one non-zero checkpoint_interval".to_string(),
            ));
        }

        let checkpoints = CheckpointTracker::new(
            config.replica_id,
            config.checkpoint_interval,
            config.log_window,
            replicas.quorum(),
        );
        let suspicion = SuspicionTracker::new(config.suspicion_threshold, replicas.faulty());

        Ok(Self {
            config,
            replicas,
            signing_key,
            callbacks,
            view: 0,
            last_assigned: 0,
            last_executed: 0,
            log: MessageLog::new(),
            checkpoints,
            checkpoint_votes: BTreeMap::new(),
            stable_proof: Vec::new(),
            state_request: None,
            state: StateHasher::new(),
            suspicion,
            replies: HashMap::new(),
            in_flight: HashMap::new(),
            backlog: VecDeque::new(),
        })
    }

    // ===== Accessors =====

    pub fn id(&self) -> ReplicaId {
        self.config.replica_id
    }

    pub fn view(&self) -> ViewNumber {
        self.view
    }

    pub fn primary(&self) -> ReplicaId {
        self.replicas.primary(self.view)
    }

    pub fn is_primary(&self) -> bool {
        self.primary() == self.id()
    }

    pub fn replicas(&self) -> &ReplicaSet {
        &self.replicas
    }

    pub fn last_executed(&self) -> SequenceNumber {
        self.last_executed
    }

    pub fn stable_checkpoint(&self) -> StableCheckpoint {
        self.checkpoints.stable()
    }

    /// Digest of the executed state so far
    pub fn state_digest(&self) -> Digest {
        self.state.current()
    }

    /// Number of sequence slots held in the log
    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    /// Commands waiting for room in the window
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn suspicion(&self) -> &SuspicionTracker {
        &self.suspicion
    }

    pub fn callbacks(&self) -> &C {
        &self.callbacks
    }

    pub fn callbacks_mut(&mut self) -> &mut C {
        &mut self.callbacks
    }

    // ===== Inputs =====

    /// Accept a command from a local client
    ///
    /// Already executed requests are answered from the reply cache. A backup
    /// forwards the command to the primary; the primary proposes it.
    pub fn handle_client_command(&mut self, command: ClientCommand) -> Result<()> {
        if self.answer_from_cache(&command) {
            return Ok(());
        }
        if self.is_primary() {
            return self.propose(command);
        }

        let primary = self.primary();
        debug!(
            replica = self.id(),
            primary,
            client = %command.client_id,
            request = command.request_id,
            "Forwarding request to primary"
        );
        let signed = self.sign(ProtocolMessage::Request(command))?;
        self.callbacks.forward_to_primary(primary, signed);
        Ok(())
    }

    /// Process a message received from another replica
    ///
    /// Invalid input is reported through the callbacks and never returned as
    /// an error; `Err` signals a local failure such as signing.
    pub fn handle_message(&mut self, signed: SignedMessage) -> Result<()> {
        if let Err(reason) = self.authenticate(&signed) {
            self.reject(&signed, reason);
            return Ok(());
        }

        match &signed.message {
            ProtocolMessage::Request(command) => self.on_request(&signed, command.clone()),
            ProtocolMessage::PrePrepare(pre_prepare) => self.on_pre_prepare(&signed, pre_prepare),
            ProtocolMessage::Prepare(vote) => self.on_prepare(&signed, vote),
            ProtocolMessage::Commit(vote) => self.on_commit(&signed, vote),
            ProtocolMessage::Checkpoint(checkpoint) => self.on_checkpoint(&signed, checkpoint),
            ProtocolMessage::StateRequest { after } => self.on_state_request(&signed, *after),
            ProtocolMessage::StateTransfer(transfer) => self.on_state_transfer(&signed, transfer),
        }
    }

    /// Move to `view`, abandoning every transaction that has not committed
    ///
    /// This is the hook for an external view-change protocol. The new
    /// primary assigns sequence numbers from `next_sequence`; passing
    /// `last_executed() + 1` lets it refill abandoned slots. The abandoned
    /// commands (and queued ones) are returned for resubmission.
    pub fn install_view(
        &mut self,
        view: ViewNumber,
        next_sequence: SequenceNumber,
    ) -> Result<Vec<ClientCommand>> {
        if view <= self.view {
            return Err(InvalidMessage::ViewRegression {
                current: self.view,
                requested: view,
            }
            .into());
        }
        if next_sequence <= self.last_executed {
            return Err(TesseraError::Configuration(format!(
                "next sequence {} is already executed (last executed {})",
                next_sequence, self.last_executed
            )));
        }

        let mut abandoned: Vec<ClientCommand> = self
            .log
            .drain_uncommitted()
            .into_iter()
            .filter_map(|(_, slot)| slot.pre_prepare.map(|p| p.command))
            .collect();
        abandoned.extend(self.backlog.drain(..));

        let log = &self.log;
        self.in_flight.retain(|_, sequence| log.get(*sequence).is_some());

        self.view = view;
        self.last_assigned = next_sequence - 1;

        info!(
            replica = self.id(),
            view,
            primary = self.primary(),
            abandoned = abandoned.len(),
            "Installed new view"
        );
        Ok(abandoned)
    }

    // ===== Proposal =====

    fn propose(&mut self, command: ClientCommand) -> Result<()> {
        let key = (command.client_id.clone(), command.request_id);
        let queued = self
            .backlog
            .iter()
            .any(|c| c.client_id == command.client_id && c.request_id == command.request_id);
        if self.in_flight.contains_key(&key) || queued {
            trace!(replica = self.id(), client = %command.client_id, "Request already in progress");
            return Ok(());
        }

        self.last_assigned = self.last_assigned.max(self.checkpoints.low_watermark());
        // Slots committed in an earlier view keep their sequence numbers
        while self
            .log
            .get(self.last_assigned + 1)
            .map_or(false, |slot| slot.committed)
        {
            self.last_assigned += 1;
        }

        if self.last_assigned >= self.checkpoints.high_watermark() {
            debug!(
                replica = self.id(),
                high = self.checkpoints.high_watermark(),
                "Window full, queueing request"
            );
            self.backlog.push_back(command);
            return Ok(());
        }

        self.last_assigned += 1;
        let sequence = self.last_assigned;
        let pre_prepare = PrePrepare {
            view: self.view,
            sequence,
            digest: command.digest(),
            command,
        };

        self.log
            .slot(sequence, self.view)
            .accept_pre_prepare(pre_prepare.clone())
            .map_err(|e| TesseraError::Internal(format!("proposal collided: {e}")))?;
        self.in_flight.insert(key, sequence);

        debug!(replica = self.id(), view = self.view, sequence, "Proposing request");
        let signed = self.sign(ProtocolMessage::PrePrepare(pre_prepare))?;
        self.callbacks.send_to_replicas(signed);
        self.advance(sequence)
    }

    // ===== Message handlers =====

    fn on_request(&mut self, signed: &SignedMessage, command: ClientCommand) -> Result<()> {
        if self.answer_from_cache(&command) {
            return Ok(());
        }
        if !self.is_primary() {
            debug!(
                replica = self.id(),
                sender = signed.sender,
                "Ignoring forwarded request, not the primary"
            );
            return Ok(());
        }
        self.propose(command)
    }

    fn on_pre_prepare(&mut self, signed: &SignedMessage, pre_prepare: &PrePrepare) -> Result<()> {
        if let Err(reason) = self.check_view(pre_prepare.view) {
            self.reject(signed, reason);
            return Ok(());
        }
        if signed.sender != self.primary() {
            let reason = InvalidMessage::NotPrimary {
                sender: signed.sender,
                view: pre_prepare.view,
            };
            self.reject(signed, reason);
            return Ok(());
        }
        match self.window(pre_prepare.sequence) {
            Window::Below => return Ok(()),
            Window::Inside => {}
            Window::Above => {
                let reason = self.outside_window(pre_prepare.sequence);
                self.reject(signed, reason);
                return Ok(());
            }
        }
        if pre_prepare.command.digest() != pre_prepare.digest {
            self.reject(signed, InvalidMessage::DigestMismatch);
            return Ok(());
        }

        let sequence = pre_prepare.sequence;
        let accepted = self
            .log
            .slot(sequence, pre_prepare.view)
            .accept_pre_prepare(pre_prepare.clone());
        match accepted {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(reason) => {
                self.reject(signed, reason);
                return Ok(());
            }
        }

        trace!(replica = self.id(), sequence, "Accepted pre-prepare");
        let vote = Vote {
            view: pre_prepare.view,
            sequence,
            digest: pre_prepare.digest,
        };
        let own = self.id();
        if let Err(e) = self.log.slot(sequence, vote.view).add_prepare(own, vote.digest, sequence) {
            warn!(replica = own, sequence, error = %e, "Own prepare conflicts with log");
            return Ok(());
        }
        let signed_vote = self.sign(ProtocolMessage::Prepare(vote))?;
        self.callbacks.send_to_replicas(signed_vote);
        self.advance(sequence)
    }

    fn on_prepare(&mut self, signed: &SignedMessage, vote: &Vote) -> Result<()> {
        if let Err(reason) = self.check_vote(vote) {
            self.reject(signed, reason);
            return Ok(());
        }
        if signed.sender == self.primary() {
            self.reject(signed, InvalidMessage::PrepareFromPrimary(signed.sender));
            return Ok(());
        }
        if vote.sequence <= self.checkpoints.low_watermark() {
            return Ok(());
        }

        match self
            .log
            .slot(vote.sequence, vote.view)
            .add_prepare(signed.sender, vote.digest, vote.sequence)
        {
            Ok(true) => self.advance(vote.sequence),
            Ok(false) => Ok(()),
            Err(reason) => {
                self.reject(signed, reason);
                Ok(())
            }
        }
    }

    fn on_commit(&mut self, signed: &SignedMessage, vote: &Vote) -> Result<()> {
        if let Err(reason) = self.check_vote(vote) {
            self.reject(signed, reason);
            return Ok(());
        }
        if vote.sequence <= self.checkpoints.low_watermark() {
            return Ok(());
        }

        let slot = self.log.slot(vote.sequence, vote.view);
        match slot.add_commit(signed.sender, vote.digest, vote.sequence) {
            Ok(true) => {
                slot.certify(signed.clone());
                self.advance(vote.sequence)
            }
            Ok(false) => Ok(()),
            Err(reason) => {
                self.reject(signed, reason);
                Ok(())
            }
        }
    }

    fn on_checkpoint(&mut self, signed: &SignedMessage, checkpoint: &CheckpointMessage) -> Result<()> {
        if checkpoint.replica != signed.sender {
            let reason = InvalidMessage::Malformed(format!(
                "checkpoint of replica {} sent by {}",
                checkpoint.replica, signed.sender
            ));
            self.reject_checkpoint(signed.sender, checkpoint, reason);
            return Ok(());
        }

        // Late vote for the checkpoint we already adopted
        let stable = self.checkpoints.stable();
        if checkpoint.sequence == stable.sequence && checkpoint.state_digest == stable.state_digest {
            return Ok(());
        }

        match self.checkpoints.record(checkpoint) {
            Ok(stable) => {
                self.keep_checkpoint_vote(signed.clone());
                match stable {
                    Some(stable) => self.on_stable(stable),
                    None if checkpoint.sequence > self.last_executed => {
                        self.request_state(checkpoint.sequence)
                    }
                    None => Ok(()),
                }
            }
            Err(reason) => {
                self.reject_checkpoint(signed.sender, checkpoint, reason);
                Ok(())
            }
        }
    }

    // ===== State transfer =====

    fn on_state_request(&mut self, signed: &SignedMessage, after: SequenceNumber) -> Result<()> {
        if after >= self.last_executed {
            return Ok(());
        }

        let stable = self.checkpoints.stable();
        let checkpoint = if after < stable.sequence {
            self.stable_proof.clone()
        } else {
            Vec::new()
        };
        let quorum = self.replicas.quorum();
        let slots: Vec<CommittedSlot> = (after.max(stable.sequence) + 1..=self.last_executed)
            .map_while(|sequence| {
                let slot = self.log.get(sequence)?;
                let pre_prepare = slot.pre_prepare.clone()?;
                let commits = slot.commit_certificate();
                (commits.len() >= quorum).then_some(CommittedSlot {
                    pre_prepare,
                    commits,
                })
            })
            .collect();
        if checkpoint.is_empty() && slots.is_empty() {
            return Ok(());
        }

        let proven = if checkpoint.is_empty() { after } else { stable.sequence };
        debug!(
            replica = self.id(),
            to = signed.sender,
            after,
            checkpoint = proven,
            slots = slots.len(),
            "Answering state request"
        );
        let transfer = self.sign(ProtocolMessage::StateTransfer(StateTransfer { checkpoint, slots }))?;
        self.callbacks.send_to_replica(signed.sender, transfer);
        Ok(())
    }

    fn on_state_transfer(&mut self, signed: &SignedMessage, transfer: &StateTransfer) -> Result<()> {
        if !transfer.checkpoint.is_empty() {
            let stable = match self.verify_checkpoint_proof(&transfer.checkpoint) {
                Ok(stable) => stable,
                Err(reason) => {
                    self.reject(signed, reason);
                    return Ok(());
                }
            };
            if stable.sequence > self.last_executed {
                self.adopt_checkpoint(stable, transfer.checkpoint.clone())?;
            }
        }

        let mut installed = 0;
        for committed in &transfer.slots {
            let sequence = committed.pre_prepare.sequence;
            let known = self.log.get(sequence).map_or(false, |slot| slot.committed);
            if sequence <= self.last_executed || known {
                continue;
            }
            if let Window::Above = self.window(sequence) {
                break;
            }
            if let Err(reason) = self.verify_certificate(committed) {
                self.reject(signed, reason);
                break;
            }
            self.install_committed(committed)?;
            installed += 1;
        }
        if installed > 0 {
            debug!(
                replica = self.id(),
                from = signed.sender,
                installed,
                "Installed certified slots"
            );
        }
        self.execute_ready()
    }

    /// Ask peers for what was executed after our position
    ///
    /// `seen` is the highest sequence number that revealed the gap. A request
    /// is repeated only once we moved or a higher sequence shows up.
    fn request_state(&mut self, seen: SequenceNumber) -> Result<()> {
        if seen <= self.last_executed {
            return Ok(());
        }
        if let Some((after, target)) = self.state_request {
            if after == self.last_executed && seen <= target {
                return Ok(());
            }
        }
        let after = self.last_executed;
        self.state_request = Some((after, seen));

        debug!(replica = self.id(), after, seen, "Requesting missing state from peers");
        let signed = self.sign(ProtocolMessage::StateRequest { after })?;
        self.callbacks.send_to_replicas(signed);
        Ok(())
    }

    fn adopt_checkpoint(&mut self, stable: StableCheckpoint, proof: Vec<SignedMessage>) -> Result<()> {
        if !self.checkpoints.adopt(stable) {
            return Ok(());
        }
        let skipped = stable.sequence - self.last_executed;
        self.state.resume_from(stable.state_digest);
        self.last_executed = stable.sequence;
        self.last_assigned = self.last_assigned.max(stable.sequence);
        let removed = self.log.truncate(stable.sequence);
        self.in_flight.retain(|_, sequence| *sequence > stable.sequence);
        self.checkpoint_votes = self.checkpoint_votes.split_off(&(stable.sequence + 1));
        self.stable_proof = proof;

        info!(
            replica = self.id(),
            sequence = stable.sequence,
            skipped,
            removed,
            "Adopted checkpoint from peers"
        );
        self.drain_backlog()
    }

    fn install_committed(&mut self, committed: &CommittedSlot) -> Result<()> {
        let pre_prepare = committed.pre_prepare.clone();
        let vote = Vote {
            view: pre_prepare.view,
            sequence: pre_prepare.sequence,
            digest: pre_prepare.digest,
        };
        let slot = self.log.slot(vote.sequence, vote.view);
        let send_commit = !slot.commit_sent;
        slot.install_committed(pre_prepare, committed.commits.clone());
        slot.commit_sent = true;

        // Peers still collecting commits for this slot may need ours
        if send_commit && vote.view == self.view {
            let own = self.id();
            let signed = self.sign(ProtocolMessage::Commit(vote))?;
            if let Some(slot) = self.log.get_mut(vote.sequence) {
                if let Ok(true) = slot.add_commit(own, vote.digest, vote.sequence) {
                    slot.certify(signed.clone());
                }
            }
            self.callbacks.send_to_replicas(signed);
        }
        Ok(())
    }

    // ===== Progress =====

    fn advance(&mut self, sequence: SequenceNumber) -> Result<()> {
        let faulty = self.replicas.faulty();
        let own = self.id();

        let Some(slot) = self.log.get_mut(sequence) else {
            return Ok(());
        };
        let commit = match slot.digest() {
            Some(digest) if !slot.commit_sent && slot.is_prepared(faulty) => {
                slot.commit_sent = true;
                Some(Vote {
                    view: slot.view,
                    sequence,
                    digest,
                })
            }
            _ => None,
        };
        if let Some(vote) = commit {
            trace!(replica = own, sequence, "Prepared");
            let signed = self.sign(ProtocolMessage::Commit(vote))?;
            if let Some(slot) = self.log.get_mut(sequence) {
                match slot.add_commit(own, vote.digest, sequence) {
                    Ok(_) => slot.certify(signed.clone()),
                    Err(e) => warn!(replica = own, sequence, error = %e, "Own commit conflicts with log"),
                }
            }
            self.callbacks.send_to_replicas(signed);
        }

        let Some(slot) = self.log.get_mut(sequence) else {
            return Ok(());
        };
        if slot.commit_sent && !slot.committed && slot.is_committed_locally(faulty) {
            slot.committed = true;
            debug!(replica = own, sequence, "Committed");
            self.execute_ready()?;
            // Committed but stuck behind a slot we never saw
            if sequence > self.last_executed {
                self.request_state(sequence)?;
            }
        }
        Ok(())
    }

    /// Execute every committed transaction that directly follows the last
    /// executed one
    fn execute_ready(&mut self) -> Result<()> {
        loop {
            let next = self.last_executed + 1;
            let command = match self.log.get(next) {
                Some(slot) if slot.committed && !slot.executed => match &slot.pre_prepare {
                    Some(pre_prepare) => pre_prepare.command.clone(),
                    None => break,
                },
                _ => break,
            };
            self.execute(next, command)?;
        }
        Ok(())
    }

    fn execute(&mut self, sequence: SequenceNumber, command: ClientCommand) -> Result<()> {
        let digest = command.digest();
        let cached = self
            .replies
            .get(&command.client_id)
            .filter(|cached| cached.request_id >= command.request_id)
            .map(|cached| (cached.request_id == command.request_id, cached.result.clone()));

        let (result, reply) = match cached {
            Some((same_request, result)) => {
                debug!(
                    replica = self.id(),
                    sequence,
                    client = %command.client_id,
                    request = command.request_id,
                    "Skipping re-execution of duplicate request"
                );
                if same_request {
                    (result, true)
                } else {
                    (Vec::new(), false)
                }
            }
            None => {
                let result = self.callbacks.execute_client_command(&command);
                self.replies.insert(
                    command.client_id.clone(),
                    CachedReply {
                        request_id: command.request_id,
                        sequence,
                        result: result.clone(),
                    },
                );
                (result, true)
            }
        };

        self.state.apply(sequence, &digest);
        self.last_executed = sequence;
        if let Some(slot) = self.log.get_mut(sequence) {
            slot.executed = true;
        }
        self.in_flight
            .remove(&(command.client_id.clone(), command.request_id));

        if reply {
            self.callbacks.reply_to_client(TransactionResult {
                client_id: command.client_id,
                request_id: command.request_id,
                replica: self.id(),
                sequence,
                result,
            });
        }

        if self.checkpoints.is_checkpoint(sequence) {
            self.emit_checkpoint(sequence)?;
        }
        Ok(())
    }

    fn emit_checkpoint(&mut self, sequence: SequenceNumber) -> Result<()> {
        let checkpoint = CheckpointMessage {
            replica: self.id(),
            sequence,
            state_digest: self.state.current(),
        };
        debug!(
            replica = self.id(),
            sequence,
            digest = %checkpoint.state_digest,
            "Taking checkpoint"
        );

        let signed = self.sign(ProtocolMessage::Checkpoint(checkpoint))?;
        let recorded = self.checkpoints.record(&checkpoint);
        if recorded.is_ok() {
            self.keep_checkpoint_vote(signed.clone());
        }
        self.callbacks.send_to_replicas(signed);

        match recorded {
            Ok(Some(stable)) => self.on_stable(stable),
            Ok(None) => Ok(()),
            Err(e) => {
                warn!(replica = self.id(), sequence, error = %e, "Own checkpoint rejected");
                Ok(())
            }
        }
    }

    fn keep_checkpoint_vote(&mut self, signed: SignedMessage) {
        let ProtocolMessage::Checkpoint(checkpoint) = &signed.message else {
            return;
        };
        let votes = self.checkpoint_votes.entry(checkpoint.sequence).or_default();
        if !votes.iter().any(|vote| vote.sender == signed.sender) {
            votes.push(signed);
        }
    }

    fn on_stable(&mut self, stable: StableCheckpoint) -> Result<()> {
        let removed = self.log.truncate(stable.sequence);
        self.stable_proof = self
            .checkpoint_votes
            .get(&stable.sequence)
            .map(|votes| {
                votes
                    .iter()
                    .filter(|vote| {
                        matches!(&vote.message, ProtocolMessage::Checkpoint(c) if c.state_digest == stable.state_digest)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        self.checkpoint_votes = self.checkpoint_votes.split_off(&(stable.sequence + 1));
        info!(
            replica = self.id(),
            sequence = stable.sequence,
            removed,
            "Checkpoint stable"
        );
        self.drain_backlog()
    }

    fn drain_backlog(&mut self) -> Result<()> {
        while self.is_primary() && self.last_assigned < self.checkpoints.high_watermark() {
            let Some(command) = self.backlog.pop_front() else {
                break;
            };
            self.propose(command)?;
        }
        Ok(())
    }

    // ===== Validation =====

    fn authenticate(&self, signed: &SignedMessage) -> std::result::Result<(), InvalidMessage> {
        if signed.sender == self.id() {
            return Err(InvalidMessage::Impersonation);
        }
        let key = self
            .replicas
            .verifying_key(signed.sender)
            .ok_or(InvalidMessage::UnknownSender(signed.sender))?;
        if !signed.verify(key) {
            return Err(InvalidMessage::BadSignature);
        }
        Ok(())
    }

    fn check_view(&self, view: ViewNumber) -> std::result::Result<(), InvalidMessage> {
        if view != self.view {
            return Err(InvalidMessage::WrongView {
                current: self.view,
                got: view,
            });
        }
        Ok(())
    }

    fn check_vote(&self, vote: &Vote) -> std::result::Result<(), InvalidMessage> {
        self.check_view(vote.view)?;
        if let Window::Above = self.window(vote.sequence) {
            return Err(self.outside_window(vote.sequence));
        }
        Ok(())
    }

    fn window(&self, sequence: SequenceNumber) -> Window {
        if sequence <= self.checkpoints.low_watermark() {
            Window::Below
        } else if sequence > self.checkpoints.high_watermark() {
            Window::Above
        } else {
            Window::Inside
        }
    }

    fn outside_window(&self, sequence: SequenceNumber) -> InvalidMessage {
        InvalidMessage::OutsideWindow {
            sequence,
            low: self.checkpoints.low_watermark(),
            high: self.checkpoints.high_watermark(),
        }
    }

    fn verify_checkpoint_proof(&self, votes: &[SignedMessage]) -> std::result::Result<StableCheckpoint, InvalidMessage> {
        let mut claimed: Option<StableCheckpoint> = None;
        let mut signers = BTreeSet::new();
        for vote in votes {
            let ProtocolMessage::Checkpoint(checkpoint) = &vote.message else {
                return Err(invalid_certificate(0, "checkpoint proof holds a non-checkpoint message"));
            };
            let sequence = checkpoint.sequence;
            let this = StableCheckpoint {
                sequence,
                state_digest: checkpoint.state_digest,
            };
            if *claimed.get_or_insert(this) != this {
                return Err(invalid_certificate(sequence, "checkpoint votes disagree"));
            }
            if checkpoint.replica != vote.sender {
                return Err(invalid_certificate(sequence, "checkpoint vote names another replica"));
            }
            let key = self
                .replicas
                .verifying_key(vote.sender)
                .ok_or_else(|| invalid_certificate(sequence, "checkpoint vote from a non-member"))?;
            if !vote.verify(key) {
                return Err(invalid_certificate(sequence, "checkpoint vote signature does not verify"));
            }
            signers.insert(vote.sender);
        }

        let stable = claimed.ok_or_else(|| invalid_certificate(0, "empty checkpoint proof"))?;
        if !self.checkpoints.is_checkpoint(stable.sequence) {
            return Err(invalid_certificate(stable.sequence, "checkpoint is not on an interval boundary"));
        }
        if signers.len() < self.replicas.quorum() {
            return Err(invalid_certificate(stable.sequence, "too few checkpoint votes"));
        }
        Ok(stable)
    }

    fn verify_certificate(&self, committed: &CommittedSlot) -> std::result::Result<(), InvalidMessage> {
        let pre_prepare = &committed.pre_prepare;
        let sequence = pre_prepare.sequence;
        if pre_prepare.command.digest() != pre_prepare.digest {
            return Err(InvalidMessage::DigestMismatch);
        }

        let mut signers = BTreeSet::new();
        for commit in &committed.commits {
            let ProtocolMessage::Commit(vote) = &commit.message else {
                return Err(invalid_certificate(sequence, "certificate holds a non-commit message"));
            };
            if vote.view != pre_prepare.view || vote.sequence != sequence || vote.digest != pre_prepare.digest {
                return Err(invalid_certificate(sequence, "commit does not match the certified proposal"));
            }
            let key = self
                .replicas
                .verifying_key(commit.sender)
                .ok_or_else(|| invalid_certificate(sequence, "commit from a non-member"))?;
            if !commit.verify(key) {
                return Err(invalid_certificate(sequence, "commit signature does not verify"));
            }
            signers.insert(commit.sender);
        }
        if signers.len() < self.replicas.quorum() {
            return Err(invalid_certificate(sequence, "too few commits"));
        }
        Ok(())
    }

    // ===== Reporting =====

    fn reject(&mut self, signed: &SignedMessage, reason: InvalidMessage) {
        debug!(
            replica = self.id(),
            sender = signed.sender,
            kind = signed.message.kind(),
            reason = %reason,
            "Rejected protocol message"
        );
        self.callbacks.invalid_message_received(signed, &reason);
        self.note_evidence(signed.sender, &reason);
        self.note_lag(&reason);
    }

    fn reject_checkpoint(&mut self, sender: ReplicaId, checkpoint: &CheckpointMessage, reason: InvalidMessage) {
        debug!(
            replica = self.id(),
            sender,
            sequence = checkpoint.sequence,
            reason = %reason,
            "Rejected checkpoint"
        );
        self.callbacks.invalid_checkpoint_message(checkpoint, &reason);
        self.note_evidence(sender, &reason);
        self.note_lag(&reason);
    }

    /// Traffic above our window means peers moved on without us
    fn note_lag(&mut self, reason: &InvalidMessage) {
        let seen = match reason {
            InvalidMessage::OutsideWindow { sequence, .. }
            | InvalidMessage::CheckpointAboveWindow { sequence, .. } => *sequence,
            _ => return,
        };
        if let Err(e) = self.request_state(seen) {
            warn!(replica = self.id(), error = %e, "Failed to request state");
        }
    }

    fn note_evidence(&mut self, sender: ReplicaId, reason: &InvalidMessage) {
        if !reason.is_evidence() || !self.replicas.contains(sender) {
            return;
        }
        if let Some(report) = self.suspicion.record(sender) {
            self.callbacks.replicas_might_be_malicious(&report);
        }
    }

    fn answer_from_cache(&mut self, command: &ClientCommand) -> bool {
        let Some(cached) = self.replies.get(&command.client_id) else {
            return false;
        };
        if cached.request_id < command.request_id {
            return false;
        }
        if cached.request_id > command.request_id {
            trace!(replica = self.id(), client = %command.client_id, "Ignoring stale request");
            return true;
        }

        let reply = TransactionResult {
            client_id: command.client_id.clone(),
            request_id: command.request_id,
            replica: self.id(),
            sequence: cached.sequence,
            result: cached.result.clone(),
        };
        debug!(
            replica = self.id(),
            client = %command.client_id,
            request = command.request_id,
            "Answering retransmission from reply cache"
        );
        self.callbacks.reply_to_client(reply);
        true
    }

    fn sign(&self, message: ProtocolMessage) -> Result<SignedMessage> {
        SignedMessage::sign(self.id(), message, &self.signing_key)
    }
}

fn invalid_certificate(sequence: SequenceNumber, reason: &'static str) -> InvalidMessage {
    InvalidMessage::InvalidCertificate { sequence, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica_set::ReplicaInfo;
    use crate::suspicion::SuspicionReport;
    use rand::rngs::OsRng;

    #[derive(Default)]
    struct Recorder {
        sent: Vec<SignedMessage>,
        forwarded: Vec<(ReplicaId, SignedMessage)>,
        unicast: Vec<(ReplicaId, SignedMessage)>,
        executed: Vec<ClientCommand>,
        replies: Vec<TransactionResult>,
        invalid: Vec<InvalidMessage>,
        invalid_checkpoints: Vec<InvalidMessage>,
        reports: Vec<SuspicionReport>,
    }

    impl BftEngineCallbacks for Recorder {
        fn invalid_message_received(&mut self, _message: &SignedMessage, reason: &InvalidMessage) {
            self.invalid.push(reason.clone());
        }

        fn replicas_might_be_malicious(&mut self, report: &SuspicionReport) {
            self.reports.push(report.clone());
        }

        fn send_to_replicas(&mut self, message: SignedMessage) {
            self.sent.push(message);
        }

        fn execute_client_command(&mut self, command: &ClientCommand) -> Vec<u8> {
            self.executed.push(command.clone());
            command.operation.clone()
        }

        fn invalid_checkpoint_message(&mut self, _checkpoint: &CheckpointMessage, reason: &InvalidMessage) {
            self.invalid_checkpoints.push(reason.clone());
        }

        fn reply_to_client(&mut self, result: TransactionResult) {
            self.replies.push(result);
        }

        fn forward_to_primary(&mut self, primary: ReplicaId, message: SignedMessage) {
            self.forwarded.push((primary, message));
        }

        fn send_to_replica(&mut self, to: ReplicaId, message: SignedMessage) {
            self.unicast.push((to, message));
        }
    }

    fn setup(replica_id: ReplicaId) -> (BftEngine<Recorder>, Vec<SigningKey>) {
        let keys: Vec<SigningKey> = (0..4).map(|_| SigningKey::generate(&mut OsRng)).collect();
        let infos = keys
            .iter()
            .enumerate()
            .map(|(i, k)| ReplicaInfo::new(i as u32, format!("r{i}"), k.verifying_key()))
            .collect();
        let replicas = ReplicaSet::new(infos, 1).unwrap();
        let engine = BftEngine::new(
            EngineConfig::new(replica_id).with_checkpoint_interval(2).with_log_window(4),
            replicas,
            keys[replica_id as usize].clone(),
            Recorder::default(),
        )
        .unwrap();
        (engine, keys)
    }

    fn signed(from: ReplicaId, keys: &[SigningKey], message: ProtocolMessage) -> SignedMessage {
        SignedMessage::sign(from, message, &keys[from as usize]).unwrap()
    }

    fn vote(sequence: SequenceNumber, command: &ClientCommand) -> Vote {
        Vote {
            view: 0,
            sequence,
            digest: command.digest(),
        }
    }

    #[test]
    fn test_wrong_signing_key_rejected() {
        let (engine, keys) = setup(0);
        let replicas = engine.replicas().clone();
        let result = BftEngine::new(
            EngineConfig::new(1),
            replicas,
            keys[2].clone(),
            Recorder::default(),
        );
        assert!(matches!(result, Err(TesseraError::Configuration(_))));
    }

    #[test]
    fn test_backup_forwards_to_primary() {
        let (mut engine, _) = setup(2);
        engine
            .handle_client_command(ClientCommand::new("c", 1, b"op".to_vec()))
            .unwrap();
        let (primary, message) = &engine.callbacks().forwarded[0];
        assert_eq!(*primary, 0);
        assert!(matches!(message.message, ProtocolMessage::Request(_)));
        assert!(engine.callbacks().sent.is_empty());
    }

    #[test]
    fn test_primary_commits_with_quorum() {
        let (mut engine, keys) = setup(0);
        let command = ClientCommand::new("c", 1, b"op".to_vec());
        engine.handle_client_command(command.clone()).unwrap();
        assert!(matches!(
            engine.callbacks().sent[0].message,
            ProtocolMessage::PrePrepare(_)
        ));

        engine
            .handle_message(signed(1, &keys, ProtocolMessage::Prepare(vote(1, &command))))
            .unwrap();
        engine
            .handle_message(signed(2, &keys, ProtocolMessage::Prepare(vote(1, &command))))
            .unwrap();
        assert!(matches!(
            engine.callbacks().sent[1].message,
            ProtocolMessage::Commit(_)
        ));
        assert!(engine.callbacks().executed.is_empty());

        engine
            .handle_message(signed(1, &keys, ProtocolMessage::Commit(vote(1, &command))))
            .unwrap();
        engine
            .handle_message(signed(3, &keys, ProtocolMessage::Commit(vote(1, &command))))
            .unwrap();
        assert_eq!(engine.callbacks().executed, vec![command]);
        assert_eq!(engine.last_executed(), 1);
        assert_eq!(engine.callbacks().replies[0].result, b"op".to_vec());
    }

    #[test]
    fn test_retransmission_answered_from_cache() {
        let (mut engine, keys) = setup(0);
        let command = ClientCommand::new("c", 1, b"op".to_vec());
        engine.handle_client_command(command.clone()).unwrap();
        for from in [1, 2] {
            engine
                .handle_message(signed(from, &keys, ProtocolMessage::Prepare(vote(1, &command))))
                .unwrap();
        }
        for from in [1, 2] {
            engine
                .handle_message(signed(from, &keys, ProtocolMessage::Commit(vote(1, &command))))
                .unwrap();
        }
        let sent_before = engine.callbacks().sent.len();

        engine.handle_client_command(command).unwrap();
        assert_eq!(engine.callbacks().executed.len(), 1);
        assert_eq!(engine.callbacks().replies.len(), 2);
        assert_eq!(engine.callbacks().sent.len(), sent_before);
    }

    #[test]
    fn test_pre_prepare_from_backup_is_evidence() {
        let (mut engine, keys) = setup(1);
        let command = ClientCommand::new("c", 1, b"op".to_vec());
        let forged = PrePrepare {
            view: 0,
            sequence: 1,
            digest: command.digest(),
            command,
        };
        engine
            .handle_message(signed(3, &keys, ProtocolMessage::PrePrepare(forged)))
            .unwrap();
        assert_eq!(
            engine.callbacks().invalid,
            vec![InvalidMessage::NotPrimary { sender: 3, view: 0 }]
        );
        assert_eq!(engine.suspicion().evidence(3), 1);
        assert_eq!(engine.log_len(), 0);
    }

    #[test]
    fn test_window_full_queues_requests() {
        let (mut engine, _) = setup(0);
        for request in 1..=6 {
            engine
                .handle_client_command(ClientCommand::new("c", request, vec![request as u8]))
                .unwrap();
        }
        assert_eq!(engine.log_len(), 4);
        assert_eq!(engine.backlog_len(), 2);
    }

    #[test]
    fn test_install_view_returns_uncommitted() {
        let (mut engine, _) = setup(1);

        engine.handle_client_command(ClientCommand::new("c", 1, b"x".to_vec())).unwrap();
        let abandoned = engine.install_view(1, 1).unwrap();
        assert!(abandoned.is_empty());
        assert!(engine.is_primary());

        engine
            .handle_client_command(ClientCommand::new("c", 2, b"y".to_vec()))
            .unwrap();
        assert_eq!(engine.log_len(), 1);

        let abandoned = engine.install_view(2, 1).unwrap();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].request_id, 2);
        assert_eq!(engine.log_len(), 0);

        assert!(engine.install_view(2, 1).is_err());
    }

    fn commit_as_primary(engine: &mut BftEngine<Recorder>, keys: &[SigningKey], sequence: SequenceNumber, command: &ClientCommand) {
        engine.handle_client_command(command.clone()).unwrap();
        for from in [1, 2] {
            engine
                .handle_message(signed(from, keys, ProtocolMessage::Prepare(vote(sequence, command))))
                .unwrap();
        }
        for from in [1, 2] {
            engine
                .handle_message(signed(from, keys, ProtocolMessage::Commit(vote(sequence, command))))
                .unwrap();
        }
    }

    #[test]
    fn test_state_request_answered_with_proof_and_certificates() {
        let (mut engine, keys) = setup(0);
        let commands: Vec<ClientCommand> = (1..=3)
            .map(|request| ClientCommand::new("c", request, vec![request as u8]))
            .collect();
        for (sequence, command) in (1..).zip(&commands) {
            commit_as_primary(&mut engine, &keys, sequence, command);
        }
        assert_eq!(engine.last_executed(), 3);

        let mut hasher = StateHasher::new();
        hasher.apply(1, &commands[0].digest());
        let at_two = hasher.apply(2, &commands[1].digest());
        for from in [1, 2] {
            let checkpoint = CheckpointMessage {
                replica: from,
                sequence: 2,
                state_digest: at_two,
            };
            engine
                .handle_message(signed(from, &keys, ProtocolMessage::Checkpoint(checkpoint)))
                .unwrap();
        }
        assert_eq!(engine.stable_checkpoint().sequence, 2);

        engine
            .handle_message(signed(3, &keys, ProtocolMessage::StateRequest { after: 0 }))
            .unwrap();
        let (to, message) = &engine.callbacks().unicast[0];
        assert_eq!(*to, 3);
        let ProtocolMessage::StateTransfer(transfer) = &message.message else {
            panic!("expected a state transfer, got {}", message.message.kind());
        };
        assert_eq!(transfer.checkpoint.len(), 3);
        assert_eq!(transfer.slots.len(), 1);
        assert_eq!(transfer.slots[0].pre_prepare.command, commands[2]);
        assert_eq!(transfer.slots[0].commits.len(), 3);

        // Nothing to tell a replica that is not behind
        engine
            .handle_message(signed(3, &keys, ProtocolMessage::StateRequest { after: 3 }))
            .unwrap();
        assert_eq!(engine.callbacks().unicast.len(), 1);
    }

    #[test]
    fn test_committed_slot_behind_gap_requests_state() {
        let (mut engine, keys) = setup(1);
        let command = ClientCommand::new("c", 2, b"late".to_vec());
        let pre_prepare = PrePrepare {
            view: 0,
            sequence: 2,
            digest: command.digest(),
            command: command.clone(),
        };
        engine
            .handle_message(signed(0, &keys, ProtocolMessage::PrePrepare(pre_prepare)))
            .unwrap();
        engine
            .handle_message(signed(2, &keys, ProtocolMessage::Prepare(vote(2, &command))))
            .unwrap();
        for from in [0, 2] {
            engine
                .handle_message(signed(from, &keys, ProtocolMessage::Commit(vote(2, &command))))
                .unwrap();
        }

        assert_eq!(engine.last_executed(), 0);
        let requests = engine
            .callbacks()
            .sent
            .iter()
            .filter(|m| matches!(m.message, ProtocolMessage::StateRequest { after: 0 }))
            .count();
        assert_eq!(requests, 1);
    }
}

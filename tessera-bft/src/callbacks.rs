//! Engine callback surface
//!
//! The engine performs no I/O of its own. Everything that leaves a replica,
//! and the execution of committed commands, goes through this trait.

use crate::error::InvalidMessage;
use crate::messages::{ClientCommand, CheckpointMessage, ReplicaId, SignedMessage, TransactionResult};
use crate::suspicion::SuspicionReport;

pub trait BftEngineCallbacks: Send {
    /// A message failed structural, authentication or protocol validation
    fn invalid_message_received(&mut self, message: &SignedMessage, reason: &InvalidMessage);

    /// Accumulated evidence suggests Byzantine replicas (advisory)
    fn replicas_might_be_malicious(&mut self, report: &SuspicionReport);

    /// Broadcast to every other replica; delivery is best effort
    fn send_to_replicas(&mut self, message: SignedMessage);

    /// Apply a committed command; called exactly once per command, in order
    fn execute_client_command(&mut self, command: &ClientCommand) -> Vec<u8>;

    /// A checkpoint vote failed validation
    fn invalid_checkpoint_message(&mut self, checkpoint: &CheckpointMessage, reason: &InvalidMessage);

    /// Relay the result of a committed (or already executed) command
    fn reply_to_client(&mut self, result: TransactionResult);

    /// Hand a client request to the current primary
    fn forward_to_primary(&mut self, primary: ReplicaId, message: SignedMessage);

    /// Unicast to one replica, used to answer state requests
    fn send_to_replica(&mut self, to: ReplicaId, message: SignedMessage);
}

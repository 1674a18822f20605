//! Message transport between replicas and clients
//!
//! The agreement engine only ever asks to deliver a message to a replica,
//! broadcast it, or answer a client. [`LocalNetwork`] implements that over
//! in-process channels and can drop traffic to simulate crashed replicas
//! and cut links.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tessera_bft::{ClientCommand, ReplicaId, SequenceNumber, SignedMessage, TransactionResult, ViewNumber};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::trace;

/// Everything a replica task consumes, in arrival order
#[derive(Debug)]
pub enum ReplicaInput {
    /// A command submitted by a client
    Command(ClientCommand),
    /// A protocol message from another replica
    Message(SignedMessage),
    /// Outcome of an external view change
    InstallView {
        view: ViewNumber,
        next_sequence: SequenceNumber,
    },
}

/// Outbound side of a replica or client
pub trait Transport: Send + Sync {
    /// Unicast a protocol message to one replica
    fn deliver(&self, to: ReplicaId, message: SignedMessage);

    /// Send a protocol message to every replica except `from`
    fn broadcast(&self, from: ReplicaId, message: SignedMessage);

    /// Hand a client command to a replica
    fn submit(&self, to: ReplicaId, command: ClientCommand);

    /// Route a transaction result back to the client that issued it
    fn reply(&self, result: TransactionResult);
}

/// In-process network with drop rules
#[derive(Default)]
pub struct LocalNetwork {
    replicas: RwLock<HashMap<ReplicaId, UnboundedSender<ReplicaInput>>>,
    clients: RwLock<HashMap<String, UnboundedSender<TransactionResult>>>,
    isolated: RwLock<HashSet<ReplicaId>>,
    cut: RwLock<HashSet<(ReplicaId, ReplicaId)>>,
    dropped: AtomicU64,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a replica, returning its inbox
    pub fn register_replica(&self, id: ReplicaId) -> UnboundedReceiver<ReplicaInput> {
        let (tx, rx) = unbounded_channel();
        self.replicas.write().insert(id, tx);
        rx
    }

    pub fn unregister_replica(&self, id: ReplicaId) {
        self.replicas.write().remove(&id);
    }

    /// Attach a client, returning the stream of its results
    pub fn register_client(&self, client_id: &str) -> UnboundedReceiver<TransactionResult> {
        let (tx, rx) = unbounded_channel();
        self.clients.write().insert(client_id.to_string(), tx);
        rx
    }

    /// Drop all traffic to and from `id`, as if the replica crashed
    pub fn isolate(&self, id: ReplicaId) {
        self.isolated.write().insert(id);
    }

    pub fn heal(&self, id: ReplicaId) {
        self.isolated.write().remove(&id);
    }

    pub fn is_isolated(&self, id: ReplicaId) -> bool {
        self.isolated.read().contains(&id)
    }

    /// Drop messages from `from` to `to` (one direction)
    pub fn cut_link(&self, from: ReplicaId, to: ReplicaId) {
        self.cut.write().insert((from, to));
    }

    pub fn restore_link(&self, from: ReplicaId, to: ReplicaId) {
        self.cut.write().remove(&(from, to));
    }

    /// Messages dropped by the rules so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn link_up(&self, from: ReplicaId, to: ReplicaId) -> bool {
        let isolated = self.isolated.read();
        !isolated.contains(&from) && !isolated.contains(&to) && !self.cut.read().contains(&(from, to))
    }

    /// Queue `input` for replica `to`, bypassing the drop rules
    pub fn push_input(&self, to: ReplicaId, input: ReplicaInput) {
        let sent = self
            .replicas
            .read()
            .get(&to)
            .map_or(false, |tx| tx.send(input).is_ok());
        if !sent {
            trace!(replica = to, "Replica inbox closed, dropping input");
        }
    }

    fn drop_one(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

impl Transport for LocalNetwork {
    fn deliver(&self, to: ReplicaId, message: SignedMessage) {
        if !self.link_up(message.sender, to) {
            trace!(from = message.sender, to, "Dropping message");
            self.drop_one();
            return;
        }
        self.push_input(to, ReplicaInput::Message(message));
    }

    fn broadcast(&self, from: ReplicaId, message: SignedMessage) {
        let targets: Vec<ReplicaId> = self
            .replicas
            .read()
            .keys()
            .copied()
            .filter(|id| *id != from)
            .collect();
        for to in targets {
            if self.link_up(from, to) {
                self.push_input(to, ReplicaInput::Message(message.clone()));
            } else {
                trace!(from, to, "Dropping broadcast");
                self.drop_one();
            }
        }
    }

    fn submit(&self, to: ReplicaId, command: ClientCommand) {
        if self.is_isolated(to) {
            self.drop_one();
            return;
        }
        self.push_input(to, ReplicaInput::Command(command));
    }

    fn reply(&self, result: TransactionResult) {
        if self.is_isolated(result.replica) {
            self.drop_one();
            return;
        }
        let clients = self.clients.read();
        match clients.get(&result.client_id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => trace!(client = %result.client_id, "Reply for unknown client"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_bft::{ProtocolMessage, SigningKey, Vote};
    use tessera_core::Digest;

    fn message(sender: ReplicaId) -> SignedMessage {
        let key = SigningKey::from_bytes(&[sender as u8 + 1; 32]);
        let vote = Vote {
            view: 0,
            sequence: 1,
            digest: Digest::compute(b"x"),
        };
        SignedMessage::sign(sender, ProtocolMessage::Prepare(vote), &key).unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let network = LocalNetwork::new();
        let mut inboxes: Vec<_> = (0..3).map(|id| network.register_replica(id)).collect();

        network.broadcast(0, message(0));
        assert!(inboxes[0].try_recv().is_err());
        assert!(matches!(inboxes[1].try_recv(), Ok(ReplicaInput::Message(_))));
        assert!(matches!(inboxes[2].try_recv(), Ok(ReplicaInput::Message(_))));
    }

    #[tokio::test]
    async fn test_isolated_replica_neither_sends_nor_receives() {
        let network = LocalNetwork::new();
        let mut inboxes: Vec<_> = (0..3).map(|id| network.register_replica(id)).collect();
        network.isolate(2);

        network.broadcast(0, message(0));
        network.broadcast(2, message(2));
        assert!(inboxes[1].try_recv().is_ok());
        assert!(inboxes[1].try_recv().is_err());
        assert!(inboxes[2].try_recv().is_err());
        assert_eq!(network.dropped(), 3);

        network.heal(2);
        network.deliver(2, message(1));
        assert!(inboxes[2].try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_cut_link_is_directional() {
        let network = LocalNetwork::new();
        let mut inboxes: Vec<_> = (0..2).map(|id| network.register_replica(id)).collect();
        network.cut_link(0, 1);

        network.deliver(1, message(0));
        network.deliver(0, message(1));
        assert!(inboxes[1].try_recv().is_err());
        assert!(inboxes[0].try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_reply_reaches_registered_client() {
        let network = LocalNetwork::new();
        let mut results = network.register_client("c1");
        network.reply(TransactionResult {
            client_id: "c1".into(),
            request_id: 1,
            replica: 0,
            sequence: 1,
            result: b"ok".to_vec(),
        });
        assert_eq!(results.recv().await.unwrap().result, b"ok".to_vec());
    }
}

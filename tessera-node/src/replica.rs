//! Replica runtime
//!
//! One tokio task per replica owns its [`BftEngine`]. Client commands,
//! protocol messages and view installations all arrive through a single
//! inbox, so engine state is only ever touched by that task.

use crate::application::StorageApplication;
use crate::transport::{ReplicaInput, Transport};
use parking_lot::Mutex;
use std::sync::Arc;
use tessera_bft::{
    BftEngine, BftEngineCallbacks, CheckpointMessage, ClientCommand, EngineConfig, InvalidMessage,
    ReplicaId, ReplicaSet, SequenceNumber, SignedMessage, SigningKey, SuspicionReport,
    TransactionResult, ViewNumber,
};
use tessera_core::error::Result;
use tessera_storage::FragmentStore;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Observable replica state, refreshed after every input
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaStats {
    pub view: ViewNumber,
    pub last_executed: SequenceNumber,
    pub stable_checkpoint: SequenceNumber,
    /// Commands handed to the storage application
    pub executed: u64,
    pub invalid_messages: u64,
    pub invalid_checkpoints: u64,
    pub suspects: Vec<ReplicaId>,
}

/// Engine callbacks wired to a transport and a storage application
pub struct ReplicaCallbacks {
    id: ReplicaId,
    transport: Arc<dyn Transport>,
    application: StorageApplication,
    stats: Arc<Mutex<ReplicaStats>>,
}

impl ReplicaCallbacks {
    pub fn new(id: ReplicaId, transport: Arc<dyn Transport>, application: StorageApplication) -> Self {
        Self {
            id,
            transport,
            application,
            stats: Arc::new(Mutex::new(ReplicaStats::default())),
        }
    }

    pub fn application(&self) -> &StorageApplication {
        &self.application
    }
}

impl BftEngineCallbacks for ReplicaCallbacks {
    fn invalid_message_received(&mut self, message: &SignedMessage, reason: &InvalidMessage) {
        warn!(
            replica = self.id,
            sender = message.sender,
            kind = message.message.kind(),
            reason = %reason,
            "Invalid message received"
        );
        self.stats.lock().invalid_messages += 1;
    }

    fn replicas_might_be_malicious(&mut self, report: &SuspicionReport) {
        if report.exceeds_fault_tolerance {
            error!(
                replica = self.id,
                suspects = ?report.suspects,
                "More replicas suspected than the cluster tolerates"
            );
        } else {
            warn!(
                replica = self.id,
                suspect = report.newly_suspected,
                "Replica might be malicious"
            );
        }
        self.stats.lock().suspects = report.suspects.clone();
    }

    fn send_to_replicas(&mut self, message: SignedMessage) {
        self.transport.broadcast(self.id, message);
    }

    fn execute_client_command(&mut self, command: &ClientCommand) -> Vec<u8> {
        debug!(
            replica = self.id,
            client = %command.client_id,
            request = command.request_id,
            "Executing committed command"
        );
        self.stats.lock().executed += 1;
        self.application.execute(&command.operation)
    }

    fn invalid_checkpoint_message(&mut self, checkpoint: &CheckpointMessage, reason: &InvalidMessage) {
        warn!(
            replica = self.id,
            sender = checkpoint.replica,
            sequence = checkpoint.sequence,
            reason = %reason,
            "Invalid checkpoint message"
        );
        self.stats.lock().invalid_checkpoints += 1;
    }

    fn reply_to_client(&mut self, result: TransactionResult) {
        self.transport.reply(result);
    }

    fn forward_to_primary(&mut self, primary: ReplicaId, message: SignedMessage) {
        self.transport.deliver(primary, message);
    }

    fn send_to_replica(&mut self, to: ReplicaId, message: SignedMessage) {
        self.transport.deliver(to, message);
    }
}

/// A replica ready to be spawned
pub struct Replica {
    engine: BftEngine<ReplicaCallbacks>,
    inbox: UnboundedReceiver<ReplicaInput>,
    stats: Arc<Mutex<ReplicaStats>>,
}

impl Replica {
    pub fn new(
        config: EngineConfig,
        replicas: ReplicaSet,
        signing_key: SigningKey,
        transport: Arc<dyn Transport>,
        application: StorageApplication,
        inbox: UnboundedReceiver<ReplicaInput>,
    ) -> Result<Self> {
        let callbacks = ReplicaCallbacks::new(config.replica_id, transport, application);
        let stats = callbacks.stats.clone();
        let engine = BftEngine::new(config, replicas, signing_key, callbacks)?;
        Ok(Self {
            engine,
            inbox,
            stats,
        })
    }

    pub fn id(&self) -> ReplicaId {
        self.engine.id()
    }

    /// Run the replica on its own task
    pub fn spawn(self) -> ReplicaHandle {
        let id = self.engine.id();
        let node_id = self.engine.callbacks().application().node_id().to_string();
        let store = self.engine.callbacks().application().store().clone();
        let stats = self.stats.clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(shutdown_rx));

        ReplicaHandle {
            id,
            node_id,
            store,
            stats,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        info!(replica = self.engine.id(), "Replica started");
        loop {
            let input = tokio::select! {
                _ = &mut shutdown => break,
                input = self.inbox.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
            };
            if let Err(e) = self.handle(input) {
                error!(replica = self.engine.id(), error = %e, "Replica failed to process input");
            }
            self.publish_stats();
        }
        info!(replica = self.engine.id(), "Replica stopped");
    }

    fn handle(&mut self, input: ReplicaInput) -> Result<()> {
        match input {
            ReplicaInput::Command(command) => self.engine.handle_client_command(command),
            ReplicaInput::Message(message) => self.engine.handle_message(message),
            ReplicaInput::InstallView {
                view,
                next_sequence,
            } => {
                let abandoned = self.engine.install_view(view, next_sequence)?;
                for command in abandoned {
                    self.engine.handle_client_command(command)?;
                }
                Ok(())
            }
        }
    }

    fn publish_stats(&self) {
        let mut stats = self.stats.lock();
        stats.view = self.engine.view();
        stats.last_executed = self.engine.last_executed();
        stats.stable_checkpoint = self.engine.stable_checkpoint().sequence;
    }
}

/// Control handle of a running replica
pub struct ReplicaHandle {
    id: ReplicaId,
    node_id: String,
    store: Arc<dyn FragmentStore>,
    stats: Arc<Mutex<ReplicaStats>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ReplicaHandle {
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// Storage node served by this replica
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn store(&self) -> &Arc<dyn FragmentStore> {
        &self.store
    }

    pub fn stats(&self) -> ReplicaStats {
        self.stats.lock().clone()
    }

    /// Stop the task, wait for it to finish and flush the store
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(replica = self.id, error = %e, "Replica task panicked");
            }
        }
        if let Err(e) = self.store.flush() {
            warn!(replica = self.id, error = %e, "Failed to flush fragment store");
        }
    }
}

//! Tessera metadata service
//!
//! Keeps the directory (path to distribution set mapping) and persists it
//! through the same secret-sharing and distribution machinery as data
//! fragments, under the reserved fragment id `"index"`.
//!
//! The service is a two-state machine: every operation except
//! [`MetadataService::connect`] fails with `NotConnected` until the index
//! has been loaded.

pub mod directory;
pub mod error;

pub use directory::DirectoryDatabase;
pub use error::FormatError;

use std::collections::BTreeMap;
use std::sync::Arc;
use tessera_core::codec::SecretSharing;
use tessera_core::error::{Result, TesseraError};
use tessera_core::fragment::{DistributionSet, INDEX_FRAGMENT_ID};
use tessera_storage::Distributor;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Attributes reported by [`MetadataService::stat`]
pub type Attributes = BTreeMap<String, String>;

/// When newly allocated distribution sets are persisted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncMode {
    /// Write the index on every allocation
    #[default]
    Eager,
    /// Mark the directory dirty; write on `synchronize` or `disconnect`
    Deferred,
}

struct Directory {
    database: DirectoryDatabase,
    dirty: bool,
}

enum ServiceState {
    Disconnected,
    Connected(Directory),
}

/// Directory service backed by secret-shared index fragments
pub struct MetadataService {
    distributor: Arc<Distributor>,
    codec: SecretSharing,
    sync_mode: SyncMode,
    state: Mutex<ServiceState>,
}

impl MetadataService {
    pub fn new(distributor: Arc<Distributor>, codec: SecretSharing) -> Self {
        Self {
            distributor,
            codec,
            sync_mode: SyncMode::default(),
            state: Mutex::new(ServiceState::Disconnected),
        }
    }

    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    pub fn distributor(&self) -> &Arc<Distributor> {
        &self.distributor
    }

    pub fn codec(&self) -> &SecretSharing {
        &self.codec
    }

    pub async fn is_connected(&self) -> bool {
        matches!(*self.state.lock().await, ServiceState::Connected(_))
    }

    /// Connect storage servers and load the directory
    ///
    /// A missing or unreadable index yields an empty directory, which is
    /// persisted right away. Returns the number of reachable storage nodes.
    pub async fn connect(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let reachable = self.distributor.connect_servers().await;

        let (database, fresh) = match self.load_index().await {
            Ok(database) => {
                info!(paths = database.len(), "Loaded directory index");
                (database, false)
            }
            Err(e) if e.is_reconstruction_failure() || matches!(e, TesseraError::Serialization(_)) => {
                warn!(error = %e, "Directory index unavailable, starting empty");
                (DirectoryDatabase::new(), true)
            }
            Err(e) => return Err(e),
        };

        if fresh {
            self.write_index(&database).await?;
        }
        *state = ServiceState::Connected(Directory {
            database,
            dirty: false,
        });
        Ok(reachable)
    }

    /// The distribution set for `path`, allocating one on first use
    pub async fn get_distribution_for(&self, path: &str) -> Result<DistributionSet> {
        let mut state = self.state.lock().await;
        let directory = connected(&mut state)?;

        if let Some(set) = directory.database.get(path) {
            return Ok(set.clone());
        }

        let set = DistributionSet::with_random_ids(self.distributor.servers().online_node_ids())?;
        directory.database.insert(path, set.clone());
        debug!(path, fragments = set.len(), "Allocated distribution set");

        match self.sync_mode {
            SyncMode::Eager => {
                if let Err(e) = self.write_index(&directory.database).await {
                    directory.database.remove(path);
                    return Err(e);
                }
            }
            SyncMode::Deferred => directory.dirty = true,
        }
        Ok(set)
    }

    /// The distribution set recorded for `path`, never allocating
    pub async fn lookup(&self, path: &str) -> Result<Option<DistributionSet>> {
        let mut state = self.state.lock().await;
        let directory = connected(&mut state)?;
        Ok(directory.database.get(path).cloned())
    }

    /// Persist the directory
    ///
    /// The index is written in full; concurrent writers from other processes
    /// are not merged and the last write wins.
    pub async fn synchronize(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let directory = connected(&mut state)?;
        self.write_index(&directory.database).await?;
        directory.dirty = false;
        Ok(())
    }

    /// Forget `path`, then persist the directory
    pub async fn delete(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let directory = connected(&mut state)?;
        if directory.database.remove(path).is_some() {
            debug!(path, "Removed directory entry");
        }
        self.write_index(&directory.database).await?;
        directory.dirty = false;
        Ok(())
    }

    /// Persist the directory one last time and drop it
    pub async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let directory = connected(&mut state)?;
        self.write_index(&directory.database).await?;
        *state = ServiceState::Disconnected;
        info!("Metadata service disconnected");
        Ok(())
    }

    /// Attributes of `path`, or `None` when it is not in the directory
    pub async fn stat(&self, path: &str) -> Result<Option<Attributes>> {
        let mut state = self.state.lock().await;
        let directory = connected(&mut state)?;
        Ok(directory.database.contains(path).then(Attributes::new))
    }

    /// Sorted paths, optionally restricted to those starting with `prefix`
    pub async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let mut state = self.state.lock().await;
        let directory = connected(&mut state)?;
        Ok(directory.database.list(prefix))
    }

    /// Whether allocations are waiting to be persisted
    pub async fn is_dirty(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(connected(&mut state)?.dirty)
    }

    fn index_set(&self) -> Result<DistributionSet> {
        DistributionSet::with_fragment_id(
            INDEX_FRAGMENT_ID,
            self.distributor.servers().online_node_ids(),
        )
    }

    async fn load_index(&self) -> Result<DirectoryDatabase> {
        let mut set = self.index_set()?;
        let data = self.distributor.get_fragment_set(&mut set, &self.codec).await?;
        let servers = self.distributor.servers();
        Ok(DirectoryDatabase::deserialize(&data, |node| {
            servers.contains(node)
        })?)
    }

    async fn write_index(&self, database: &DirectoryDatabase) -> Result<()> {
        let mut set = self.index_set()?;
        let data = database.serialize();
        self.codec.encode_into(&data, &mut set)?;
        let report = self.distributor.put_fragment_set(&set).await?;
        debug!(
            paths = database.len(),
            bytes = data.len(),
            written = report.success_count(),
            "Directory index written"
        );
        Ok(())
    }
}

fn connected(state: &mut ServiceState) -> Result<&mut Directory> {
    match state {
        ServiceState::Connected(directory) => Ok(directory),
        ServiceState::Disconnected => Err(TesseraError::NotConnected),
    }
}

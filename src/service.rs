//! The serving component: owns the block store and the streaming and
//! pagination registries for its whole lifetime.
//!
//! New blocks go through [`Service::append_block`], which stores them
//! durably before announcing them to streaming subscribers, so a subscriber
//! following a forward link right after a notification never meets a
//! dangling reference.

use crate::blockchain::{BlockId, Roster, SkipBlock};
use crate::cancel::CancelHandle;
use crate::config::Config;
use crate::crypto::{CollectiveSigner, SignatureVerifier, ThresholdVerifier};
use crate::error::ChainError;
use crate::pagination::{PageSession, PaginateRequest, PaginationManager};
use crate::persistence::{Database, InMemoryPersistence, Persistence};
use crate::store::{BlockLookup, BlockStore};
use crate::streaming::{Listener, StreamingManager};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub struct Service {
    config: Config,
    store: Arc<BlockStore>,
    streaming: Arc<StreamingManager>,
    pagination: PaginationManager,
    signer: Arc<dyn CollectiveSigner>,
    verifier: Arc<dyn SignatureVerifier>,
    shutdown: broadcast::Sender<()>,
    /// Streaming watchers; `None` once the service is closed.
    watchers: Mutex<Option<JoinSet<()>>>,
}

impl Service {
    /// Builds a service from `config`, opening the SQLite store when a
    /// database path is configured.
    pub fn new(config: Config, signer: Arc<dyn CollectiveSigner>) -> Result<Self, ChainError> {
        config.validate()?;

        let persistence: Box<dyn Persistence> = if config.database.path.is_empty() {
            Box::new(InMemoryPersistence::new())
        } else {
            Box::new(Database::open(&config.database.path)?)
        };
        let verifier: Arc<dyn SignatureVerifier> = Arc::new(ThresholdVerifier);
        let store = Arc::new(BlockStore::open(persistence)?.with_verifier(verifier.clone()));
        Ok(Self::with_store(config, store, signer, verifier))
    }

    /// `verifier` backs [`Service::verify_block`]; appends are checked by the
    /// verifier the store was built with.
    pub fn with_store(
        config: Config,
        store: Arc<BlockStore>,
        signer: Arc<dyn CollectiveSigner>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        let streaming = Arc::new(StreamingManager::new(
            config.streaming.channel_capacity,
            config.streaming.send_timeout(),
        ));
        let lookup: Arc<dyn BlockLookup> = store.clone();
        let pagination = PaginationManager::new(lookup, config.pagination.channel_capacity);
        let (shutdown, _) = broadcast::channel(1);

        Self {
            config,
            store,
            streaming,
            pagination,
            signer,
            verifier,
            shutdown,
            watchers: Mutex::new(Some(JoinSet::new())),
        }
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    pub fn streaming(&self) -> &StreamingManager {
        &self.streaming
    }

    pub fn pagination(&self) -> &PaginationManager {
        &self.pagination
    }

    pub fn is_closed(&self) -> bool {
        self.watchers.lock().is_none()
    }

    fn ensure_open(&self) -> Result<(), ChainError> {
        if self.is_closed() {
            return Err(ChainError::ServiceClosed);
        }
        Ok(())
    }

    pub fn get_block(&self, id: &BlockId) -> Option<SkipBlock> {
        self.store.get(id)
    }

    /// Starts a new root skipchain with the configured height parameters.
    pub fn create_chain(&self, roster: Roster, data: Vec<u8>) -> Result<SkipBlock, ChainError> {
        self.ensure_open()?;
        self.store.create_genesis(
            roster,
            self.config.chain.base_height,
            self.config.chain.maximum_height,
            data,
            None,
        )
    }

    /// Starts a skipchain hanging off `parent`.
    pub fn create_child_chain(&self, parent: &BlockId, roster: Roster, data: Vec<u8>) -> Result<SkipBlock, ChainError> {
        self.ensure_open()?;
        self.store.create_genesis(
            roster,
            self.config.chain.base_height,
            self.config.chain.maximum_height,
            data,
            Some(*parent),
        )
    }

    /// Appends a block to `chain_id` and, once it is stored, pushes it to the
    /// chain's streaming subscribers. A block whose forward links fail
    /// verification is neither stored nor announced.
    pub async fn append_block(&self, chain_id: &BlockId, roster: Roster, data: Vec<u8>) -> Result<SkipBlock, ChainError> {
        self.ensure_open()?;
        let block = self.store.append(chain_id, roster, data, self.signer.as_ref())?;
        self.streaming.notify(chain_id, &block).await;
        Ok(block)
    }

    /// Verifies the stored block `id` and its link trail back to genesis.
    pub fn verify_block(&self, id: &BlockId) -> Result<(), ChainError> {
        let block = self
            .store
            .get(id)
            .ok_or_else(|| ChainError::BlockNotFound(hex::encode(id)))?;
        let result = self.store.verifier(self.verifier.as_ref()).verify_links(&block);
        if let Err(e) = &result {
            warn!(block = %hex::encode(id), "Block failed verification: {}", e);
        }
        result
    }

    pub fn get_responsible(&self, block: &SkipBlock) -> Result<SkipBlock, ChainError> {
        self.store.verifier(self.verifier.as_ref()).get_responsible(block)
    }

    /// Streams every block appended to `chain_id` from now on. The stream
    /// ends when the returned handle is cancelled or dropped, or when the
    /// service closes. Must be called from within a tokio runtime.
    pub fn stream_blocks(&self, chain_id: BlockId) -> Result<(Listener, CancelHandle), ChainError> {
        let mut watchers = self.watchers.lock();
        let Some(set) = watchers.as_mut() else {
            return Err(ChainError::ServiceClosed);
        };
        while set.try_join_next().is_some() {}

        let listener = self.streaming.new_listener(chain_id);
        let listener_id = listener.id();
        let (cancel, mut signal) = CancelHandle::new();
        let mut shutdown = self.shutdown.subscribe();
        let streaming = self.streaming.clone();

        set.spawn(async move {
            tokio::select! {
                _ = signal.cancelled() => debug!(listener = listener_id, "Streaming client left"),
                _ = shutdown.recv() => debug!(listener = listener_id, "Streaming stopped by shutdown"),
            }
            streaming.stop_listener(&chain_id, listener_id);
        });

        Ok((listener, cancel))
    }

    /// Serves a pagination request; see [`PaginationManager::paginate`].
    pub fn paginate_blocks(&self, request: PaginateRequest) -> Result<PageSession, ChainError> {
        self.ensure_open()?;
        Ok(self.pagination.paginate(request))
    }

    /// Ends every stream and pagination session and waits for the streaming
    /// watchers to finish. Closing twice is a no-op.
    pub async fn close(&self) {
        let watchers = self.watchers.lock().take();
        let Some(mut watchers) = watchers else {
            return;
        };

        let _ = self.shutdown.send(());
        self.streaming.stop_all();
        self.pagination.cancel_all();
        while watchers.join_next().await.is_some() {}
        info!("Skipchain service closed");
    }
}

//! Live fan-out of newly appended blocks.
//!
//! The [`StreamingManager`] keeps, per skipchain, the set of subscribers that
//! want to see every new block. Delivery is live-only and at-most-once: a
//! subscriber only receives blocks notified while it is registered.
//!
//! Each subscriber owns a bounded queue. `notify` waits for room in a queue
//! for at most the configured send timeout; a subscriber whose queue stays
//! full is evicted and its stream ends, so a stalled client cannot hold up
//! block production indefinitely. Ordering is kept per chain: a stalled
//! subscriber only delays notifications of its own chain.
//!
//! Stopping a subscriber also aborts a send already waiting on its queue, so
//! nothing is delivered once `stop_listener` or `stop_all` has returned.

use crate::blockchain::{BlockId, SkipBlock};
use crate::cancel::{CancelHandle, CancelSignal};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tracing::{debug, info, warn};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub type ListenerId = u64;

#[derive(Debug, Clone)]
pub struct StreamingResponse {
    pub block: SkipBlock,
}

/// Receiving end of a subscription. The stream ends (`recv` returns `None`)
/// once the listener is stopped.
#[derive(Debug)]
pub struct Listener {
    id: ListenerId,
    chain_id: BlockId,
    receiver: mpsc::Receiver<StreamingResponse>,
}

impl Listener {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn chain_id(&self) -> BlockId {
        self.chain_id
    }

    pub async fn recv(&mut self) -> Option<StreamingResponse> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamingResponse> {
        self.receiver.try_recv().ok()
    }
}

struct Subscriber {
    id: ListenerId,
    sender: mpsc::Sender<StreamingResponse>,
    stop: CancelHandle,
}

impl Subscriber {
    fn stop(self) {
        self.stop.cancel();
    }
}

enum Delivery {
    Sent,
    Stalled,
    Gone,
    Stopped,
}

type OrderLock = Arc<tokio::sync::Mutex<()>>;

pub struct StreamingManager {
    /// Skipchain id -> subscribers in registration order.
    listeners: Mutex<HashMap<BlockId, Vec<Subscriber>>>,
    next_id: AtomicU64,
    /// Skipchain id -> lock serializing that chain's fan-out, so every
    /// subscriber sees blocks in notify order.
    delivery: Mutex<HashMap<BlockId, OrderLock>>,
    channel_capacity: usize,
    send_timeout: Duration,
}

impl Default for StreamingManager {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY, DEFAULT_SEND_TIMEOUT)
    }
}

impl StreamingManager {
    pub fn new(channel_capacity: usize, send_timeout: Duration) -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            delivery: Mutex::new(HashMap::new()),
            channel_capacity: channel_capacity.max(1),
            send_timeout,
        }
    }

    pub fn new_listener(&self, chain_id: BlockId) -> Listener {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.channel_capacity);
        self.listeners
            .lock()
            .entry(chain_id)
            .or_default()
            .push(Subscriber {
                id,
                sender,
                stop: CancelHandle::new().0,
            });
        debug!(chain = %hex::encode(chain_id), listener = id, "New streaming listener");
        Listener {
            id,
            chain_id,
            receiver,
        }
    }

    /// Sends `block` to every listener of `chain_id`. Notifying a chain
    /// without listeners does nothing.
    pub async fn notify(&self, chain_id: &BlockId, block: &SkipBlock) {
        if self.listener_count(chain_id) == 0 {
            return;
        }
        let order = self.delivery.lock().entry(*chain_id).or_default().clone();
        let guard = order.lock().await;

        let targets: Vec<(ListenerId, mpsc::Sender<StreamingResponse>, CancelSignal)> = {
            let listeners = self.listeners.lock();
            match listeners.get(chain_id) {
                Some(subs) => subs
                    .iter()
                    .map(|s| (s.id, s.sender.clone(), s.stop.signal()))
                    .collect(),
                None => Vec::new(),
            }
        };

        let mut evicted = Vec::new();
        for (id, sender, mut stopped) in targets {
            let response = StreamingResponse { block: block.clone() };
            let delivery = tokio::select! {
                biased;
                _ = stopped.cancelled() => Delivery::Stopped,
                sent = sender.send_timeout(response, self.send_timeout) => match sent {
                    Ok(()) => Delivery::Sent,
                    Err(SendTimeoutError::Timeout(_)) => Delivery::Stalled,
                    Err(SendTimeoutError::Closed(_)) => Delivery::Gone,
                },
            };
            match delivery {
                Delivery::Sent | Delivery::Stopped => {}
                Delivery::Stalled => {
                    warn!(
                        chain = %hex::encode(chain_id),
                        listener = id,
                        "Streaming listener stalled for {:?}, evicting",
                        self.send_timeout
                    );
                    evicted.push(id);
                }
                Delivery::Gone => {
                    debug!(listener = id, "Streaming listener went away");
                    evicted.push(id);
                }
            }
        }

        for id in evicted {
            self.stop_listener(chain_id, id);
        }

        drop(guard);
        drop(order);
        if self.listener_count(chain_id) == 0 {
            self.release_order(chain_id);
        }
    }

    /// Deregisters one listener and ends its stream. Returns whether the
    /// listener was still registered; stopping twice is a no-op.
    pub fn stop_listener(&self, chain_id: &BlockId, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(subs) = listeners.get_mut(chain_id) else {
            return false;
        };
        let Some(pos) = subs.iter().position(|s| s.id == id) else {
            return false;
        };
        subs.remove(pos).stop();
        if subs.is_empty() {
            listeners.remove(chain_id);
            self.release_order(chain_id);
        }
        debug!(chain = %hex::encode(chain_id), listener = id, "Stopped streaming listener");
        true
    }

    /// Ends every stream of every chain.
    pub fn stop_all(&self) {
        let drained: HashMap<BlockId, Vec<Subscriber>> = std::mem::take(&mut *self.listeners.lock());
        let mut count = 0;
        for (chain_id, subs) in drained {
            count += subs.len();
            subs.into_iter().for_each(Subscriber::stop);
            self.release_order(&chain_id);
        }
        info!(listeners = count, "Stopped all streaming listeners");
    }

    /// Drops the ordering lock of a chain left without listeners, unless a
    /// notification still holds it.
    fn release_order(&self, chain_id: &BlockId) {
        let mut delivery = self.delivery.lock();
        if delivery.get(chain_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            delivery.remove(chain_id);
        }
    }

    pub fn listener_count(&self, chain_id: &BlockId) -> usize {
        self.listeners.lock().get(chain_id).map_or(0, Vec::len)
    }
}

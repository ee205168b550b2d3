//! Paginated retrieval of chain history.
//!
//! A request asks for `num_pages` pages of `page_size` consecutive blocks,
//! starting at `start_id` and walking forward (level-0 forward links) or
//! backward (level-0 back-links). Requests can be correlated under one
//! session identity: every request naming the same `stream_id` shares the
//! session's response channel and cancellation signal.
//!
//! Problems with a request are not failures of the session. They are sent
//! as a [`PaginateError`] on the response channel so the caller can retry on
//! the same stream.
//!
//! Sessions stay registered until the caller cancels them. Each request task
//! waits for that signal after its last page and then removes the session.

use crate::blockchain::{BlockId, Direction, SkipBlock};
use crate::cancel::{CancelHandle, CancelSignal};
use crate::store::BlockLookup;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 8;

pub type StreamId = [u8; 32];

#[derive(Debug, Clone)]
pub struct PaginateRequest {
    pub start_id: Option<BlockId>,
    pub page_size: u64,
    pub num_pages: u64,
    pub backward: bool,
    pub stream_id: Option<StreamId>,
}

impl PaginateRequest {
    pub fn new(start_id: BlockId, page_size: u64, num_pages: u64) -> Self {
        Self {
            start_id: Some(start_id),
            page_size,
            num_pages,
            backward: false,
            stream_id: None,
        }
    }

    pub fn backward(mut self) -> Self {
        self.backward = true;
        self
    }

    pub fn on_stream(mut self, stream_id: StreamId) -> Self {
        self.stream_id = Some(stream_id);
        self
    }

    fn direction(&self) -> Direction {
        if self.backward {
            Direction::Backward
        } else {
            Direction::Forward
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaginateError {
    #[error("StreamID {} unknown", hex::encode(.0))]
    UnknownStream(StreamId),
    #[error("PageSize should be >= 1, but we found {0}")]
    InvalidPageSize(u64),
    #[error("NumPages should be >= 1, but we found {0}")]
    InvalidPageCount(u64),
    #[error("StartID is missing")]
    MissingStartId,
    #[error("failed to get the first block with ID {}", hex::encode(.0))]
    FirstBlockLookup(BlockId),
    #[error("couldn't find a next ID for block {} page number {page} index {index}", hex::encode(.after))]
    MissingLink { after: BlockId, page: u64, index: u64 },
    #[error("failed to get block with ID {} page number {page} index {index}", hex::encode(.id))]
    NextBlockLookup { id: BlockId, page: u64, index: u64 },
}

impl PaginateError {
    /// Numeric code reported to clients.
    pub fn code(&self) -> u32 {
        match self {
            PaginateError::UnknownStream(_) => 1,
            PaginateError::InvalidPageSize(_) | PaginateError::InvalidPageCount(_) => 2,
            PaginateError::MissingStartId => 3,
            PaginateError::FirstBlockLookup(_) => 4,
            PaginateError::MissingLink { .. } => 5,
            PaginateError::NextBlockLookup { .. } => 6,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaginateResponse {
    pub stream_id: StreamId,
    pub page_number: u64,
    pub backward: bool,
    pub result: Result<Vec<SkipBlock>, PaginateError>,
}

impl PaginateResponse {
    /// 0 for a page of blocks, the error code otherwise.
    pub fn error_code(&self) -> u32 {
        self.result.as_ref().err().map_or(0, PaginateError::code)
    }

    pub fn blocks(&self) -> &[SkipBlock] {
        self.result.as_deref().unwrap_or(&[])
    }
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<PaginateResponse>>>;

/// Response channel of a session; cloned into every request of the session.
#[derive(Debug, Clone)]
pub struct PageStream {
    receiver: SharedReceiver,
}

impl PageStream {
    /// Next response, or `None` once the session is closed and drained.
    pub async fn recv(&self) -> Option<PaginateResponse> {
        self.receiver.lock().await.recv().await
    }

    pub fn same_channel(&self, other: &PageStream) -> bool {
        Arc::ptr_eq(&self.receiver, &other.receiver)
    }
}

/// What a caller gets back for one request.
#[derive(Debug, Clone)]
pub struct PageSession {
    pub stream_id: StreamId,
    pub responses: PageStream,
    pub cancel: CancelHandle,
}

struct Session {
    sender: mpsc::Sender<PaginateResponse>,
    receiver: SharedReceiver,
    cancel: CancelHandle,
}

type SessionTable = Arc<Mutex<HashMap<StreamId, Session>>>;

pub struct PaginationManager {
    sessions: SessionTable,
    lookup: Arc<dyn BlockLookup>,
    channel_capacity: usize,
}

impl PaginationManager {
    pub fn new(lookup: Arc<dyn BlockLookup>, channel_capacity: usize) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            lookup,
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Starts serving `request` on a background task. Must be called from
    /// within a tokio runtime.
    pub fn paginate(&self, request: PaginateRequest) -> PageSession {
        let (stream_id, sender, receiver, cancel) = {
            let mut sessions = self.sessions.lock();
            match request.stream_id {
                Some(id) => match sessions.get(&id) {
                    Some(s) => (id, s.sender.clone(), s.receiver.clone(), s.cancel.clone()),
                    None => return Self::unknown_stream(id),
                },
                None => {
                    let mut id: StreamId = rand::random();
                    while sessions.contains_key(&id) {
                        id = rand::random();
                    }
                    let (sender, receiver) = mpsc::channel(self.channel_capacity);
                    let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
                    let (cancel, _) = CancelHandle::new();
                    sessions.insert(
                        id,
                        Session {
                            sender: sender.clone(),
                            receiver: receiver.clone(),
                            cancel: cancel.clone(),
                        },
                    );
                    debug!(stream = %hex::encode(id), "Opened pagination session");
                    (id, sender, receiver, cancel)
                }
            }
        };

        let task = PageTask {
            stream_id,
            direction: request.direction(),
            request,
            lookup: self.lookup.clone(),
            sender,
            cancel: cancel.signal(),
            sessions: self.sessions.clone(),
        };
        tokio::spawn(task.run());

        PageSession {
            stream_id,
            responses: PageStream { receiver },
            cancel,
        }
    }

    /// A detached stream carrying only the unknown-stream error.
    fn unknown_stream(id: StreamId) -> PageSession {
        let (sender, receiver) = mpsc::channel(1);
        let response = PaginateResponse {
            stream_id: id,
            page_number: 0,
            backward: false,
            result: Err(PaginateError::UnknownStream(id)),
        };
        // capacity 1 and a fresh channel: cannot be full
        let _ = sender.try_send(response);
        let (cancel, _) = CancelHandle::new();
        PageSession {
            stream_id: id,
            responses: PageStream {
                receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            },
            cancel,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn has_session(&self, stream_id: &StreamId) -> bool {
        self.sessions.lock().contains_key(stream_id)
    }

    /// Fires the cancellation signal of every open session.
    pub fn cancel_all(&self) {
        let handles: Vec<CancelHandle> = self.sessions.lock().values().map(|s| s.cancel.clone()).collect();
        for handle in handles {
            handle.cancel();
        }
    }
}

struct PageTask {
    stream_id: StreamId,
    direction: Direction,
    request: PaginateRequest,
    lookup: Arc<dyn BlockLookup>,
    sender: mpsc::Sender<PaginateResponse>,
    cancel: CancelSignal,
    sessions: SessionTable,
}

impl PageTask {
    async fn run(mut self) {
        self.produce().await;

        self.cancel.cancelled().await;
        if self.sessions.lock().remove(&self.stream_id).is_some() {
            debug!(stream = %hex::encode(self.stream_id), "Closed pagination session");
        }
    }

    async fn produce(&mut self) {
        let page_size = self.request.page_size;
        let num_pages = self.request.num_pages;

        if page_size < 1 {
            self.send(0, Err(PaginateError::InvalidPageSize(page_size))).await;
            return;
        }
        if num_pages < 1 {
            self.send(0, Err(PaginateError::InvalidPageCount(num_pages))).await;
            return;
        }
        let Some(start) = self.request.start_id else {
            self.send(0, Err(PaginateError::MissingStartId)).await;
            return;
        };

        let mut next = Some(start);
        let mut last = start;
        for page in 0..num_pages {
            let mut blocks = Vec::with_capacity(page_size.min(1024) as usize);
            for index in 0..page_size {
                let Some(id) = next else {
                    self.send(page, Err(PaginateError::MissingLink { after: last, page, index }))
                        .await;
                    return;
                };
                let Some(block) = self.lookup.get(&id) else {
                    let err = if page == 0 && index == 0 {
                        PaginateError::FirstBlockLookup(id)
                    } else {
                        PaginateError::NextBlockLookup { id, page, index }
                    };
                    self.send(page, Err(err)).await;
                    return;
                };
                next = block.next_id(self.direction);
                last = block.hash;
                blocks.push(block);
            }

            if !self.send(page, Ok(blocks)).await {
                return;
            }
        }
    }

    /// Sends one response unless the session is cancelled first. Returns
    /// whether the response went out.
    async fn send(&mut self, page_number: u64, result: Result<Vec<SkipBlock>, PaginateError>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let response = PaginateResponse {
            stream_id: self.stream_id,
            page_number,
            backward: self.request.backward,
            result,
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.sender.send(response) => sent.is_ok(),
        }
    }
}

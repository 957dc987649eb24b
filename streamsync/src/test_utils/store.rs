// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::errors::SyncError;
use crate::store::{LocalStream, StreamListener, StreamStore};
use crate::types::{Envelope, EventHash, NodeAddress, StreamAndCookie, StreamId, SyncCookie};

#[derive(Default)]
struct StreamInner {
    events: Vec<Envelope>,
    listeners: Vec<Arc<dyn StreamListener>>,
    down: bool,
}

/// In-memory stream. Cookies point at the number of events already seen.
pub struct MemoryStream {
    stream_id: StreamId,
    remotes: Vec<NodeAddress>,
    is_local: bool,
    sticky: Mutex<usize>,
    inner: Mutex<StreamInner>,
}

impl MemoryStream {
    fn new(stream_id: StreamId, remotes: Vec<NodeAddress>, is_local: bool) -> Self {
        Self {
            stream_id,
            remotes,
            is_local,
            sticky: Mutex::new(0),
            inner: Mutex::new(StreamInner::default()),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Cookie pointing behind the last event.
    pub fn cookie(&self) -> SyncCookie {
        self.cookie_at(self.inner.lock().events.len())
    }

    fn cookie_at(&self, position: usize) -> SyncCookie {
        SyncCookie {
            minipool_gen: 1,
            minipool_slot: position as i64,
            ..SyncCookie::new(self.stream_id)
        }
    }

    fn updates_since(&self, inner: &StreamInner, cookie: &SyncCookie) -> StreamAndCookie {
        let start = (cookie.minipool_slot.max(0) as usize).min(inner.events.len());

        StreamAndCookie {
            events: inner.events[start..].to_vec(),
            next_sync_cookie: Some(self.cookie_at(inner.events.len())),
            ..Default::default()
        }
    }

    /// Appends an event and informs all listeners.
    pub fn add_event(&self, payload: &[u8]) -> EventHash {
        let hash = EventHash::new(rand::random());
        let mut inner = self.inner.lock();

        inner.events.push(Envelope {
            hash,
            event: Bytes::copy_from_slice(payload),
        });

        let update = StreamAndCookie {
            events: inner.events[inner.events.len() - 1..].to_vec(),
            next_sync_cookie: Some(self.cookie_at(inner.events.len())),
            ..Default::default()
        };

        for listener in &inner.listeners {
            listener.on_update(update.clone());
        }

        hash
    }

    /// Makes the stream unavailable, all listeners receive a stream down.
    pub fn go_down(&self) {
        let listeners = {
            let mut inner = self.inner.lock();
            inner.down = true;
            std::mem::take(&mut inner.listeners)
        };

        for listener in listeners {
            listener.on_sync_down(self.stream_id);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }
}

fn same_listener(a: &Arc<dyn StreamListener>, b: &Arc<dyn StreamListener>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

#[async_trait]
impl LocalStream for MemoryStream {
    fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    async fn subscribe(
        &self,
        cookie: &SyncCookie,
        listener: Arc<dyn StreamListener>,
    ) -> Result<(), SyncError> {
        let mut inner = self.inner.lock();

        if inner.down {
            return Err(SyncError::Unavailable(format!(
                "Stream {} is down",
                self.stream_id
            )));
        }

        let update = self.updates_since(&inner, cookie);
        if !update.events.is_empty() {
            listener.on_update(update);
        }

        inner.listeners.push(listener);
        Ok(())
    }

    fn unsubscribe(&self, listener: &Arc<dyn StreamListener>) {
        self.inner
            .lock()
            .listeners
            .retain(|current| !same_listener(current, listener));
    }

    async fn updates_since_cookie(
        &self,
        cookie: &SyncCookie,
        callback: &mut (dyn FnMut(StreamAndCookie) -> Result<(), SyncError> + Send),
    ) -> Result<(), SyncError> {
        let update = {
            let inner = self.inner.lock();
            self.updates_since(&inner, cookie)
        };

        callback(update)
    }

    fn remotes_and_is_local(&self) -> (Vec<NodeAddress>, bool) {
        (self.remotes.clone(), self.is_local)
    }

    fn sticky_peer(&self) -> Option<NodeAddress> {
        self.remotes.get(*self.sticky.lock()).copied()
    }

    fn advance_sticky_peer(&self, failed: &NodeAddress) -> Option<NodeAddress> {
        if self.remotes.is_empty() {
            return None;
        }

        let mut sticky = self.sticky.lock();
        if self.remotes[*sticky] == *failed {
            *sticky = (*sticky + 1) % self.remotes.len();
        }

        Some(self.remotes[*sticky])
    }
}

/// Stream store keeping everything in memory.
pub struct MemoryStreamStore {
    local_address: NodeAddress,
    streams: Mutex<HashMap<StreamId, Arc<MemoryStream>>>,
}

impl MemoryStreamStore {
    pub fn new(local_address: NodeAddress) -> Arc<Self> {
        Arc::new(Self {
            local_address,
            streams: Mutex::new(HashMap::new()),
        })
    }

    pub fn local_address(&self) -> NodeAddress {
        self.local_address
    }

    /// Creates a stream only this node replicates.
    pub fn create_local_stream(&self, stream_id: StreamId) -> Arc<MemoryStream> {
        self.create_stream(stream_id, Vec::new(), true)
    }

    pub fn create_stream(
        &self,
        stream_id: StreamId,
        remotes: Vec<NodeAddress>,
        is_local: bool,
    ) -> Arc<MemoryStream> {
        let stream = Arc::new(MemoryStream::new(stream_id, remotes, is_local));
        self.streams.lock().insert(stream_id, stream.clone());
        stream
    }

    pub fn stream(&self, stream_id: &StreamId) -> Option<Arc<MemoryStream>> {
        self.streams.lock().get(stream_id).cloned()
    }

    fn get(&self, stream_id: &StreamId) -> Result<Arc<MemoryStream>, SyncError> {
        self.stream(stream_id)
            .ok_or_else(|| SyncError::NotFound(format!("Stream {} not found", stream_id)))
    }
}

#[async_trait]
impl StreamStore for MemoryStreamStore {
    async fn get_stream_wait_for_local(
        &self,
        stream_id: &StreamId,
    ) -> Result<Arc<dyn LocalStream>, SyncError> {
        let stream = self.get(stream_id)?;

        if !stream.is_local {
            return Err(SyncError::Unavailable(format!(
                "Stream {} is not replicated on {}",
                stream_id, self.local_address
            )));
        }

        Ok(stream)
    }

    async fn get_stream_no_wait(
        &self,
        stream_id: &StreamId,
    ) -> Result<Arc<dyn LocalStream>, SyncError> {
        Ok(self.get(stream_id)?)
    }
}

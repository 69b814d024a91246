use crate::{stream::StreamShared, stream_id::StreamId};
use dashmap::DashMap;
use std::sync::Arc;

/// Registry of live streams for one session.
#[derive(Debug, Default)]
pub(crate) struct StreamTable {
    streams: DashMap<StreamId, Arc<StreamShared>>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: StreamId) -> Option<Arc<StreamShared>> {
        self.streams.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn insert(&self, stream: Arc<StreamShared>) {
        self.streams.insert(stream.id(), stream);
    }

    #[cfg(test)]
    pub fn contains(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    pub fn remove(&self, id: StreamId) -> Option<Arc<StreamShared>> {
        self.streams.remove(&id).map(|(_, stream)| stream)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Removes and returns every stream matching `pred`.
    pub fn drain_where(&self, pred: impl Fn(StreamId) -> bool) -> Vec<Arc<StreamShared>> {
        let ids: Vec<StreamId> = self
            .streams
            .iter()
            .map(|entry| *entry.key())
            .filter(|id| pred(*id))
            .collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn drain(&self) -> Vec<Arc<StreamShared>> {
        self.drain_where(|_| true)
    }
}

//! Ready-made [`StreamCollection`] keyed by stream id.
//!
//! Stream objects are created by a factory closure the first time a status
//! line names their id, updated in place afterwards, and dropped on
//! removal. Writes come only from the model executor; the UDP task reads
//! through [`StreamCollection::sink`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use flexapi_core::{Property, StreamCollection, StreamSink};

/// A stream object that can be kept in a [`StreamMap`].
pub trait StreamObject: StreamSink + 'static {
    /// Apply properties from a status line.
    fn update(&self, properties: &[Property]);
}

type Factory<T> = Box<dyn Fn(u32) -> T + Send + Sync>;

pub struct StreamMap<T: StreamObject> {
    streams: RwLock<HashMap<u32, Arc<T>>>,
    factory: Factory<T>,
}

impl<T: StreamObject> StreamMap<T> {
    pub fn new(factory: impl Fn(u32) -> T + Send + Sync + 'static) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            factory: Box::new(factory),
        }
    }

    pub fn get(&self, stream_id: u32) -> Option<Arc<T>> {
        self.streams.read().get(&stream_id).cloned()
    }

    /// Live stream ids, ascending.
    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.streams.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.read().is_empty()
    }
}

impl<T: StreamObject> StreamCollection for StreamMap<T> {
    fn owns(&self, stream_id: u32) -> bool {
        self.streams.read().contains_key(&stream_id)
    }

    fn parse_status(&self, stream_id: u32, properties: &[Property]) {
        let stream = {
            let mut streams = self.streams.write();
            Arc::clone(streams.entry(stream_id).or_insert_with(|| {
                tracing::debug!(stream_id = format!("0x{:08X}", stream_id), "Stream added");
                Arc::new((self.factory)(stream_id))
            }))
        };
        stream.update(properties);
    }

    fn remove(&self, stream_id: u32) {
        if self.streams.write().remove(&stream_id).is_some() {
            tracing::debug!(stream_id = format!("0x{:08X}", stream_id), "Stream removed");
        }
    }

    fn sink(&self, stream_id: u32) -> Option<Arc<dyn StreamSink>> {
        self.get(stream_id).map(|s| s as Arc<dyn StreamSink>)
    }

    fn clear(&self) {
        self.streams.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use flexapi_core::{PacketType, StreamPacket};
    use parking_lot::Mutex;

    struct DaxStream {
        id: u32,
        channel: Mutex<Option<String>>,
        packets: AtomicUsize,
    }

    impl StreamSink for DaxStream {
        fn consume(&self, _packet: &StreamPacket) {
            self.packets.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl StreamObject for DaxStream {
        fn update(&self, properties: &[Property]) {
            for (k, v) in properties {
                if k == "dax_channel" {
                    *self.channel.lock() = Some(v.clone());
                }
            }
        }
    }

    fn map() -> StreamMap<DaxStream> {
        StreamMap::new(|id| DaxStream {
            id,
            channel: Mutex::new(None),
            packets: AtomicUsize::new(0),
        })
    }

    fn pkt(stream_id: u32) -> StreamPacket {
        StreamPacket {
            packet_type: PacketType::IfDataWithStream,
            stream_id,
            oui: 0x001C2D,
            information_class: 0,
            class_code: 0x03E3,
            packet_count: 0,
            timestamp_int: None,
            timestamp_frac: None,
            payload: Bytes::new(),
        }
    }

    #[test]
    fn create_update_remove() {
        let m = map();
        assert!(!m.owns(7));

        m.parse_status(7, &[("type".into(), "dax_rx".into())]);
        assert!(m.owns(7));
        assert_eq!(m.get(7).unwrap().id, 7);
        assert_eq!(*m.get(7).unwrap().channel.lock(), None);

        m.parse_status(7, &[("dax_channel".into(), "2".into())]);
        assert_eq!(m.len(), 1);
        assert_eq!(m.get(7).unwrap().channel.lock().as_deref(), Some("2"));

        m.remove(7);
        assert!(m.is_empty());
        assert!(m.sink(7).is_none());
    }

    #[test]
    fn sink_forwards_packets() {
        let m = map();
        m.parse_status(3, &[]);
        m.sink(3).unwrap().consume(&pkt(3));
        m.sink(3).unwrap().consume(&pkt(3));
        assert_eq!(m.get(3).unwrap().packets.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn clear_drops_everything() {
        let m = map();
        m.parse_status(2, &[]);
        m.parse_status(1, &[]);
        assert_eq!(m.ids(), vec![1, 2]);
        m.clear();
        assert!(m.ids().is_empty());
    }
}

//! Routing of inbound TCP lines and UDP packets.
//!
//! [`ProtocolDispatcher`] runs on the session task. It classifies each line
//! by its leading tag and sends it on: replies to the [`ReplyCorrelator`],
//! status lines to the client table or, via the model executor, to the
//! caller's parsers and stream collections. Lines that matter to the
//! connection state machine (handle, version, status attribution) come back
//! as a [`LineOutcome`].
//!
//! [`PacketRouter`] runs on the UDP receive task and forwards decoded
//! VITA-49 packets to meter and stream sinks by class code and stream id.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;

use flexapi_core::{
    ApiEvent, MeterSink, ProtocolVersion, Property, StreamCollection, StreamKind, StreamPacket,
};

use crate::clients::{ClientChange, ClientTable};
use crate::codec::{self, Inbound, MessageLine, Severity, StatusLine};
use crate::correlator::ReplyCorrelator;
use crate::executor::ModelExecutor;
use crate::udp::PacketSink;
use crate::vita49::{self, PacketClass};

// ---------------------------------------------------------------------------
// Status keywords
// ---------------------------------------------------------------------------

/// Message-type keyword of a status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKeyword {
    Amplifier,
    Apd,
    Atu,
    Client,
    Cwx,
    Display,
    Dvk,
    Eq,
    File,
    Gps,
    Interlock,
    License,
    Memory,
    Meter,
    Mixer,
    Profile,
    Radio,
    Slice,
    Spot,
    Stream,
    Tnf,
    Transmit,
    Turf,
    UsbCable,
    Wan,
    Waveform,
    Xvtr,
    Unknown,
}

const STATUS_KEYWORDS: &[(&str, StatusKeyword)] = &[
    ("amplifier", StatusKeyword::Amplifier),
    ("apd", StatusKeyword::Apd),
    ("atu", StatusKeyword::Atu),
    ("client", StatusKeyword::Client),
    ("cwx", StatusKeyword::Cwx),
    ("display", StatusKeyword::Display),
    ("dvk", StatusKeyword::Dvk),
    ("eq", StatusKeyword::Eq),
    ("file", StatusKeyword::File),
    ("gps", StatusKeyword::Gps),
    ("interlock", StatusKeyword::Interlock),
    ("license", StatusKeyword::License),
    ("memory", StatusKeyword::Memory),
    ("meter", StatusKeyword::Meter),
    ("mixer", StatusKeyword::Mixer),
    ("profile", StatusKeyword::Profile),
    ("radio", StatusKeyword::Radio),
    ("slice", StatusKeyword::Slice),
    ("spot", StatusKeyword::Spot),
    ("stream", StatusKeyword::Stream),
    ("tnf", StatusKeyword::Tnf),
    ("transmit", StatusKeyword::Transmit),
    ("turf", StatusKeyword::Turf),
    ("usb_cable", StatusKeyword::UsbCable),
    ("wan", StatusKeyword::Wan),
    ("waveform", StatusKeyword::Waveform),
    ("xvtr", StatusKeyword::Xvtr),
];

impl StatusKeyword {
    pub fn parse(keyword: &str) -> Self {
        STATUS_KEYWORDS
            .iter()
            .find(|(k, _)| *k == keyword)
            .map(|(_, kw)| *kw)
            .unwrap_or(StatusKeyword::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        STATUS_KEYWORDS
            .iter()
            .find(|(_, kw)| kw == self)
            .map(|(k, _)| *k)
            .unwrap_or("unknown")
    }
}

/// `type=` values of `stream` status lines.
const STREAM_TYPES: &[(&str, StreamKind)] = &[
    ("dax_rx", StreamKind::DaxRx),
    ("dax_tx", StreamKind::DaxTx),
    ("dax_mic", StreamKind::DaxMic),
    ("dax_iq", StreamKind::DaxIq),
    ("remote_audio_rx", StreamKind::RemoteAudioRx),
    ("remote_audio_tx", StreamKind::RemoteAudioTx),
    ("netcw", StreamKind::NetCw),
];

fn stream_kind_for_type(value: &str) -> Option<StreamKind> {
    STREAM_TYPES
        .iter()
        .find(|(t, _)| *t == value)
        .map(|(_, kind)| *kind)
}

/// Live stream collections by kind. Fixed once the `Api` is built.
pub type StreamRegistry = HashMap<StreamKind, Arc<dyn StreamCollection>>;

// ---------------------------------------------------------------------------
// TCP line dispatch
// ---------------------------------------------------------------------------

/// What the session needs to know about a dispatched line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    Handle(u32),
    Version {
        raw: String,
        parsed: Option<ProtocolVersion>,
    },
    /// A status line attributed to `handle`. `client_change` is set for
    /// `client` status lines.
    Status {
        handle: u32,
        client_change: Option<ClientChange>,
    },
    /// Fully handled here (reply, message) or dropped.
    Routed,
}

pub struct ProtocolDispatcher {
    correlator: Arc<ReplyCorrelator>,
    executor: ModelExecutor,
    clients: Arc<ClientTable>,
    streams: Arc<StreamRegistry>,
    events: broadcast::Sender<ApiEvent>,
}

impl ProtocolDispatcher {
    pub fn new(
        correlator: Arc<ReplyCorrelator>,
        executor: ModelExecutor,
        clients: Arc<ClientTable>,
        streams: Arc<StreamRegistry>,
        events: broadcast::Sender<ApiEvent>,
    ) -> Self {
        Self {
            correlator,
            executor,
            clients,
            streams,
            events,
        }
    }

    /// Dispatch one line. Malformed lines are logged and dropped.
    pub fn dispatch_line(&self, line: &str) -> LineOutcome {
        tracing::trace!(line = %line, "Radio line");

        let inbound = match codec::parse_line(line.as_bytes()) {
            Ok(inbound) => inbound,
            Err(e) => {
                if !line.trim().is_empty() {
                    tracing::warn!(error = %e, "Dropping line from radio");
                }
                return LineOutcome::Routed;
            }
        };

        match inbound {
            Inbound::Handle(handle) => LineOutcome::Handle(handle),
            Inbound::Version { raw, parsed } => LineOutcome::Version { raw, parsed },
            Inbound::Message(message) => {
                self.handle_message(message);
                LineOutcome::Routed
            }
            Inbound::Reply(reply) => {
                self.correlator.resolve(reply);
                LineOutcome::Routed
            }
            Inbound::Status(status) => self.handle_status(status),
        }
    }

    fn handle_message(&self, message: MessageLine) {
        let code = format!("0x{:08X}", message.code);
        match message.severity() {
            Severity::Info => tracing::info!(code = %code, text = %message.text, "Radio message"),
            Severity::Warning => tracing::warn!(code = %code, text = %message.text, "Radio message"),
            Severity::Error | Severity::Fatal => {
                tracing::error!(code = %code, text = %message.text, "Radio message")
            }
        }
        let _ = self.events.send(ApiEvent::MessageReceived {
            code: message.code,
            text: message.text,
        });
    }

    fn handle_status(&self, status: StatusLine) -> LineOutcome {
        let handle = status.handle;
        let keyword = StatusKeyword::parse(&status.keyword);
        let mut client_change = None;

        match keyword {
            StatusKeyword::Unknown => {
                tracing::warn!(keyword = %status.keyword, "Unknown status keyword");
            }
            StatusKeyword::Client => match self.clients.apply(&status.properties) {
                Ok(change) => client_change = Some(change),
                Err(e) => tracing::warn!(error = %e, "Bad client status"),
            },
            StatusKeyword::Stream => self.route_stream(status.properties, status.in_use),
            StatusKeyword::Display => self.route_display(status.properties, status.in_use),
            keyword => self.route_to_parser(keyword, status.properties, status.in_use),
        }

        LineOutcome::Status {
            handle,
            client_change,
        }
    }

    fn route_to_parser(&self, keyword: StatusKeyword, properties: Vec<Property>, in_use: bool) {
        self.executor.submit(move |model| {
            if !model.parse_status(keyword, &properties, in_use) {
                tracing::trace!(keyword = keyword.as_str(), "No parser registered");
            }
        });
    }

    /// `stream <id> type=<kind> ...` or `stream <id> removed`.
    fn route_stream(&self, properties: Vec<Property>, in_use: bool) {
        let Some(stream_id) = properties.first().and_then(|(k, _)| codec::parse_hex_u32(k))
        else {
            tracing::warn!("Stream status without a stream id");
            return;
        };

        if !in_use {
            let streams = Arc::clone(&self.streams);
            self.executor.submit(move |_| {
                match streams.values().find(|c| c.owns(stream_id)) {
                    Some(owner) => owner.remove(stream_id),
                    None => tracing::trace!(
                        stream_id = format!("0x{:08X}", stream_id),
                        "Removal for unknown stream"
                    ),
                }
            });
            return;
        }

        let named_kind = properties
            .get(1)
            .filter(|(k, _)| k == "type")
            .map(|(_, v)| v.clone());

        let target = match named_kind {
            Some(kind_name) => match stream_kind_for_type(&kind_name) {
                Some(kind) => Target::Kind(kind),
                None => {
                    tracing::warn!(
                        stream_id = format!("0x{:08X}", stream_id),
                        kind = %kind_name,
                        "Unknown stream type"
                    );
                    return;
                }
            },
            None => Target::Owner,
        };

        let streams = Arc::clone(&self.streams);
        self.executor.submit(move |_| {
            let props = &properties[1..];
            let collection = match target {
                Target::Kind(kind) => streams.get(&kind),
                Target::Owner => streams.values().find(|c| c.owns(stream_id)),
            };
            match collection {
                Some(collection) => collection.parse_status(stream_id, props),
                None => tracing::trace!(
                    stream_id = format!("0x{:08X}", stream_id),
                    "No stream collection for status"
                ),
            }
        });
    }

    /// `display pan|waterfall <id> ...` goes to the matching stream
    /// collection when one is registered, otherwise to the display parser.
    fn route_display(&self, properties: Vec<Property>, in_use: bool) {
        let kind = match properties.first().map(|(k, _)| k.as_str()) {
            Some("pan") => Some(StreamKind::Panadapter),
            Some("waterfall") => Some(StreamKind::Waterfall),
            _ => None,
        };
        let stream_id = properties.get(1).and_then(|(k, _)| codec::parse_hex_u32(k));

        let collection = kind.and_then(|kind| self.streams.get(&kind).cloned());
        match (collection, stream_id) {
            (Some(collection), Some(stream_id)) => {
                self.executor.submit(move |_| {
                    if in_use {
                        collection.parse_status(stream_id, &properties[2..]);
                    } else {
                        collection.remove(stream_id);
                    }
                });
            }
            _ => self.route_to_parser(StatusKeyword::Display, properties, in_use),
        }
    }

    /// Clear every externally owned collection on the model executor.
    pub fn clear_model(&self) {
        let streams = Arc::clone(&self.streams);
        self.executor.submit(move |model| {
            for collection in streams.values() {
                collection.clear();
            }
            model.clear();
        });
    }
}

enum Target {
    Kind(StreamKind),
    Owner,
}

// ---------------------------------------------------------------------------
// UDP packet routing
// ---------------------------------------------------------------------------

/// Forwards decoded packets to meter and stream sinks.
pub struct PacketRouter {
    streams: Arc<StreamRegistry>,
    meters: Option<Arc<dyn MeterSink>>,
}

impl PacketRouter {
    pub fn new(streams: Arc<StreamRegistry>, meters: Option<Arc<dyn MeterSink>>) -> Self {
        Self { streams, meters }
    }

    fn kinds_for(class: PacketClass) -> &'static [StreamKind] {
        match class {
            PacketClass::Panadapter => &[StreamKind::Panadapter],
            PacketClass::Waterfall => &[StreamKind::Waterfall],
            PacketClass::Opus => &[StreamKind::RemoteAudioRx],
            PacketClass::DaxAudio | PacketClass::DaxReducedBw => {
                &[StreamKind::DaxRx, StreamKind::DaxMic]
            }
            c if c.is_dax_iq() => &[StreamKind::DaxIq],
            _ => &[],
        }
    }

    fn route_meters(&self, packet: &StreamPacket) {
        let Some(meters) = &self.meters else {
            return;
        };
        match vita49::parse_meter_payload(&packet.payload) {
            Ok(readings) if !readings.is_empty() => meters.meter_readings(&readings),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Bad meter packet"),
        }
    }
}

impl PacketSink for PacketRouter {
    fn deliver(&self, packet: StreamPacket) {
        let class = PacketClass::from_code(packet.class_code);
        match class {
            PacketClass::Meter => self.route_meters(&packet),
            PacketClass::Discovery => {}
            PacketClass::Unknown(code) => {
                tracing::error!(
                    class_code = format!("0x{:04X}", code),
                    stream_id = format!("0x{:08X}", packet.stream_id),
                    "Unrecognized packet class"
                );
            }
            class => {
                let sink = Self::kinds_for(class)
                    .iter()
                    .filter_map(|kind| self.streams.get(kind))
                    .find_map(|c| c.sink(packet.stream_id));
                if let Some(sink) = sink {
                    sink.consume(&packet);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use flexapi_core::{MeterReading, PacketType, StatusParser, StreamSink};
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    use crate::correlator::Reply;
    use crate::executor::Model;

    /// Stream collection that records every call made on it.
    #[derive(Default)]
    struct RecordingCollection {
        live: Mutex<Vec<u32>>,
        calls: Mutex<Vec<String>>,
        consumed: Arc<Mutex<Vec<u32>>>,
    }

    struct IdSink(u32, Arc<Mutex<Vec<u32>>>);

    impl StreamSink for IdSink {
        fn consume(&self, _packet: &StreamPacket) {
            self.1.lock().push(self.0);
        }
    }

    impl RecordingCollection {
        fn with_stream(id: u32) -> Arc<Self> {
            let c = Self::default();
            c.live.lock().push(id);
            Arc::new(c)
        }
    }

    impl StreamCollection for RecordingCollection {
        fn owns(&self, stream_id: u32) -> bool {
            self.live.lock().contains(&stream_id)
        }

        fn parse_status(&self, stream_id: u32, properties: &[Property]) {
            let mut live = self.live.lock();
            if !live.contains(&stream_id) {
                live.push(stream_id);
            }
            let first = properties.first().map(|p| p.0.clone()).unwrap_or_default();
            self.calls.lock().push(format!("parse {stream_id:X} {first}"));
        }

        fn remove(&self, stream_id: u32) {
            self.live.lock().retain(|id| *id != stream_id);
            self.calls.lock().push(format!("remove {stream_id:X}"));
        }

        fn sink(&self, stream_id: u32) -> Option<Arc<dyn StreamSink>> {
            if self.owns(stream_id) {
                Some(Arc::new(IdSink(stream_id, self.consumed.clone())))
            } else {
                None
            }
        }

        fn clear(&self) {
            self.live.lock().clear();
            self.calls.lock().push("clear".into());
        }
    }

    struct KeywordRecorder(Arc<Mutex<Vec<String>>>);

    impl StatusParser for KeywordRecorder {
        fn parse_status(&mut self, properties: &[Property], in_use: bool) {
            let first = properties.first().map(|p| p.0.clone()).unwrap_or_default();
            self.0.lock().push(format!("{first}:{in_use}"));
        }
    }

    struct Fixture {
        dispatcher: ProtocolDispatcher,
        executor: ModelExecutor,
        correlator: Arc<ReplyCorrelator>,
        events: broadcast::Receiver<ApiEvent>,
    }

    fn fixture(model: Model, streams: StreamRegistry) -> Fixture {
        let (executor, _task) = ModelExecutor::spawn(model, CancellationToken::new());
        let (events_tx, events) = broadcast::channel(32);
        let correlator = Arc::new(ReplyCorrelator::new(executor.clone()));
        let clients = Arc::new(ClientTable::new(events_tx.clone()));
        let dispatcher = ProtocolDispatcher::new(
            correlator.clone(),
            executor.clone(),
            clients,
            Arc::new(streams),
            events_tx,
        );
        Fixture {
            dispatcher,
            executor,
            correlator,
            events,
        }
    }

    #[test]
    fn keyword_table() {
        assert_eq!(StatusKeyword::parse("slice"), StatusKeyword::Slice);
        assert_eq!(StatusKeyword::parse("usb_cable"), StatusKeyword::UsbCable);
        assert_eq!(StatusKeyword::parse("bogus"), StatusKeyword::Unknown);
        assert_eq!(StatusKeyword::Transmit.as_str(), "transmit");
        for (name, kw) in STATUS_KEYWORDS {
            assert_eq!(StatusKeyword::parse(name), *kw);
        }
    }

    #[tokio::test]
    async fn handle_and_version_are_returned() {
        let f = fixture(Model::new(), StreamRegistry::new());
        assert_eq!(f.dispatcher.dispatch_line("H1A2B3C4D"), LineOutcome::Handle(0x1A2B3C4D));
        assert_eq!(
            f.dispatcher.dispatch_line("V1.4.0.0"),
            LineOutcome::Version {
                raw: "1.4.0.0".into(),
                parsed: Some(ProtocolVersion::new(1, 4, 0, 0)),
            }
        );
    }

    #[tokio::test]
    async fn reply_reaches_correlator() {
        let f = fixture(Model::new(), StreamRegistry::new());
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        f.correlator.register(
            5,
            "info",
            Some(Box::new(move |r: &Reply| *seen2.lock() = Some(r.text.clone()))),
        );
        assert_eq!(
            f.dispatcher.dispatch_line("R5|0|key1=val1,key2=val2"),
            LineOutcome::Routed
        );
        assert_eq!(seen.lock().as_deref(), Some("key1=val1,key2=val2"));
        assert_eq!(f.correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn message_emits_event() {
        let mut f = fixture(Model::new(), StreamRegistry::new());
        f.dispatcher.dispatch_line("M10000001|Radio is warming up");
        match f.events.try_recv() {
            Ok(ApiEvent::MessageReceived { code, text }) => {
                assert_eq!(code, 0x1000_0001);
                assert_eq!(text, "Radio is warming up");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_and_unknown_lines_are_dropped() {
        let f = fixture(Model::new(), StreamRegistry::new());
        assert_eq!(f.dispatcher.dispatch_line("Xgarbage"), LineOutcome::Routed);
        assert_eq!(f.dispatcher.dispatch_line("R|"), LineOutcome::Routed);
        assert_eq!(f.dispatcher.dispatch_line("S1234|noseparator"), LineOutcome::Routed);
        assert_eq!(f.dispatcher.dispatch_line(""), LineOutcome::Routed);
    }

    #[tokio::test]
    async fn unknown_keyword_invokes_no_parser() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut model = Model::new();
        model.insert_parser(StatusKeyword::Slice, Box::new(KeywordRecorder(seen.clone())));
        let f = fixture(model, StreamRegistry::new());

        let outcome = f.dispatcher.dispatch_line("S00000001|frobnicator 0 level=3");
        assert_eq!(
            outcome,
            LineOutcome::Status {
                handle: 1,
                client_change: None
            }
        );
        f.executor.flush().await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn keyword_routes_to_parser_with_in_use() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut model = Model::new();
        model.insert_parser(StatusKeyword::Slice, Box::new(KeywordRecorder(seen.clone())));
        let f = fixture(model, StreamRegistry::new());

        f.dispatcher.dispatch_line("S00000001|slice 0 RF_frequency=14.100000");
        f.dispatcher.dispatch_line("S00000001|slice 0 in_use=0");
        f.executor.flush().await;
        assert_eq!(*seen.lock(), vec!["0:true", "0:false"]);
    }

    #[tokio::test]
    async fn client_status_reports_change() {
        let f = fixture(Model::new(), StreamRegistry::new());
        let outcome = f
            .dispatcher
            .dispatch_line("S00000001|client 0x00000001 connected program=SmartSDR-Win");
        match outcome {
            LineOutcome::Status {
                handle: 1,
                client_change: Some(ClientChange::Added(client)),
            } => assert_eq!(client.program, "SmartSDR-Win"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_created_by_type() {
        let dax = Arc::new(RecordingCollection::default());
        let iq = Arc::new(RecordingCollection::default());
        let mut streams = StreamRegistry::new();
        streams.insert(StreamKind::DaxRx, dax.clone() as Arc<dyn StreamCollection>);
        streams.insert(StreamKind::DaxIq, iq.clone() as Arc<dyn StreamCollection>);
        let f = fixture(Model::new(), streams);

        f.dispatcher
            .dispatch_line("S00000001|stream 0x04000008 type=dax_rx dax_channel=1");
        f.executor.flush().await;

        assert_eq!(*dax.calls.lock(), vec!["parse 4000008 type"]);
        assert!(iq.calls.lock().is_empty());

        // update without a type goes to the owner
        f.dispatcher.dispatch_line("S00000001|stream 0x04000008 slice=0");
        f.executor.flush().await;
        assert_eq!(dax.calls.lock().last().unwrap(), "parse 4000008 slice");
    }

    #[tokio::test]
    async fn stream_removal_touches_only_owner() {
        let owner = RecordingCollection::with_stream(0x0400_0009);
        let other = RecordingCollection::with_stream(0x2000_0000);
        let mut streams = StreamRegistry::new();
        streams.insert(StreamKind::DaxMic, owner.clone() as Arc<dyn StreamCollection>);
        streams.insert(StreamKind::RemoteAudioRx, other.clone() as Arc<dyn StreamCollection>);
        let f = fixture(Model::new(), streams);

        f.dispatcher.dispatch_line("S00000001|stream 0x04000009 removed");
        f.executor.flush().await;

        assert_eq!(*owner.calls.lock(), vec!["remove 4000009"]);
        assert!(other.calls.lock().is_empty());
        assert!(!owner.owns(0x0400_0009));
    }

    #[tokio::test]
    async fn display_routes_to_panadapter_collection() {
        let pans = Arc::new(RecordingCollection::default());
        let mut streams = StreamRegistry::new();
        streams.insert(StreamKind::Panadapter, pans.clone() as Arc<dyn StreamCollection>);

        let display_seen = Arc::new(Mutex::new(Vec::new()));
        let mut model = Model::new();
        model.insert_parser(
            StatusKeyword::Display,
            Box::new(KeywordRecorder(display_seen.clone())),
        );
        let f = fixture(model, streams);

        f.dispatcher
            .dispatch_line("S00000001|display pan 0x40000000 center=14.100000 bandwidth=0.2");
        f.dispatcher
            .dispatch_line("S00000001|display waterfall 0x42000000 line_duration=100");
        f.dispatcher.dispatch_line("S00000001|display pan 0x40000000 removed");
        f.executor.flush().await;

        assert_eq!(
            *pans.calls.lock(),
            vec!["parse 40000000 center", "remove 40000000"]
        );
        // no waterfall collection registered, so the display parser gets it
        assert_eq!(*display_seen.lock(), vec!["waterfall:true"]);
    }

    #[tokio::test]
    async fn clear_model_clears_collections() {
        let dax = RecordingCollection::with_stream(1);
        let mut streams = StreamRegistry::new();
        streams.insert(StreamKind::DaxRx, dax.clone() as Arc<dyn StreamCollection>);
        let f = fixture(Model::new(), streams);

        f.dispatcher.clear_model();
        f.executor.flush().await;
        assert_eq!(*dax.calls.lock(), vec!["clear"]);
    }

    // -- UDP routing --

    fn packet(class_code: u16, stream_id: u32, payload: &[u8]) -> StreamPacket {
        StreamPacket {
            packet_type: PacketType::ExtDataWithStream,
            stream_id,
            oui: vita49::FLEXRADIO_OUI,
            information_class: 0x534C,
            class_code,
            packet_count: 0,
            timestamp_int: None,
            timestamp_frac: None,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    struct MeterRecorder(Mutex<Vec<Vec<MeterReading>>>);

    impl MeterSink for MeterRecorder {
        fn meter_readings(&self, readings: &[MeterReading]) {
            self.0.lock().push(readings.to_vec());
        }
    }

    #[test]
    fn meter_packet_fans_out_in_one_call() {
        let meters = Arc::new(MeterRecorder(Mutex::new(Vec::new())));
        let router = PacketRouter::new(Arc::new(StreamRegistry::new()), Some(meters.clone()));

        router.deliver(packet(0x8002, 0x0700_0000, &[0, 1, 0, 10, 0, 2, 0xFF, 0xFE]));

        let calls = meters.0.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0],
            vec![
                MeterReading {
                    meter_id: 1,
                    value: 10
                },
                MeterReading {
                    meter_id: 2,
                    value: -2
                },
            ]
        );
    }

    #[test]
    fn stream_packets_reach_registered_sink_only() {
        let pans = RecordingCollection::with_stream(0x4000_0000);
        let dax = RecordingCollection::with_stream(0x0400_0008);
        let mut streams = StreamRegistry::new();
        streams.insert(StreamKind::Panadapter, pans.clone() as Arc<dyn StreamCollection>);
        streams.insert(StreamKind::DaxRx, dax.clone() as Arc<dyn StreamCollection>);
        let router = PacketRouter::new(Arc::new(streams), None);

        router.deliver(packet(0x8003, 0x4000_0000, &[0; 8]));
        router.deliver(packet(0x03E3, 0x0400_0008, &[0; 8]));
        // unregistered id and a panadapter id under the wrong class
        router.deliver(packet(0x8003, 0x4000_0001, &[0; 8]));
        router.deliver(packet(0x8004, 0x4000_0000, &[0; 8]));
        // unknown class code is logged, not forwarded
        router.deliver(packet(0x1234, 0x4000_0000, &[0; 8]));

        assert_eq!(*pans.consumed.lock(), vec![0x4000_0000]);
        assert_eq!(*dax.consumed.lock(), vec![0x0400_0008]);
    }
}

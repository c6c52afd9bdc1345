//! Interfaces to the per-radio object model.
//!
//! The connection core does not know what a slice, panadapter or amplifier
//! is. It classifies inbound traffic and hands it to implementations of
//! these traits, which the caller registers when building the `Api`.
//!
//! # Threading
//!
//! [`StatusParser`], [`ReplyFieldSink`] and the mutating methods of
//! [`StreamCollection`] are only ever called from the model executor, a
//! single task that owns all writes to the object model. [`StreamSink`],
//! [`MeterSink`] and [`StreamCollection::sink`] are called from the UDP
//! receive task and must only read shared state or forward data.

use std::sync::Arc;

use bytes::Bytes;

/// A key/value property from a status line. Tokens without `=` carry an
/// empty value, e.g. the `0` in `slice 0 RF_frequency=14.1`.
pub type Property = (String, String);

/// Parser for one status keyword (`slice`, `transmit`, `gps`, ...).
pub trait StatusParser: Send {
    /// Apply the properties of one status line.
    ///
    /// `in_use` is `false` when the line marks the object as removed.
    fn parse_status(&mut self, properties: &[Property], in_use: bool);

    /// Drop all state; called on teardown.
    fn clear(&mut self) {}
}

/// Stream kinds named by the `type=` property of `stream` status lines, plus
/// the two display streams announced by `display` status lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Panadapter,
    Waterfall,
    DaxRx,
    DaxTx,
    DaxMic,
    DaxIq,
    RemoteAudioRx,
    RemoteAudioTx,
    NetCw,
}

/// A live collection of stream objects of one [`StreamKind`].
pub trait StreamCollection: Send + Sync {
    /// Whether a stream with this id is currently live in this collection.
    fn owns(&self, stream_id: u32) -> bool;

    /// Create or update a stream from its status properties.
    fn parse_status(&self, stream_id: u32, properties: &[Property]);

    /// Remove a stream.
    fn remove(&self, stream_id: u32);

    /// The packet consumer for a live stream.
    fn sink(&self, stream_id: u32) -> Option<Arc<dyn StreamSink>>;

    /// Remove every stream; called on teardown.
    fn clear(&self);
}

/// Consumer of decoded stream packets for one stream id.
pub trait StreamSink: Send + Sync {
    fn consume(&self, packet: &StreamPacket);
}

/// A single meter value from a meter packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeterReading {
    /// Meter id, as announced by `meter` status lines.
    pub meter_id: u16,
    /// Raw signed value in the meter's units.
    pub value: i16,
}

/// Consumer of meter packets. One packet may carry many meters.
pub trait MeterSink: Send + Sync {
    fn meter_readings(&self, readings: &[MeterReading]);
}

/// Replies the default reply handler knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyField {
    Info,
    Version,
    AntennaList,
    MicList,
    Uptime,
    ProfileInfo,
}

/// Receives successful replies to the informational commands issued during
/// connection setup.
pub trait ReplyFieldSink: Send {
    fn apply(&mut self, field: ReplyField, command: &str, text: &str);
}

/// VITA-49 packet type, from the top four bits of the header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    IfData,
    IfDataWithStream,
    ExtData,
    ExtDataWithStream,
    IfContext,
    ExtContext,
    Other(u8),
}

impl PacketType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x0F {
            0 => PacketType::IfData,
            1 => PacketType::IfDataWithStream,
            2 => PacketType::ExtData,
            3 => PacketType::ExtDataWithStream,
            4 => PacketType::IfContext,
            5 => PacketType::ExtContext,
            other => PacketType::Other(other),
        }
    }

    /// Whether the header carries a stream id word.
    pub fn has_stream_id(&self) -> bool {
        matches!(
            self,
            PacketType::IfDataWithStream
                | PacketType::ExtDataWithStream
                | PacketType::IfContext
                | PacketType::ExtContext
        )
    }

    /// Data packets that carry a stream id.
    pub fn is_data_with_stream(&self) -> bool {
        matches!(
            self,
            PacketType::IfDataWithStream | PacketType::ExtDataWithStream
        )
    }

    pub fn is_context(&self) -> bool {
        matches!(self, PacketType::IfContext | PacketType::ExtContext)
    }
}

/// A decoded VITA-49 datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPacket {
    pub packet_type: PacketType,
    pub stream_id: u32,
    /// 24-bit organizationally unique identifier.
    pub oui: u32,
    pub information_class: u16,
    pub class_code: u16,
    /// 4-bit rolling counter.
    pub packet_count: u8,
    pub timestamp_int: Option<u32>,
    pub timestamp_frac: Option<u64>,
    /// Payload bytes after the header, trailer excluded.
    pub payload: Bytes,
}

//! flexapi-core: types, errors and model interfaces for the SmartSDR
//! connection core.
//!
//! This crate holds everything a caller needs to describe a radio, follow
//! the connection lifecycle and plug in its own object model, without
//! pulling in any networking.
//!
//! # Key types
//!
//! - [`Endpoint`] / [`ConnectionParams`] -- what to connect to and how
//! - [`ConnectionState`] / [`ApiEvent`] -- lifecycle observation
//! - [`StatusParser`] / [`StreamCollection`] / [`StreamSink`] -- the model seam
//! - [`Error`] / [`Result`] -- error handling

pub mod error;
pub mod events;
pub mod model;
pub mod types;

pub use error::{Error, Result};
pub use events::ApiEvent;
pub use model::{
    MeterReading, MeterSink, PacketType, Property, ReplyField, ReplyFieldSink, StatusParser,
    StreamCollection, StreamKind, StreamPacket, StreamSink,
};
pub use types::*;

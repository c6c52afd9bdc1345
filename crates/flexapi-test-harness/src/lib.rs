//! flexapi-test-harness: test utilities for flexapi.
//!
//! This crate provides [`MockRadio`], a scripted SmartSDR TCP server for
//! driving the connection state machine without hardware, and
//! [`VitaPacketBuilder`] for producing VITA-49 datagrams.

pub mod mock_radio;
pub mod vita;

pub use mock_radio::{MockRadio, RadioSession, ReceivedCommand, parse_command_line};
pub use vita::VitaPacketBuilder;

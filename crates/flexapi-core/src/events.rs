//! Lifecycle events emitted by the connection core.
//!
//! Events are delivered through a [`tokio::sync::broadcast`] channel scoped
//! to one `Api` instance. Slow subscribers may lag and miss events; the
//! current state can always be re-read from the `Api` itself.

use std::net::IpAddr;
use std::time::Duration;

use crate::types::{ConnectionState, GuiClient, ProtocolVersion};

/// An event emitted by the connection core.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiEvent {
    /// The connection state machine moved to a new state.
    StateChanged(ConnectionState),

    /// The TCP command channel is up (after TLS for WAN).
    TcpConnected { host: IpAddr, port: u16 },

    /// The TCP command channel closed.
    TcpDisconnected {
        /// `"User Initiated"` or a description of the transport failure.
        reason: String,
    },

    /// A command line was written to the radio. `line` is the exact text
    /// sent, without the trailing newline.
    CommandSent { sequence: u32, line: String },

    /// The radio answered `wan validate`.
    WanValidated { success: bool },

    /// The UDP data channel is bound.
    UdpBound { receive_port: u16, send_port: u16 },

    /// The UDP data channel was closed.
    UdpUnbound { reason: String },

    /// The first valid VITA-49 packet arrived, confirming registration.
    UdpRegistered,

    /// The radio acknowledged this session.
    ClientConnected { handle: u32 },

    /// This session ended.
    ClientDisconnected,

    /// A client session appeared on the radio.
    GuiClientAdded(GuiClient),

    /// A known client session changed.
    GuiClientUpdated(GuiClient),

    /// A client session left the radio.
    GuiClientRemoved(GuiClient),

    /// Teardown is starting; per-radio state is about to be cleared.
    RadioWillBeRemoved,

    /// Teardown finished; per-radio state has been cleared.
    RadioRemoved,

    /// The keepalive pinger started.
    PingStarted,

    /// A ping reply arrived.
    PingResponse { round_trip: Duration },

    /// No ping reply arrived within the timeout window.
    PingTimeout,

    /// The radio speaks a different protocol major version.
    VersionMismatch {
        radio: ProtocolVersion,
        api: ProtocolVersion,
    },

    /// An `M` line from the radio.
    MessageReceived { code: u32, text: String },
}

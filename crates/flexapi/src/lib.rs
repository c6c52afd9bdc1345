//! SmartSDR connection core for FlexRadio transceivers.
//!
//! This crate owns the network side of a SmartSDR client. It provides:
//!
//! - **Wire codec** ([`codec`], [`vita49`]) -- outbound `C<seq>|cmd` lines,
//!   inbound `H`/`M`/`R`/`S`/`V` lines, and VITA-49 stream headers.
//! - **Channels** ([`tcp`], [`udp`], [`tls`]) -- the TCP command channel
//!   (TLS for WAN radios) and the UDP data channel with local port scanning
//!   and WAN registration.
//! - **Reply correlation** ([`correlator`]) -- sequence numbers to waiting
//!   callbacks, plus the default reply handler.
//! - **Dispatch** ([`dispatcher`], [`clients`], [`streams`], [`executor`])
//!   -- status lines to caller-supplied parsers by keyword, UDP packets to
//!   stream sinks by class code and stream id, all model writes funnelled
//!   through one executor task.
//! - **Keepalive** ([`pinger`]) -- `ping` every second, teardown after 30 s
//!   of silence.
//! - **Api** ([`api`], [`builder`]) -- the public handle and the state
//!   machine behind it.
//!
//! # Architecture
//!
//! Each [`Api`] runs one session task that owns the connection lifecycle.
//! The TCP read loop, UDP receive loop, registration loop, pinger and model
//! executor are separate tasks that report back to it over channels, so a
//! slow model update or callback never stalls socket reads.
//!
//! # Example
//!
//! ```no_run
//! use std::net::Ipv4Addr;
//! use flexapi::{Api, ApiEvent, ConnectionParams, Endpoint};
//!
//! # async fn example() -> flexapi::Result<()> {
//! let api = Api::new();
//! let mut events = api.subscribe();
//!
//! let radio = Endpoint::local("1234-5678-9012-3456", Ipv4Addr::new(192, 168, 1, 50).into());
//! api.connect(radio, ConnectionParams::gui("Logger", "Shack")).await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let ApiEvent::ClientConnected { handle } = event {
//!         println!("connected as 0x{handle:08X}");
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod builder;
pub mod clients;
pub mod codec;
pub mod correlator;
pub mod dispatcher;
pub mod executor;
pub mod pinger;
mod session;
pub mod setup;
pub mod streams;
pub mod tcp;
pub mod tls;
pub mod udp;
pub mod vita49;

pub use api::Api;
pub use builder::{ApiBuilder, ApiOptions};
pub use correlator::Reply;
pub use dispatcher::StatusKeyword;
pub use streams::{StreamMap, StreamObject};
pub use tcp::USER_INITIATED;

pub use flexapi_core::*;

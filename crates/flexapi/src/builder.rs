//! Builder for constructing an [`Api`] instance.
//!
//! The builder collects the tuning knobs of the connection core and the
//! external collaborators (status parsers, stream collections, meter sink)
//! the core routes into. Collaborators are fixed for the lifetime of the
//! `Api`; connections come and go through [`Api::connect`].
//!
//! # Example
//!
//! ```no_run
//! use std::net::Ipv4Addr;
//! use flexapi::{Api, ConnectionParams, Endpoint};
//!
//! # async fn example() -> flexapi::Result<()> {
//! let api = Api::builder()
//!     .ping_timeout(std::time::Duration::from_secs(15))
//!     .build();
//!
//! let radio = Endpoint::local("1234-5678-9012-3456", Ipv4Addr::new(192, 168, 1, 50).into());
//! api.connect(radio, ConnectionParams::gui("Logger", "Shack")).await?;
//! # Ok(())
//! # }
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use flexapi_core::{
    MeterSink, ProtocolVersion, ReplyFieldSink, StatusParser, StreamCollection, StreamKind,
};

use crate::api::Api;
use crate::dispatcher::{StatusKeyword, StreamRegistry};
use crate::executor::Model;
use crate::pinger::{DEFAULT_PING_INTERVAL, DEFAULT_PING_TIMEOUT, PingerOptions};
use crate::tcp::{DEFAULT_CONNECT_TIMEOUT, TcpOptions};
use crate::udp::{
    DEFAULT_BIND_ATTEMPTS, DEFAULT_FIRST_LOCAL_PORT, DEFAULT_REGISTRATION_INTERVAL, UdpOptions,
};

/// Default delay between kicking a client and reconnecting (1 second).
pub const DEFAULT_RECONNECT_SETTLE: Duration = Duration::from_secs(1);

/// Default capacity of the lifecycle event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Protocol version this library speaks.
pub const API_VERSION: ProtocolVersion = ProtocolVersion::new(1, 4, 0, 0);

/// Tuning knobs for the connection core.
#[derive(Debug, Clone)]
pub struct ApiOptions {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub connect_timeout: Duration,
    /// Local address used for hole-punched WAN connections.
    pub local_interface: Option<IpAddr>,
    pub udp_bind_ip: IpAddr,
    pub first_local_udp_port: u16,
    pub udp_bind_attempts: u16,
    pub registration_interval: Duration,
    /// Wait between a pending-disconnect kick and the reconnect.
    pub reconnect_settle: Duration,
    pub event_capacity: usize,
    /// Compared by major number against the radio's `V` line.
    pub api_version: ProtocolVersion,
}

impl Default for ApiOptions {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            local_interface: None,
            udp_bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            first_local_udp_port: DEFAULT_FIRST_LOCAL_PORT,
            udp_bind_attempts: DEFAULT_BIND_ATTEMPTS,
            registration_interval: DEFAULT_REGISTRATION_INTERVAL,
            reconnect_settle: DEFAULT_RECONNECT_SETTLE,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            api_version: API_VERSION,
        }
    }
}

impl ApiOptions {
    pub(crate) fn tcp(&self) -> TcpOptions {
        TcpOptions {
            connect_timeout: self.connect_timeout,
            local_interface: self.local_interface,
        }
    }

    pub(crate) fn udp(&self) -> UdpOptions {
        UdpOptions {
            bind_ip: self.udp_bind_ip,
            first_local_port: self.first_local_udp_port,
            bind_attempts: self.udp_bind_attempts,
            registration_interval: self.registration_interval,
        }
    }

    pub(crate) fn pinger(&self) -> PingerOptions {
        PingerOptions {
            interval: self.ping_interval,
            timeout: self.ping_timeout,
        }
    }
}

/// Fluent builder for [`Api`].
pub struct ApiBuilder {
    options: ApiOptions,
    model: Model,
    streams: StreamRegistry,
    meters: Option<Arc<dyn MeterSink>>,
}

impl ApiBuilder {
    pub fn new() -> Self {
        Self {
            options: ApiOptions::default(),
            model: Model::new(),
            streams: StreamRegistry::new(),
            meters: None,
        }
    }

    /// Replace all options at once.
    pub fn options(mut self, options: ApiOptions) -> Self {
        self.options = options;
        self
    }

    /// Keepalive ping cadence (default: 1 s).
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.options.ping_interval = interval;
        self
    }

    /// Silence after which the session is torn down (default: 30 s).
    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.options.ping_timeout = timeout;
        self
    }

    /// TCP connect timeout (default: 5 s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    /// Local interface address for hole-punched connections (default: none).
    pub fn local_interface(mut self, addr: IpAddr) -> Self {
        self.options.local_interface = Some(addr);
        self
    }

    /// Address the UDP socket binds to (default: 0.0.0.0).
    pub fn udp_bind_ip(mut self, addr: IpAddr) -> Self {
        self.options.udp_bind_ip = addr;
        self
    }

    /// First local UDP port tried on LAN connections (default: 4991).
    pub fn first_local_udp_port(mut self, port: u16) -> Self {
        self.options.first_local_udp_port = port;
        self
    }

    /// Number of local UDP ports tried (default: 20).
    pub fn udp_bind_attempts(mut self, attempts: u16) -> Self {
        self.options.udp_bind_attempts = attempts;
        self
    }

    /// WAN registration datagram spacing (default: 50 ms).
    pub fn registration_interval(mut self, interval: Duration) -> Self {
        self.options.registration_interval = interval;
        self
    }

    /// Delay before reconnecting after a pending disconnect (default: 1 s).
    pub fn reconnect_settle(mut self, delay: Duration) -> Self {
        self.options.reconnect_settle = delay;
        self
    }

    /// Capacity of the event broadcast channel (default: 256).
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.options.event_capacity = capacity.max(1);
        self
    }

    /// Protocol version checked against the radio (default: 1.4.0.0).
    pub fn api_version(mut self, version: ProtocolVersion) -> Self {
        self.options.api_version = version;
        self
    }

    /// Register the parser for status lines with `keyword`.
    ///
    /// `client` and `stream` lines are handled by the core and never reach
    /// a parser registered here.
    pub fn status_parser(
        mut self,
        keyword: StatusKeyword,
        parser: impl StatusParser + 'static,
    ) -> Self {
        self.model.insert_parser(keyword, Box::new(parser));
        self
    }

    /// Target for fields carried by replies to the setup queries.
    pub fn reply_sink(mut self, sink: impl ReplyFieldSink + 'static) -> Self {
        self.model.set_reply_sink(Box::new(sink));
        self
    }

    /// Register the collection that owns streams of `kind`.
    pub fn stream_collection(
        mut self,
        kind: StreamKind,
        collection: Arc<dyn StreamCollection>,
    ) -> Self {
        self.streams.insert(kind, collection);
        self
    }

    /// Receiver for decoded meter readings.
    pub fn meter_sink(mut self, sink: Arc<dyn MeterSink>) -> Self {
        self.meters = Some(sink);
        self
    }

    /// Build the `Api` and start its background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Api {
        Api::start(self.options, self.model, self.streams, self.meters)
    }
}

impl Default for ApiBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = ApiOptions::default();
        assert_eq!(opts.ping_interval, Duration::from_secs(1));
        assert_eq!(opts.ping_timeout, Duration::from_secs(30));
        assert_eq!(opts.connect_timeout, Duration::from_secs(5));
        assert_eq!(opts.first_local_udp_port, 4991);
        assert_eq!(opts.udp_bind_attempts, 20);
        assert_eq!(opts.registration_interval, Duration::from_millis(50));
        assert_eq!(opts.reconnect_settle, Duration::from_secs(1));
        assert_eq!(opts.api_version, ProtocolVersion::new(1, 4, 0, 0));
        assert!(opts.local_interface.is_none());
    }

    #[test]
    fn setters_flow_into_channel_options() {
        let iface = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10));
        let builder = ApiBuilder::new()
            .ping_interval(Duration::from_millis(250))
            .ping_timeout(Duration::from_secs(3))
            .connect_timeout(Duration::from_secs(2))
            .local_interface(iface)
            .first_local_udp_port(6000)
            .udp_bind_attempts(4)
            .registration_interval(Duration::from_millis(10))
            .event_capacity(0);

        let opts = &builder.options;
        let tcp = opts.tcp();
        assert_eq!(tcp.connect_timeout, Duration::from_secs(2));
        assert_eq!(tcp.local_interface, Some(iface));

        let udp = opts.udp();
        assert_eq!(udp.first_local_port, 6000);
        assert_eq!(udp.bind_attempts, 4);
        assert_eq!(udp.registration_interval, Duration::from_millis(10));

        let ping = opts.pinger();
        assert_eq!(ping.interval, Duration::from_millis(250));
        assert_eq!(ping.timeout, Duration::from_secs(3));

        assert_eq!(opts.event_capacity, 1);
    }
}

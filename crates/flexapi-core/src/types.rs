//! Value types shared by the connection core and its callers.
//!
//! [`Endpoint`] and [`ConnectionParams`] are supplied by the caller for each
//! connection attempt. [`ConnectionState`] and [`GuiClient`] are produced by
//! the core and observed through events or snapshots.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Default SmartSDR TCP command port.
pub const DEFAULT_TCP_PORT: u16 = 4992;

/// Default port the radio listens on for VITA-49 UDP from clients.
pub const DEFAULT_RADIO_UDP_PORT: u16 = 4993;

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// A resolved radio address.
///
/// Produced by discovery (LAN broadcast or a WAN rendezvous service, both
/// outside this crate) and treated as immutable once handed to the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Radio serial number.
    pub serial: String,
    /// Radio (or public WAN) IP address.
    pub ip: IpAddr,
    /// `true` when the radio is reached over the internet.
    pub is_wan: bool,
    /// Advertised TCP command port for local connections.
    pub tcp_port: u16,
    /// Radio's UDP port for local connections.
    pub udp_port: u16,
    /// Public TLS command port for WAN connections.
    pub public_tls_port: Option<u16>,
    /// Public UDP port for WAN connections.
    pub public_udp_port: Option<u16>,
    /// Port negotiated by the rendezvous service for NAT hole punching.
    pub hole_punch_port: Option<u16>,
    /// Whether this WAN connection must go through the hole-punched port.
    pub requires_hole_punch: bool,
    /// Connection handle issued by the rendezvous service, validated with
    /// `wan validate` after the TLS channel is up.
    pub wan_connection_handle: Option<String>,
}

impl Endpoint {
    /// A radio on the local network using the standard ports.
    pub fn local(serial: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            serial: serial.into(),
            ip,
            is_wan: false,
            tcp_port: DEFAULT_TCP_PORT,
            udp_port: DEFAULT_RADIO_UDP_PORT,
            public_tls_port: None,
            public_udp_port: None,
            hole_punch_port: None,
            requires_hole_punch: false,
            wan_connection_handle: None,
        }
    }

    /// A radio reached through its public TLS and UDP ports.
    pub fn wan(
        serial: impl Into<String>,
        ip: IpAddr,
        public_tls_port: u16,
        public_udp_port: u16,
        wan_connection_handle: impl Into<String>,
    ) -> Self {
        Self {
            serial: serial.into(),
            ip,
            is_wan: true,
            tcp_port: DEFAULT_TCP_PORT,
            udp_port: DEFAULT_RADIO_UDP_PORT,
            public_tls_port: Some(public_tls_port),
            public_udp_port: Some(public_udp_port),
            hole_punch_port: None,
            requires_hole_punch: false,
            wan_connection_handle: Some(wan_connection_handle.into()),
        }
    }

    /// Route this WAN endpoint through a hole-punched port.
    pub fn with_hole_punch(mut self, port: u16) -> Self {
        self.hole_punch_port = Some(port);
        self.requires_hole_punch = true;
        self
    }

    /// Override the TCP command port.
    pub fn with_tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = port;
        self
    }

    /// Override the radio's UDP port.
    pub fn with_udp_port(mut self, port: u16) -> Self {
        self.udp_port = port;
        self
    }

    /// Whether both WAN and hole-punch apply.
    pub fn uses_hole_punch(&self) -> bool {
        self.is_wan && self.requires_hole_punch
    }
}

// ---------------------------------------------------------------------------
// Connection parameters
// ---------------------------------------------------------------------------

/// Whether this client presents itself as a GUI (operating position) or a
/// headless helper bound to another GUI client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientRole {
    #[default]
    Gui,
    NonGui,
}

/// A client session that must be kicked before this client can connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingDisconnect {
    /// Disconnect one client by handle.
    Client(u32),
    /// Disconnect every other client.
    All,
}

impl PendingDisconnect {
    /// The command text that performs this disconnect.
    pub fn command(&self) -> String {
        match self {
            PendingDisconnect::Client(handle) => format!("client disconnect 0x{handle:08X}"),
            PendingDisconnect::All => "client disconnect".to_string(),
        }
    }
}

/// Caller-supplied settings, read once per connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub role: ClientRole,
    /// Program name announced with `client program`.
    pub program: String,
    /// Station name announced with `client station` (GUI clients only).
    pub station: String,
    /// Persisted GUI client id from a previous session.
    pub client_id: Option<String>,
    /// GUI client id a non-GUI client binds to.
    pub bind_client_id: Option<String>,
    /// Ask the radio for a reduced-bandwidth session.
    pub low_bandwidth_connect: bool,
    /// Ask for reduced-bandwidth DAX audio.
    pub reduced_bandwidth_dax: bool,
    /// Client to kick before this session is set up.
    pub pending_disconnect: Option<PendingDisconnect>,
    /// Request the CW side-channel stream once connected.
    pub request_cw_stream: bool,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            role: ClientRole::Gui,
            program: "flexapi".to_string(),
            station: "flexapi".to_string(),
            client_id: None,
            bind_client_id: None,
            low_bandwidth_connect: false,
            reduced_bandwidth_dax: false,
            pending_disconnect: None,
            request_cw_stream: false,
        }
    }
}

impl ConnectionParams {
    /// Parameters for a GUI client.
    pub fn gui(program: impl Into<String>, station: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            station: station.into(),
            ..Self::default()
        }
    }

    /// Parameters for a non-GUI client.
    pub fn non_gui(program: impl Into<String>) -> Self {
        Self {
            role: ClientRole::NonGui,
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    pub fn with_bind_client_id(mut self, id: impl Into<String>) -> Self {
        self.bind_client_id = Some(id.into());
        self
    }

    pub fn with_low_bandwidth(mut self, enable: bool) -> Self {
        self.low_bandwidth_connect = enable;
        self
    }

    pub fn with_reduced_bandwidth_dax(mut self, enable: bool) -> Self {
        self.reduced_bandwidth_dax = enable;
        self
    }

    pub fn with_pending_disconnect(mut self, pending: PendingDisconnect) -> Self {
        self.pending_disconnect = Some(pending);
        self
    }

    pub fn with_cw_stream(mut self, enable: bool) -> Self {
        self.request_cw_stream = enable;
        self
    }

    pub fn is_gui(&self) -> bool {
        self.role == ClientRole::Gui
    }
}

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

/// Lifecycle state of one `Api` instance.
///
/// `Idle` is both the initial state and the state every teardown returns
/// to. `TcpDisconnected` and `UdpUnbound` are passed through on the way
/// back to `Idle` so observers can see why the session ended.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    TcpConnecting,
    TcpConnected {
        host: IpAddr,
        port: u16,
    },
    WanValidating,
    WanValidated {
        success: bool,
    },
    UdpBinding,
    UdpBound {
        receive_port: u16,
        send_port: u16,
    },
    ClientConnected {
        handle: u32,
        serial: String,
    },
    TcpDisconnected {
        reason: String,
    },
    UdpUnbound {
        reason: String,
    },
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Idle, TcpConnecting) => true,
            (TcpConnecting, TcpConnected { .. } | Idle) => true,
            (TcpConnected { .. }, WanValidating | UdpBinding) => true,
            (WanValidating, WanValidated { .. }) => true,
            (WanValidated { success: true }, UdpBinding) => true,
            (UdpBinding, UdpBound { .. }) => true,
            (UdpBound { .. }, ClientConnected { .. }) => true,
            (TcpDisconnected { .. }, UdpUnbound { .. } | Idle) => true,
            (UdpUnbound { .. }, Idle) => true,
            (
                TcpConnected { .. }
                | WanValidating
                | WanValidated { .. }
                | UdpBinding
                | UdpBound { .. }
                | ClientConnected { .. },
                TcpDisconnected { .. },
            ) => true,
            _ => false,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, ConnectionState::Idle)
    }

    pub fn is_client_connected(&self) -> bool {
        matches!(self, ConnectionState::ClientConnected { .. })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::TcpConnecting => write!(f, "tcp connecting"),
            ConnectionState::TcpConnected { host, port } => {
                write!(f, "tcp connected to {host}:{port}")
            }
            ConnectionState::WanValidating => write!(f, "wan validating"),
            ConnectionState::WanValidated { success } => {
                write!(f, "wan validated (success={success})")
            }
            ConnectionState::UdpBinding => write!(f, "udp binding"),
            ConnectionState::UdpBound {
                receive_port,
                send_port,
            } => write!(f, "udp bound (rx {receive_port}, tx {send_port})"),
            ConnectionState::ClientConnected { handle, serial } => {
                write!(f, "client 0x{handle:08X} connected to {serial}")
            }
            ConnectionState::TcpDisconnected { reason } => write!(f, "tcp disconnected: {reason}"),
            ConnectionState::UdpUnbound { reason } => write!(f, "udp unbound: {reason}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Protocol version
// ---------------------------------------------------------------------------

/// Protocol version announced on the `V` line, e.g. `1.4.0.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub build: u32,
}

impl ProtocolVersion {
    pub const fn new(major: u32, minor: u32, patch: u32, build: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            build,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.patch, self.build
        )
    }
}

/// Error returned when a string is not a dotted four-part version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseVersionError(String);

impl fmt::Display for ParseVersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid protocol version: {}", self.0)
    }
}

impl std::error::Error for ParseVersionError {}

impl FromStr for ProtocolVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 4 {
            return Err(ParseVersionError(s.to_string()));
        }
        let mut nums = [0u32; 4];
        for (slot, part) in nums.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| ParseVersionError(s.to_string()))?;
        }
        Ok(Self::new(nums[0], nums[1], nums[2], nums[3]))
    }
}

// ---------------------------------------------------------------------------
// Connected clients
// ---------------------------------------------------------------------------

/// A client session known to the radio, as reported by `client` status lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuiClient {
    pub handle: u32,
    pub client_id: Option<String>,
    pub program: String,
    pub station: String,
    pub is_local_ptt: bool,
    /// `true` when this record describes our own session.
    pub is_this_client: bool,
}

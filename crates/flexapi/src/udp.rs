//! SmartSDR UDP data channel.
//!
//! [`UdpChannel`] binds the local socket the radio streams VITA-49 packets
//! to, runs the receive loop, and for WAN sessions repeats the
//! `client udp_register` datagram until the first valid packet shows the
//! radio has learned our address.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use flexapi_core::{ApiEvent, Endpoint, Error, Result, StreamPacket};

use crate::vita49;

/// First local port tried for LAN connections.
pub const DEFAULT_FIRST_LOCAL_PORT: u16 = 4991;

/// Number of consecutive local ports tried before giving up.
pub const DEFAULT_BIND_ATTEMPTS: u16 = 20;

/// Spacing of WAN registration datagrams.
pub const DEFAULT_REGISTRATION_INTERVAL: Duration = Duration::from_millis(50);

/// Largest datagram the receive loop accepts.
const MAX_DATAGRAM: usize = 65_536;

/// Consumer of decoded data packets.
pub trait PacketSink: Send + Sync {
    fn deliver(&self, packet: StreamPacket);
}

#[derive(Debug, Clone)]
pub struct UdpOptions {
    /// Local address the socket is bound to.
    pub bind_ip: IpAddr,
    pub first_local_port: u16,
    pub bind_attempts: u16,
    pub registration_interval: Duration,
}

impl Default for UdpOptions {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            first_local_port: DEFAULT_FIRST_LOCAL_PORT,
            bind_attempts: DEFAULT_BIND_ATTEMPTS,
            registration_interval: DEFAULT_REGISTRATION_INTERVAL,
        }
    }
}

/// Ports in use after a successful bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpBinding {
    pub receive_port: u16,
    pub send_port: u16,
}

struct Binding {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    cancel: CancellationToken,
    registered: Arc<AtomicBool>,
}

pub struct UdpChannel {
    options: UdpOptions,
    sink: Arc<dyn PacketSink>,
    events: broadcast::Sender<ApiEvent>,
    binding: RwLock<Option<Arc<Binding>>>,
}

/// Local ports to try and the radio port to send to.
fn select_ports(endpoint: &Endpoint, options: &UdpOptions) -> Result<(Vec<u16>, u16)> {
    if endpoint.uses_hole_punch() {
        let port = endpoint.hole_punch_port.ok_or_else(|| {
            Error::InvalidParameter("hole punch requested without a negotiated port".into())
        })?;
        return Ok((vec![port], port));
    }
    if endpoint.is_wan {
        let port = endpoint.public_udp_port.ok_or_else(|| {
            Error::InvalidParameter("WAN endpoint without a public UDP port".into())
        })?;
        return Ok((vec![port], port));
    }
    let candidates = (0..options.bind_attempts)
        .map_while(|i| options.first_local_port.checked_add(i))
        .collect();
    Ok((candidates, endpoint.udp_port))
}

impl UdpChannel {
    pub fn new(
        options: UdpOptions,
        sink: Arc<dyn PacketSink>,
        events: broadcast::Sender<ApiEvent>,
    ) -> Self {
        Self {
            options,
            sink,
            events,
            binding: RwLock::new(None),
        }
    }

    /// Bind the data socket for `endpoint` and start receiving.
    ///
    /// Local connections scan upward from the first local port; WAN
    /// connections get a single attempt on their negotiated port.
    pub async fn bind(&self, endpoint: &Endpoint) -> Result<UdpBinding> {
        if self.is_bound() {
            return Err(Error::AlreadyConnected);
        }

        let (candidates, send_port) = select_ports(endpoint, &self.options)?;
        let first_port = candidates.first().copied().unwrap_or(0);
        let attempts = candidates.len() as u16;

        let mut socket = None;
        for port in candidates {
            match UdpSocket::bind(SocketAddr::new(self.options.bind_ip, port)).await {
                Ok(s) => {
                    socket = Some(s);
                    break;
                }
                Err(e) => tracing::debug!(port, error = %e, "UDP port unavailable"),
            }
        }
        let socket = socket.ok_or(Error::BindExhausted {
            first_port,
            attempts,
        })?;

        let receive_port = socket.local_addr()?.port();
        let binding = Arc::new(Binding {
            socket: Arc::new(socket),
            target: SocketAddr::new(endpoint.ip, send_port),
            cancel: CancellationToken::new(),
            registered: Arc::new(AtomicBool::new(false)),
        });
        *self.binding.write() = Some(Arc::clone(&binding));

        tokio::spawn(receive_loop(
            binding,
            Arc::clone(&self.sink),
            self.events.clone(),
        ));

        tracing::info!(receive_port, send_port, "UDP channel bound");
        let _ = self.events.send(ApiEvent::UdpBound {
            receive_port,
            send_port,
        });
        Ok(UdpBinding {
            receive_port,
            send_port,
        })
    }

    /// Start sending registration datagrams for `handle` in the background.
    ///
    /// The loop stops once a valid packet has arrived, the channel is
    /// unbound, or a send fails.
    pub fn register(&self, handle: u32) -> Result<()> {
        let binding = self.binding.read().clone().ok_or(Error::NotConnected)?;
        let interval = self.options.registration_interval;
        tokio::spawn(registration_loop(binding, handle, interval));
        Ok(())
    }

    /// Close the socket. Returns `false` if it was not bound.
    pub fn unbind(&self, reason: &str) -> bool {
        let Some(binding) = self.binding.write().take() else {
            return false;
        };
        binding.cancel.cancel();
        binding.registered.store(false, Ordering::SeqCst);
        tracing::debug!(reason = %reason, "UDP channel unbound");
        let _ = self.events.send(ApiEvent::UdpUnbound {
            reason: reason.to_string(),
        });
        true
    }

    pub fn is_bound(&self) -> bool {
        self.binding.read().is_some()
    }

    pub fn is_registered(&self) -> bool {
        self.binding
            .read()
            .as_ref()
            .is_some_and(|b| b.registered.load(Ordering::SeqCst))
    }

    pub fn receive_port(&self) -> Option<u16> {
        self.binding
            .read()
            .as_ref()
            .and_then(|b| b.socket.local_addr().ok())
            .map(|a| a.port())
    }
}

async fn registration_loop(binding: Arc<Binding>, handle: u32, interval: Duration) {
    let datagram = format!("client udp_register handle=0x{:08X}", handle);
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            biased;

            _ = binding.cancel.cancelled() => return,

            _ = ticker.tick() => {}
        }

        if binding.registered.load(Ordering::SeqCst) {
            tracing::debug!(handle = format!("{:08X}", handle), "UDP registration confirmed");
            return;
        }
        if let Err(e) = binding.socket.send_to(datagram.as_bytes(), binding.target).await {
            tracing::warn!(error = %e, "UDP registration send failed");
            return;
        }
    }
}

async fn receive_loop(
    binding: Arc<Binding>,
    sink: Arc<dyn PacketSink>,
    events: broadcast::Sender<ApiEvent>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let received = tokio::select! {
            biased;

            _ = binding.cancel.cancelled() => break,

            r = binding.socket.recv_from(&mut buf) => r,
        };

        let n = match received {
            Ok((n, _)) => n,
            Err(e) => {
                // ICMP port-unreachable and similar surface here; keep going.
                tracing::trace!(error = %e, "UDP recv error");
                continue;
            }
        };

        let packet = match vita49::decode_packet(&buf[..n]) {
            Ok(p) => p,
            Err(e) => {
                tracing::trace!(error = %e, len = n, "Dropping undecodable datagram");
                continue;
            }
        };

        if !binding.registered.swap(true, Ordering::SeqCst) {
            tracing::debug!("First VITA-49 packet received");
            let _ = events.send(ApiEvent::UdpRegistered);
        }

        if packet.packet_type.is_data_with_stream() {
            sink.deliver(packet);
        } else if packet.packet_type.is_context() {
            tracing::warn!(
                stream_id = format!("0x{:08X}", packet.stream_id),
                class_code = format!("0x{:04X}", packet.class_code),
                "Unexpected context packet"
            );
        } else {
            tracing::trace!(
                class_code = format!("0x{:04X}", packet.class_code),
                "Dropping packet without stream id"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use flexapi_test_harness::VitaPacketBuilder;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<StreamPacket>>);

    impl PacketSink for Collect {
        fn deliver(&self, packet: StreamPacket) {
            self.0.lock().push(packet);
        }
    }

    fn loopback() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    fn channel(options: UdpOptions) -> (UdpChannel, Arc<Collect>, broadcast::Receiver<ApiEvent>) {
        let sink = Arc::new(Collect::default());
        let (tx, rx) = broadcast::channel(64);
        (UdpChannel::new(options, sink.clone(), tx), sink, rx)
    }

    /// A base port with at least `span` ports above it.
    async fn base_port(span: u16) -> u16 {
        loop {
            let probe = std::net::UdpSocket::bind((loopback(), 0)).unwrap();
            let port = probe.local_addr().unwrap().port();
            if port.checked_add(span).is_some() {
                return port;
            }
        }
    }

    /// Hold `count` consecutive ports starting at `first`. Ports some other
    /// process already holds count as occupied too.
    fn occupy(first: u16, count: u16) -> Vec<std::net::UdpSocket> {
        (first..first + count)
            .filter_map(|p| std::net::UdpSocket::bind((loopback(), p)).ok())
            .collect()
    }

    fn options_at(first: u16) -> UdpOptions {
        UdpOptions {
            bind_ip: loopback(),
            first_local_port: first,
            ..UdpOptions::default()
        }
    }

    #[test]
    fn port_selection() {
        let opts = UdpOptions::default();
        let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5));

        let (ports, send) = select_ports(&Endpoint::local("s", ip), &opts).unwrap();
        assert_eq!(ports.len(), 20);
        assert_eq!((ports[0], ports[19], send), (4991, 5010, 4993));

        let wan = Endpoint::wan("s", ip, 21000, 22000, "h");
        assert_eq!(select_ports(&wan, &opts).unwrap(), (vec![22000], 22000));

        let punched = wan.with_hole_punch(30000);
        assert_eq!(select_ports(&punched, &opts).unwrap(), (vec![30000], 30000));

        let high = UdpOptions {
            first_local_port: 65530,
            ..UdpOptions::default()
        };
        let (ports, _) = select_ports(&Endpoint::local("s", ip), &high).unwrap();
        assert_eq!(ports.len(), 6);
    }

    #[tokio::test]
    async fn skips_occupied_ports() {
        let first = base_port(DEFAULT_BIND_ATTEMPTS).await;
        let _held = occupy(first, 3);
        // the port after the occupied run must itself be free
        drop(std::net::UdpSocket::bind((loopback(), first + 3)).unwrap());

        let (ch, _sink, mut events) = channel(options_at(first));
        let ep = Endpoint::local("s", loopback());
        let bound = ch.bind(&ep).await.unwrap();

        assert_eq!(bound.receive_port, first + 3);
        assert_eq!(bound.send_port, 4993);
        assert_eq!(ch.receive_port(), Some(first + 3));
        assert!(matches!(
            events.try_recv(),
            Ok(ApiEvent::UdpBound { receive_port, .. }) if receive_port == first + 3
        ));
        assert!(ch.unbind("test"));
    }

    #[tokio::test]
    async fn exhausted_ports_leave_channel_unbound() {
        let first = base_port(DEFAULT_BIND_ATTEMPTS).await;
        let _held = occupy(first, DEFAULT_BIND_ATTEMPTS);

        let (ch, _sink, _events) = channel(options_at(first));
        let err = ch.bind(&Endpoint::local("s", loopback())).await.unwrap_err();
        match err {
            Error::BindExhausted {
                first_port,
                attempts,
            } => {
                assert_eq!(first_port, first);
                assert_eq!(attempts, 20);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(!ch.is_bound());
        assert!(!ch.unbind("test"));
    }

    #[tokio::test]
    async fn receive_path_filters_packets() {
        let first = base_port(DEFAULT_BIND_ATTEMPTS).await;
        let (ch, sink, mut events) = channel(options_at(first));
        let bound = ch.bind(&Endpoint::local("s", loopback())).await.unwrap();
        let _ = events.try_recv();

        let radio = UdpSocket::bind((loopback(), 0)).await.unwrap();
        let to = SocketAddr::new(loopback(), bound.receive_port);

        // foreign OUI: dropped, does not confirm registration
        radio
            .send_to(&VitaPacketBuilder::new(0x8003, 1).oui(0x00_12_34).build(), to)
            .await
            .unwrap();
        radio.send_to(b"junk", to).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!ch.is_registered());

        // context packet: confirms registration but is not forwarded
        radio
            .send_to(&VitaPacketBuilder::new(0x8003, 2).packet_type(4).build(), to)
            .await
            .unwrap();
        radio
            .send_to(&VitaPacketBuilder::meter(&[(1, 5)]).build(), to)
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while sink.0.lock().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(ch.is_registered());
        let got = sink.0.lock().clone();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].class_code, 0x8002);
        assert!(matches!(events.try_recv(), Ok(ApiEvent::UdpRegistered)));
        ch.unbind("test");
    }

    #[tokio::test]
    async fn registration_repeats_until_first_packet() {
        let radio = UdpSocket::bind((loopback(), 0)).await.unwrap();
        let radio_port = radio.local_addr().unwrap().port();

        let first = base_port(DEFAULT_BIND_ATTEMPTS).await;
        let opts = UdpOptions {
            registration_interval: Duration::from_millis(10),
            ..options_at(first)
        };
        let (ch, _sink, _events) = channel(opts);
        let ep = Endpoint::local("s", loopback()).with_udp_port(radio_port);
        let bound = ch.bind(&ep).await.unwrap();
        assert_eq!(bound.send_port, radio_port);

        ch.register(0x1234_ABCD).unwrap();

        let mut buf = [0u8; 128];
        let mut from = None;
        for _ in 0..3 {
            let (n, addr) = tokio::time::timeout(Duration::from_secs(2), radio.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..n], b"client udp_register handle=0x1234ABCD");
            from = Some(addr);
        }
        assert_eq!(from.unwrap().port(), bound.receive_port);

        radio
            .send_to(&VitaPacketBuilder::meter(&[(1, 1)]).build(), from.unwrap())
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !ch.is_registered() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(ch.is_registered());

        // drain anything in flight, then expect silence
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(Ok(_)) =
            tokio::time::timeout(Duration::from_millis(1), radio.recv_from(&mut buf)).await
        {}
        let quiet = tokio::time::timeout(Duration::from_millis(100), radio.recv_from(&mut buf)).await;
        assert!(quiet.is_err(), "registration kept sending after confirmation");
        ch.unbind("test");
    }

    #[tokio::test]
    async fn register_requires_binding() {
        let (ch, _sink, _events) = channel(UdpOptions::default());
        assert!(matches!(ch.register(1), Err(Error::NotConnected)));
    }
}

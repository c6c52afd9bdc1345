//! SmartSDR TCP command channel.
//!
//! [`TcpChannel`] owns the control socket. It picks the port for the
//! endpoint (local, WAN over TLS, or a hole-punched WAN port), allocates
//! command sequence numbers, writes commands, and runs the read loop that
//! forwards each received line to the session task.
//!
//! Every connection gets a generation number. Inbound items carry it so
//! the session can ignore lines and close notices from a connection it has
//! already torn down.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use flexapi_core::{ApiEvent, Endpoint, Error, Result};

use crate::codec;
use crate::correlator::{ReplyCallback, ReplyCorrelator};
use crate::tls;

/// Default TCP connect timeout (5 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Reason reported when the caller closes the channel.
pub const USER_INITIATED: &str = "User Initiated";

/// Items delivered from the read loop to the session task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpInbound {
    /// One line, without its delimiter.
    Line { generation: u64, text: String },
    /// The connection ended without the caller asking for it.
    Closed { generation: u64, reason: String },
}

/// Socket options for [`TcpChannel`].
#[derive(Debug, Clone)]
pub struct TcpOptions {
    pub connect_timeout: Duration,
    /// Local address outbound traffic is bound to when hole punching.
    pub local_interface: Option<IpAddr>,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            local_interface: None,
        }
    }
}

/// Result of a successful connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpConnection {
    pub generation: u64,
    pub host: IpAddr,
    pub port: u16,
}

type ReadHalf = Box<dyn AsyncRead + Send + Unpin>;
type WriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

struct Link {
    generation: u64,
    cancel: CancellationToken,
    open: AtomicBool,
}

struct Writer {
    half: WriteHalf,
    next_seq: u32,
    generation: u64,
}

pub struct TcpChannel {
    options: TcpOptions,
    correlator: Arc<ReplyCorrelator>,
    events: broadcast::Sender<ApiEvent>,
    inbound: mpsc::Sender<TcpInbound>,
    writer: Mutex<Option<Writer>>,
    link: parking_lot::Mutex<Option<Arc<Link>>>,
    next_generation: AtomicU64,
}

/// Pick the remote port and, for hole punching, the local bind address.
fn select_route(endpoint: &Endpoint, options: &TcpOptions) -> Result<(u16, Option<SocketAddr>)> {
    if endpoint.uses_hole_punch() {
        let port = endpoint.hole_punch_port.ok_or_else(|| {
            Error::InvalidParameter("hole punch requested without a negotiated port".into())
        })?;
        let local = options.local_interface.ok_or_else(|| {
            Error::InvalidParameter("hole punch requires a local interface address".into())
        })?;
        return Ok((port, Some(SocketAddr::new(local, port))));
    }
    if endpoint.is_wan {
        let port = endpoint.public_tls_port.ok_or_else(|| {
            Error::InvalidParameter("WAN endpoint without a public TLS port".into())
        })?;
        return Ok((port, None));
    }
    Ok((endpoint.tcp_port, None))
}

async fn open_socket(remote: SocketAddr, local: Option<SocketAddr>) -> std::io::Result<TcpStream> {
    match local {
        Some(local) => {
            let socket = if local.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_reuseaddr(true)?;
            socket.bind(local)?;
            socket.connect(remote).await
        }
        None => TcpStream::connect(remote).await,
    }
}

impl TcpChannel {
    pub fn new(
        options: TcpOptions,
        correlator: Arc<ReplyCorrelator>,
        events: broadcast::Sender<ApiEvent>,
        inbound: mpsc::Sender<TcpInbound>,
    ) -> Self {
        Self {
            options,
            correlator,
            events,
            inbound,
            writer: Mutex::new(None),
            link: parking_lot::Mutex::new(None),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Open the command channel to `endpoint`.
    ///
    /// The sequence counter restarts at 0. For WAN endpoints the TLS
    /// handshake completes before this returns. The TCP connect and the
    /// handshake each get `connect_timeout`.
    pub async fn connect(&self, endpoint: &Endpoint) -> Result<TcpConnection> {
        if self.is_connected() {
            return Err(Error::AlreadyConnected);
        }

        let (port, local) = select_route(endpoint, &self.options)?;
        let remote = SocketAddr::new(endpoint.ip, port);
        tracing::debug!(addr = %remote, wan = endpoint.is_wan, "Connecting to radio");

        let stream = tokio::time::timeout(self.options.connect_timeout, open_socket(remote, local))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::Transport(format!("TCP connect to {} failed: {}", remote, e)))?;

        // Disable Nagle for low-latency command/response.
        let _ = stream.set_nodelay(true);

        let (read, write): (ReadHalf, WriteHalf) = if endpoint.is_wan {
            let tls = tokio::time::timeout(
                self.options.connect_timeout,
                tls::upgrade(stream, endpoint.ip),
            )
            .await
            .map_err(|_| {
                tracing::warn!(addr = %remote, "TLS handshake timed out");
                Error::Timeout
            })??;
            let (r, w) = tokio::io::split(tls);
            (Box::new(r), Box::new(w))
        } else {
            let (r, w) = stream.into_split();
            (Box::new(r), Box::new(w))
        };

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let link = Arc::new(Link {
            generation,
            cancel: CancellationToken::new(),
            open: AtomicBool::new(true),
        });

        *self.writer.lock().await = Some(Writer {
            half: write,
            next_seq: 0,
            generation,
        });
        *self.link.lock() = Some(Arc::clone(&link));

        tokio::spawn(read_loop(
            BufReader::new(read),
            link,
            self.inbound.clone(),
            self.events.clone(),
        ));

        tracing::info!(addr = %remote, generation, "TCP channel connected");
        let _ = self.events.send(ApiEvent::TcpConnected {
            host: endpoint.ip,
            port,
        });

        Ok(TcpConnection {
            generation,
            host: endpoint.ip,
            port,
        })
    }

    /// Send a command and return its sequence number.
    ///
    /// The sequence number is allocated, registered with the correlator and
    /// written under one lock, so concurrent senders get consecutive numbers
    /// in write order. Without a callback the reply goes to the default
    /// handler.
    pub async fn send(
        &self,
        command: &str,
        diagnostic: bool,
        callback: Option<ReplyCallback>,
    ) -> Result<u32> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::NotConnected)?;

        let seq = writer.next_seq;
        writer.next_seq = seq.wrapping_add(1);
        self.correlator.register(seq, command, callback);

        let encoded = codec::encode_command(seq, command, diagnostic);
        let written = match writer.half.write_all(&encoded).await {
            Ok(()) => writer.half.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            self.correlator.discard(seq);
            let generation = writer.generation;
            *guard = None;
            drop(guard);
            let reason = format!("failed to send command: {}", e);
            self.fail(generation, &reason);
            return Err(Error::Transport(reason));
        }

        let line = String::from_utf8_lossy(&encoded[..encoded.len() - 1]).into_owned();
        tracing::trace!(seq, command = %command, "Command sent");
        let _ = self.events.send(ApiEvent::CommandSent {
            sequence: seq,
            line,
        });
        Ok(seq)
    }

    /// Close the channel. Returns `false` if it was not open.
    pub async fn disconnect(&self, reason: &str) -> bool {
        let link = self.link.lock().take();
        let Some(link) = link else {
            return false;
        };
        link.cancel.cancel();

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.half.shutdown().await;
        }

        if link.open.swap(false, Ordering::SeqCst) {
            tracing::debug!(reason = %reason, generation = link.generation, "TCP channel closed");
            let _ = self.events.send(ApiEvent::TcpDisconnected {
                reason: reason.to_string(),
            });
            true
        } else {
            false
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link
            .lock()
            .as_ref()
            .is_some_and(|l| l.open.load(Ordering::SeqCst))
    }

    /// Generation of the current connection, if any.
    pub fn generation(&self) -> Option<u64> {
        self.link.lock().as_ref().map(|l| l.generation)
    }

    /// Close the link after a write error.
    ///
    /// The sender may be the session task itself, so the close notice is
    /// queued from a separate task instead of awaited here.
    fn fail(&self, generation: u64, reason: &str) {
        let link = self.link.lock().clone();
        let Some(link) = link.filter(|l| l.generation == generation) else {
            return;
        };
        if let Some(closed) = close_link(&link, reason, &self.events) {
            let inbound = self.inbound.clone();
            tokio::spawn(async move {
                let _ = inbound.send(closed).await;
            });
        }
    }
}

/// Mark a link closed after a transport failure.
///
/// Returns the notice for the session, or `None` if the link was already
/// closed.
fn close_link(
    link: &Link,
    reason: &str,
    events: &broadcast::Sender<ApiEvent>,
) -> Option<TcpInbound> {
    if !link.open.swap(false, Ordering::SeqCst) {
        return None;
    }
    link.cancel.cancel();
    tracing::warn!(reason = %reason, generation = link.generation, "TCP channel lost");
    let _ = events.send(ApiEvent::TcpDisconnected {
        reason: reason.to_string(),
    });
    Some(TcpInbound::Closed {
        generation: link.generation,
        reason: reason.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Read loop
// ---------------------------------------------------------------------------

/// Background task that reads lines and hands them to the session.
///
/// The next read is only started once the previous line has been accepted
/// by the session channel, so lines are processed in wire order.
async fn read_loop(
    mut reader: BufReader<ReadHalf>,
    link: Arc<Link>,
    inbound: mpsc::Sender<TcpInbound>,
    events: broadcast::Sender<ApiEvent>,
) {
    let mut buf = Vec::new();

    let reason = loop {
        buf.clear();
        let result = tokio::select! {
            biased;

            _ = link.cancel.cancelled() => return,

            r = reader.read_until(b'\n', &mut buf) => r,
        };

        match result {
            Ok(0) => break "Connection closed by radio".to_string(),
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let text = text.trim_end_matches(['\n', '\r']).to_string();
                let item = TcpInbound::Line {
                    generation: link.generation,
                    text,
                };
                if inbound.send(item).await.is_err() {
                    tracing::debug!("Session gone; TCP read loop exiting");
                    return;
                }
            }
            Err(e) => break e.to_string(),
        }
    };

    if let Some(closed) = close_link(&link, &reason, &events) {
        let _ = inbound.send(closed).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

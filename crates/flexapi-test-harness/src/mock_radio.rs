//! Scripted SmartSDR radio for connection-level testing.
//!
//! [`MockRadio`] listens on a random localhost port. Each accepted client
//! is wrapped in a [`RadioSession`] that the test drives line by line:
//! send the version/handle banner, read the commands the client issues,
//! answer them, push status lines, or drop the connection.
//!
//! [`MockRadio::bind_tls`] serves the same script over TLS with a
//! self-signed certificate, the way a radio's public WAN port does.
//!
//! # Example
//!
//! ```no_run
//! use flexapi_test_harness::MockRadio;
//! use std::time::Duration;
//!
//! # async fn example() -> flexapi_core::Result<()> {
//! let radio = MockRadio::bind().await?;
//! // ... point the client at radio.port() ...
//! let mut session = radio.accept().await?;
//! session.handshake("1.4.0.0", 0x1234_5678).await?;
//! let cmd = session.expect_command("info", Duration::from_secs(2)).await?;
//! session.reply(cmd.sequence, 0, "model=FLEX-6600").await?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use flexapi_core::error::{Error, Result};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// Self-signed certificate presented by [`MockRadio::bind_tls`].
const RADIO_CERT: &[u8] = include_bytes!("../certs/radio-cert.der");
const RADIO_KEY: &[u8] = include_bytes!("../certs/radio-key.der");

type ReadHalf = Box<dyn AsyncRead + Send + Unpin>;
type WriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

fn tls_acceptor() -> Result<TlsAcceptor> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let cert = CertificateDer::from(RADIO_CERT.to_vec());
    let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(RADIO_KEY.to_vec()));
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .map_err(|e| Error::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// A command received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedCommand {
    pub sequence: u32,
    pub diagnostic: bool,
    pub text: String,
}

/// Parse a `C[D]<seq>|<text>` line.
pub fn parse_command_line(line: &str) -> Option<ReceivedCommand> {
    let body = line.trim_end_matches(['\n', '\r']).strip_prefix('C')?;
    let (diagnostic, body) = match body.strip_prefix('D') {
        Some(rest) => (true, rest),
        None => (false, body),
    };
    let (seq, text) = body.split_once('|')?;
    Some(ReceivedCommand {
        sequence: seq.parse().ok()?,
        diagnostic,
        text: text.to_string(),
    })
}

/// A listening mock radio.
pub struct MockRadio {
    listener: TcpListener,
    addr: SocketAddr,
    tls: Option<TlsAcceptor>,
}

impl MockRadio {
    /// Listen on `127.0.0.1` with an OS-assigned port.
    pub async fn bind() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::Transport(format!("failed to bind mock radio: {}", e)))?;
        let addr = listener.local_addr().map_err(Error::Io)?;
        Ok(Self {
            listener,
            addr,
            tls: None,
        })
    }

    /// Like [`bind`](Self::bind), but every accepted client must complete
    /// a TLS handshake first.
    pub async fn bind_tls() -> Result<Self> {
        let mut radio = Self::bind().await?;
        radio.tls = Some(tls_acceptor()?);
        Ok(radio)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Accept the next client connection.
    pub async fn accept(&self) -> Result<RadioSession> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| Error::Transport(format!("mock radio accept failed: {}", e)))?;
        tracing::debug!(peer = %peer, tls = self.tls.is_some(), "Mock radio accepted client");
        let (read, write): (ReadHalf, WriteHalf) = match &self.tls {
            Some(acceptor) => {
                let stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| Error::Tls(format!("mock radio handshake failed: {}", e)))?;
                let (r, w) = tokio::io::split(stream);
                (Box::new(r), Box::new(w))
            }
            None => {
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
        };
        Ok(RadioSession {
            reader: BufReader::new(read),
            writer: write,
            received: Vec::new(),
        })
    }

    /// Accept with a deadline.
    pub async fn accept_within(&self, timeout: Duration) -> Result<RadioSession> {
        tokio::time::timeout(timeout, self.accept())
            .await
            .map_err(|_| Error::Timeout)?
    }
}

/// One accepted client connection.
pub struct RadioSession {
    reader: BufReader<ReadHalf>,
    writer: WriteHalf,
    received: Vec<ReceivedCommand>,
}

impl RadioSession {
    /// Write one line; a newline is appended.
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| Error::Transport(format!("mock radio write failed: {}", e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| Error::Transport(format!("mock radio flush failed: {}", e)))
    }

    /// Send the `V` and `H` banner lines.
    pub async fn handshake(&mut self, version: &str, handle: u32) -> Result<()> {
        self.send_line(&format!("V{version}")).await?;
        self.send_line(&format!("H{handle:08X}")).await
    }

    /// Send a status line on behalf of `handle`.
    pub async fn status(&mut self, handle: u32, body: &str) -> Result<()> {
        self.send_line(&format!("S{handle:08X}|{body}")).await
    }

    /// Reply to a command.
    pub async fn reply(&mut self, sequence: u32, code: u32, text: &str) -> Result<()> {
        self.send_line(&format!("R{sequence}|{code:X}|{text}")).await
    }

    /// Read the next command, or `None` if the client closed the connection.
    pub async fn read_command(&mut self, timeout: Duration) -> Result<Option<ReceivedCommand>> {
        loop {
            let mut line = String::new();
            let n = tokio::time::timeout(timeout, self.reader.read_line(&mut line))
                .await
                .map_err(|_| Error::Timeout)?
                .map_err(|e| Error::Transport(format!("mock radio read failed: {}", e)))?;
            if n == 0 {
                return Ok(None);
            }
            match parse_command_line(&line) {
                Some(cmd) => {
                    tracing::trace!(seq = cmd.sequence, command = %cmd.text, "Mock radio received");
                    self.received.push(cmd.clone());
                    return Ok(Some(cmd));
                }
                None => {
                    tracing::warn!(line = %line.trim_end(), "Mock radio ignored non-command line");
                }
            }
        }
    }

    /// Read commands until one whose text starts with `prefix`.
    pub async fn expect_command(
        &mut self,
        prefix: &str,
        timeout: Duration,
    ) -> Result<ReceivedCommand> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.read_command(remaining).await? {
                Some(cmd) if cmd.text.starts_with(prefix) => return Ok(cmd),
                Some(_) => continue,
                None => {
                    return Err(Error::Protocol(format!(
                        "client disconnected before sending {prefix:?}"
                    )));
                }
            }
        }
    }

    /// Wait until the client closes its side, draining any commands.
    pub async fn expect_closed(&mut self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if self.read_command(remaining).await?.is_none() {
                return Ok(());
            }
        }
    }

    /// Every command read so far, in arrival order.
    pub fn received(&self) -> &[ReceivedCommand] {
        &self.received
    }

    /// How many received commands start with `prefix`.
    pub fn count_received(&self, prefix: &str) -> usize {
        self.received
            .iter()
            .filter(|c| c.text.starts_with(prefix))
            .count()
    }

    /// Close the connection from the radio side.
    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

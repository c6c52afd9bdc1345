//! Connection state machine.
//!
//! One session task per [`Api`](crate::Api) owns the connection lifecycle:
//! it runs each connect attempt through TCP connect, WAN validation, UDP
//! bind and registration, declares the client connected on the first
//! status line carrying our handle, sends the setup sequence, and tears
//! everything down when the session ends for any reason.
//!
//! All transitions happen on this task. Callers talk to it through a
//! request channel; callbacks and timers talk to it through a notice
//! channel; the TCP read loop feeds it lines.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use flexapi_core::{
    ApiEvent, ConnectionParams, ConnectionState, Endpoint, Error, PendingDisconnect,
    ProtocolVersion, Result,
};

use crate::builder::ApiOptions;
use crate::clients::{ClientChange, ClientTable};
use crate::correlator::{Reply, ReplyCallback, ReplyCorrelator};
use crate::dispatcher::{LineOutcome, ProtocolDispatcher};
use crate::executor::ModelExecutor;
use crate::pinger::{PingTransport, Pinger};
use crate::setup::{self, SetupStep};
use crate::tcp::{TcpChannel, TcpInbound};
use crate::udp::UdpChannel;

/// State shared between the session task and the `Api` handle.
pub(crate) struct Shared {
    pub events: broadcast::Sender<ApiEvent>,
    pub state: watch::Sender<ConnectionState>,
    pub tcp: Arc<TcpChannel>,
    pub udp: UdpChannel,
    pub correlator: Arc<ReplyCorrelator>,
    pub executor: ModelExecutor,
    pub clients: Arc<ClientTable>,
    pub handle: RwLock<Option<u32>>,
    /// Survives teardown so callers can persist it.
    pub client_id: Arc<RwLock<Option<String>>>,
    pub version: RwLock<Option<(String, Option<ProtocolVersion>)>>,
}

/// Requests from the `Api` handle.
pub(crate) enum Request {
    Connect {
        endpoint: Endpoint,
        params: ConnectionParams,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reason: String,
        reply: oneshot::Sender<()>,
    },
}

/// Notices posted back to the session by callbacks and timers.
#[derive(Debug)]
enum Notice {
    WanValidated { generation: u64, success: bool },
    PingTimeout { generation: u64 },
    Reconnect {
        endpoint: Endpoint,
        params: ConnectionParams,
    },
}

/// The connect attempt in progress.
struct Attempt {
    endpoint: Endpoint,
    params: ConnectionParams,
    generation: u64,
    setup_sent: bool,
    register_pending: bool,
}

struct Session {
    shared: Arc<Shared>,
    options: ApiOptions,
    dispatcher: ProtocolDispatcher,
    notices: mpsc::UnboundedSender<Notice>,
    attempt: Option<Attempt>,
    pinger: Option<Pinger>,
    reconnect: Option<CancellationToken>,
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

pub(crate) fn spawn(
    shared: Arc<Shared>,
    options: ApiOptions,
    dispatcher: ProtocolDispatcher,
    requests: mpsc::Receiver<Request>,
    tcp_rx: mpsc::Receiver<TcpInbound>,
    cancel: CancellationToken,
) {
    let (notices, notice_rx) = mpsc::unbounded_channel();
    let session = Session {
        shared,
        options,
        dispatcher,
        notices,
        attempt: None,
        pinger: None,
        reconnect: None,
    };
    tokio::spawn(session_loop(session, requests, notice_rx, tcp_rx, cancel));
}

/// The session task.
///
/// Uses `tokio::select! { biased; }` to prioritize:
/// 1. Cancellation
/// 2. Internal notices (validation replies, ping timeout, reconnect)
/// 3. Caller requests
/// 4. Lines from the radio
async fn session_loop(
    mut session: Session,
    mut requests: mpsc::Receiver<Request>,
    mut notices: mpsc::UnboundedReceiver<Notice>,
    mut tcp_rx: mpsc::Receiver<TcpInbound>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!("Session task cancelled");
                break;
            }

            Some(notice) = notices.recv() => session.handle_notice(notice).await,

            req = requests.recv() => match req {
                Some(req) => session.handle_request(req).await,
                None => {
                    tracing::debug!("Api handle dropped; session task exiting");
                    break;
                }
            },

            Some(item) = tcp_rx.recv() => session.handle_tcp(item).await,
        }
    }

    session.cancel_reconnect();
    session.teardown("Api closed").await;
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

impl Session {
    fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    fn emit(&self, event: ApiEvent) {
        let _ = self.shared.events.send(event);
    }

    fn own_handle(&self) -> Option<u32> {
        *self.shared.handle.read()
    }

    /// Move to `next` if the transition is legal.
    fn transition(&self, next: ConnectionState) -> bool {
        let current = self.state();
        if !current.can_transition_to(&next) {
            tracing::warn!(from = %current, to = %next, "Illegal state transition ignored");
            return false;
        }
        tracing::debug!(from = %current, to = %next, "State transition");
        self.shared.state.send_replace(next.clone());
        self.emit(ApiEvent::StateChanged(next));
        true
    }

    fn cancel_reconnect(&mut self) {
        if let Some(token) = self.reconnect.take() {
            token.cancel();
        }
    }

    async fn handle_request(&mut self, req: Request) {
        match req {
            Request::Connect {
                endpoint,
                params,
                reply,
            } => {
                self.cancel_reconnect();
                let result = self.start_attempt(endpoint, params).await;
                let _ = reply.send(result);
            }
            Request::Disconnect { reason, reply } => {
                self.cancel_reconnect();
                self.teardown(&reason).await;
                let _ = reply.send(());
            }
        }
    }

    async fn handle_notice(&mut self, notice: Notice) {
        match notice {
            Notice::WanValidated {
                generation,
                success,
            } => {
                if !self.is_current(generation) || self.state() != ConnectionState::WanValidating {
                    tracing::trace!(generation, "Stale WAN validation reply ignored");
                    return;
                }
                self.emit(ApiEvent::WanValidated { success });
                self.transition(ConnectionState::WanValidated { success });
                if success {
                    let _ = self.bind_udp().await;
                } else {
                    tracing::warn!("WAN validation rejected by radio");
                    self.teardown("WAN validation failed").await;
                }
            }
            Notice::PingTimeout { generation } => {
                if self.is_current(generation) {
                    self.teardown("Ping timeout").await;
                }
            }
            Notice::Reconnect { endpoint, params } => {
                self.reconnect = None;
                tracing::info!(serial = %endpoint.serial, "Reconnecting after pending disconnect");
                if let Err(e) = self.start_attempt(endpoint, params).await {
                    tracing::error!(error = %e, "Reconnect failed");
                }
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.attempt
            .as_ref()
            .is_some_and(|a| a.generation == generation)
    }

    // -----------------------------------------------------------------------
    // Connect
    // -----------------------------------------------------------------------

    async fn start_attempt(&mut self, endpoint: Endpoint, params: ConnectionParams) -> Result<()> {
        if !self.state().is_idle() || self.attempt.is_some() {
            tracing::warn!(state = %self.state(), "Connect requested while not idle");
            return Err(Error::AlreadyConnected);
        }

        tracing::info!(
            serial = %endpoint.serial,
            ip = %endpoint.ip,
            wan = endpoint.is_wan,
            "Connecting"
        );
        self.transition(ConnectionState::TcpConnecting);

        let conn = match self.shared.tcp.connect(&endpoint).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "TCP connect failed");
                self.transition(ConnectionState::Idle);
                return Err(e);
            }
        };

        self.transition(ConnectionState::TcpConnected {
            host: conn.host,
            port: conn.port,
        });
        let is_wan = endpoint.is_wan;
        let wan_handle = endpoint.wan_connection_handle.clone().unwrap_or_default();
        self.attempt = Some(Attempt {
            endpoint,
            params,
            generation: conn.generation,
            setup_sent: false,
            register_pending: false,
        });

        if !is_wan {
            return self.bind_udp().await;
        }

        self.transition(ConnectionState::WanValidating);
        let notices = self.notices.clone();
        let generation = conn.generation;
        let on_reply: ReplyCallback = Box::new(move |reply: &Reply| {
            let _ = notices.send(Notice::WanValidated {
                generation,
                success: reply.is_ok(),
            });
        });
        let command = format!("wan validate handle={wan_handle}");
        if let Err(e) = self.shared.tcp.send(&command, false, Some(on_reply)).await {
            self.teardown(&e.to_string()).await;
            return Err(e);
        }
        Ok(())
    }

    async fn bind_udp(&mut self) -> Result<()> {
        let Some(endpoint) = self.attempt.as_ref().map(|a| a.endpoint.clone()) else {
            return Err(Error::NotConnected);
        };
        self.transition(ConnectionState::UdpBinding);

        let binding = match self.shared.udp.bind(&endpoint).await {
            Ok(binding) => binding,
            Err(e) => {
                tracing::error!(error = %e, "UDP bind failed");
                self.teardown(&format!("UDP bind failed: {e}")).await;
                return Err(e);
            }
        };
        self.transition(ConnectionState::UdpBound {
            receive_port: binding.receive_port,
            send_port: binding.send_port,
        });

        if endpoint.is_wan {
            match self.own_handle() {
                Some(handle) => self.start_registration(handle),
                None => {
                    if let Some(attempt) = self.attempt.as_mut() {
                        attempt.register_pending = true;
                    }
                }
            }
        }
        Ok(())
    }

    fn start_registration(&mut self, handle: u32) {
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.register_pending = false;
        }
        if let Err(e) = self.shared.udp.register(handle) {
            tracing::warn!(error = %e, "UDP registration not started");
        }
    }

    // -----------------------------------------------------------------------
    // Inbound lines
    // -----------------------------------------------------------------------

    async fn handle_tcp(&mut self, item: TcpInbound) {
        match item {
            TcpInbound::Line { generation, text } => {
                if !self.is_current(generation) {
                    tracing::trace!(generation, "Line from a previous connection ignored");
                    return;
                }
                let outcome = self.dispatcher.dispatch_line(&text);
                self.handle_outcome(outcome).await;
            }
            TcpInbound::Closed { generation, reason } => {
                if self.is_current(generation) {
                    self.teardown(&reason).await;
                } else {
                    tracing::trace!(generation, "Close of a previous connection ignored");
                }
            }
        }
    }

    async fn handle_outcome(&mut self, outcome: LineOutcome) {
        match outcome {
            LineOutcome::Handle(handle) => {
                tracing::debug!(handle = format!("{:08X}", handle), "Handle assigned");
                *self.shared.handle.write() = Some(handle);
                self.shared.clients.set_own_handle(Some(handle));
                let pending = self.attempt.as_ref().is_some_and(|a| a.register_pending);
                if pending && self.shared.udp.is_bound() {
                    self.start_registration(handle);
                }
            }
            LineOutcome::Version { raw, parsed } => {
                tracing::debug!(version = %raw, "Radio protocol version");
                if let Some(radio) = parsed {
                    let api = self.options.api_version;
                    if radio.major != api.major {
                        tracing::warn!(radio = %radio, api = %api, "Protocol version mismatch");
                        self.emit(ApiEvent::VersionMismatch { radio, api });
                    }
                }
                *self.shared.version.write() = Some((raw, parsed));
            }
            LineOutcome::Status {
                handle,
                client_change,
            } => {
                let own = self.own_handle();
                if let Some(ClientChange::Removed {
                    handle: removed,
                    reason,
                    ..
                }) = &client_change
                {
                    if own == Some(*removed) {
                        tracing::warn!(reason = %reason, "Radio disconnected this client");
                        let reason = reason.clone();
                        self.teardown(&reason).await;
                        return;
                    }
                }
                if own == Some(handle) && matches!(self.state(), ConnectionState::UdpBound { .. }) {
                    self.on_client_connected(handle).await;
                }
            }
            LineOutcome::Routed => {}
        }
    }

    async fn on_client_connected(&mut self, handle: u32) {
        let Some(attempt) = self.attempt.as_ref() else {
            return;
        };
        let serial = attempt.endpoint.serial.clone();
        let pending = attempt.params.pending_disconnect;

        self.transition(ConnectionState::ClientConnected {
            handle,
            serial: serial.clone(),
        });
        tracing::info!(
            handle = format!("{:08X}", handle),
            serial = %serial,
            "Client connected"
        );
        self.emit(ApiEvent::ClientConnected { handle });

        match pending {
            Some(pending) => self.kick_and_reconnect(pending).await,
            None => self.run_setup().await,
        }
    }

    /// Send the setup sequence once per attempt and start the pinger.
    async fn run_setup(&mut self) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        if attempt.setup_sent {
            return;
        }
        attempt.setup_sent = true;
        let generation = attempt.generation;
        let steps = setup::setup_commands(
            &attempt.params,
            self.shared.udp.receive_port(),
            attempt.endpoint.is_wan,
        );

        for step in steps {
            let callback = match step {
                SetupStep::ClientGui(_) => Some(self.client_id_capture()),
                SetupStep::Plain(_) => None,
            };
            if let Err(e) = self.shared.tcp.send(step.command(), false, callback).await {
                tracing::warn!(error = %e, command = step.command(), "Setup aborted");
                return;
            }
        }

        let notices = self.notices.clone();
        let transport: Arc<dyn PingTransport> = self.shared.tcp.clone();
        self.pinger = Some(Pinger::start(
            transport,
            self.options.pinger(),
            self.shared.events.clone(),
            move || {
                let _ = notices.send(Notice::PingTimeout { generation });
            },
        ));
    }

    fn client_id_capture(&self) -> ReplyCallback {
        let slot = Arc::clone(&self.shared.client_id);
        Box::new(move |reply: &Reply| {
            let id = reply.text.trim();
            if reply.is_ok() && !id.is_empty() {
                tracing::debug!(client_id = %id, "GUI client id assigned");
                *slot.write() = Some(id.to_string());
            } else if !reply.is_ok() {
                tracing::warn!(code = %reply.code, "client gui rejected");
            }
        })
    }

    /// Kick the client named by `pending`, then reconnect after the settle
    /// delay with the same endpoint and no pending disconnect.
    async fn kick_and_reconnect(&mut self, pending: PendingDisconnect) {
        let Some(attempt) = self.attempt.as_ref() else {
            return;
        };
        let endpoint = attempt.endpoint.clone();
        let mut params = attempt.params.clone();
        params.pending_disconnect = None;

        let command = pending.command();
        tracing::info!(command = %command, "Disconnecting client before reconnect");
        if let Err(e) = self.shared.tcp.send(&command, false, None).await {
            tracing::warn!(error = %e, "Pending disconnect command not sent");
        }
        self.teardown("Pending disconnect").await;

        let token = CancellationToken::new();
        self.reconnect = Some(token.clone());
        let notices = self.notices.clone();
        let settle = self.options.reconnect_settle;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(settle) => {
                    let _ = notices.send(Notice::Reconnect { endpoint, params });
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// End the current session and return to `Idle`.
    ///
    /// Safe to call in any state; does nothing when already idle.
    async fn teardown(&mut self, reason: &str) {
        let state = self.state();
        if state.is_idle() && self.attempt.is_none() {
            return;
        }
        tracing::info!(reason = %reason, state = %state, "Tearing down session");

        if let Some(pinger) = self.pinger.take() {
            pinger.stop();
        }
        let was_connected = state.is_client_connected();
        self.emit(ApiEvent::RadioWillBeRemoved);

        self.shared.tcp.disconnect(reason).await;
        if state != ConnectionState::TcpConnecting {
            self.transition(ConnectionState::TcpDisconnected {
                reason: reason.to_string(),
            });
        }
        if self.shared.udp.unbind(reason) {
            self.transition(ConnectionState::UdpUnbound {
                reason: reason.to_string(),
            });
        }

        let dropped = self.shared.correlator.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "Pending replies dropped");
        }
        self.shared.clients.clear();
        self.dispatcher.clear_model();
        *self.shared.handle.write() = None;
        *self.shared.version.write() = None;
        self.attempt = None;

        if was_connected {
            self.emit(ApiEvent::ClientDisconnected);
        }
        self.emit(ApiEvent::RadioRemoved);
        self.transition(ConnectionState::Idle);
    }
}

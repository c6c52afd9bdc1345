//! Public handle to one connection core.
//!
//! An [`Api`] owns the session task, the TCP and UDP channels and the model
//! executor. It connects to one radio at a time. Lifecycle changes are
//! observable through [`Api::subscribe`] and [`Api::watch_state`].

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use flexapi_core::{
    ApiEvent, ConnectionParams, ConnectionState, Endpoint, Error, GuiClient, MeterSink,
    ProtocolVersion, Result,
};

use crate::builder::{ApiBuilder, ApiOptions};
use crate::clients::ClientTable;
use crate::correlator::{Reply, ReplyCorrelator, reply_channel};
use crate::dispatcher::{PacketRouter, ProtocolDispatcher, StreamRegistry};
use crate::executor::{Model, ModelExecutor};
use crate::session::{self, Request, Shared};
use crate::tcp::{TcpChannel, USER_INITIATED};
use crate::udp::UdpChannel;

/// Lines buffered between the TCP read loop and the session task.
const TCP_INBOUND_CAPACITY: usize = 256;

/// Pending caller requests.
const REQUEST_CAPACITY: usize = 32;

/// Handle to the SmartSDR connection core.
///
/// Dropping the handle tears down any active session and stops the
/// background tasks.
pub struct Api {
    shared: Arc<Shared>,
    requests: mpsc::Sender<Request>,
    cancel: CancellationToken,
}

impl Api {
    /// Start configuring a new instance.
    pub fn builder() -> ApiBuilder {
        ApiBuilder::new()
    }

    /// An instance with default options and no model collaborators.
    pub fn new() -> Self {
        ApiBuilder::new().build()
    }

    pub(crate) fn start(
        options: ApiOptions,
        model: Model,
        streams: StreamRegistry,
        meters: Option<Arc<dyn MeterSink>>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (events, _) = broadcast::channel(options.event_capacity);
        let (executor, _task) = ModelExecutor::spawn(model, cancel.child_token());
        let correlator = Arc::new(ReplyCorrelator::new(executor.clone()));

        let (tcp_tx, tcp_rx) = mpsc::channel(TCP_INBOUND_CAPACITY);
        let tcp = Arc::new(TcpChannel::new(
            options.tcp(),
            Arc::clone(&correlator),
            events.clone(),
            tcp_tx,
        ));

        let streams = Arc::new(streams);
        let router = Arc::new(PacketRouter::new(Arc::clone(&streams), meters));
        let udp = UdpChannel::new(options.udp(), router, events.clone());
        let clients = Arc::new(ClientTable::new(events.clone()));

        let dispatcher = ProtocolDispatcher::new(
            Arc::clone(&correlator),
            executor.clone(),
            Arc::clone(&clients),
            streams,
            events.clone(),
        );

        let (state, _) = watch::channel(ConnectionState::Idle);
        let shared = Arc::new(Shared {
            events,
            state,
            tcp,
            udp,
            correlator,
            executor,
            clients,
            handle: RwLock::new(None),
            client_id: Arc::new(RwLock::new(None)),
            version: RwLock::new(None),
        });

        let (requests, request_rx) = mpsc::channel(REQUEST_CAPACITY);
        session::spawn(
            Arc::clone(&shared),
            options,
            dispatcher,
            request_rx,
            tcp_rx,
            cancel.clone(),
        );

        Self {
            shared,
            requests,
            cancel,
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Connect to `endpoint`.
    ///
    /// Returns once the TCP channel is up and, for LAN radios, the UDP
    /// channel is bound. The session is fully established when the state
    /// reaches [`ConnectionState::ClientConnected`]. Fails with
    /// [`Error::AlreadyConnected`] unless the state is `Idle`.
    pub async fn connect(&self, endpoint: Endpoint, params: ConnectionParams) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.requests
            .send(Request::Connect {
                endpoint,
                params,
                reply,
            })
            .await
            .map_err(|_| Error::NotConnected)?;

        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::NotConnected),
        }
    }

    /// Connect to the radio at `index` in a discovery list.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range. Choosing a radio that was never
    /// listed is a caller bug.
    pub async fn connect_to(
        &self,
        radios: &[Endpoint],
        index: usize,
        params: ConnectionParams,
    ) -> Result<()> {
        assert!(
            index < radios.len(),
            "radio index {index} out of range ({} radios)",
            radios.len()
        );
        self.connect(radios[index].clone(), params).await
    }

    /// End the session with reason `"User Initiated"`.
    ///
    /// Also cancels a reconnect that is waiting out its settle delay.
    pub async fn disconnect(&self) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.requests
            .send(Request::Disconnect {
                reason: USER_INITIATED.to_string(),
                reply,
            })
            .await
            .map_err(|_| Error::NotConnected)?;
        reply_rx.await.map_err(|_| Error::NotConnected)
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Send a command; its reply goes to the default handler.
    pub async fn send(&self, command: &str) -> Result<u32> {
        self.shared.tcp.send(command, false, None).await
    }

    /// Send a command in diagnostic form (`CD<seq>|...`).
    pub async fn send_diagnostic(&self, command: &str) -> Result<u32> {
        self.shared.tcp.send(command, true, None).await
    }

    /// Send a command and run `on_reply` when its reply arrives.
    ///
    /// The callback runs on the session task and must not block.
    pub async fn send_with_callback(
        &self,
        command: &str,
        on_reply: impl FnOnce(&Reply) + Send + 'static,
    ) -> Result<u32> {
        self.shared
            .tcp
            .send(command, false, Some(Box::new(on_reply)))
            .await
    }

    /// Send a command and wait for its reply.
    ///
    /// There is no timeout. If the session ends first the result is
    /// [`Error::ConnectionLost`].
    pub async fn request(&self, command: &str) -> Result<Reply> {
        let (callback, reply_rx) = reply_channel();
        self.shared.tcp.send(command, false, Some(callback)).await?;
        reply_rx.await.map_err(|_| Error::ConnectionLost)
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ApiEvent> {
        self.shared.events.subscribe()
    }

    /// Handle the radio assigned to this session.
    pub fn handle(&self) -> Option<u32> {
        *self.shared.handle.read()
    }

    /// GUI client id from the last `client gui` reply.
    pub fn client_id(&self) -> Option<String> {
        self.shared.client_id.read().clone()
    }

    /// Raw version string from the radio's `V` line.
    pub fn version(&self) -> Option<String> {
        self.shared.version.read().as_ref().map(|(raw, _)| raw.clone())
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.shared.version.read().as_ref().and_then(|(_, v)| *v)
    }

    /// Client sessions currently known on the radio.
    pub fn clients(&self) -> Vec<GuiClient> {
        self.shared.clients.snapshot()
    }

    /// Whether the radio has started streaming to our UDP socket.
    pub fn is_udp_registered(&self) -> bool {
        self.shared.udp.is_registered()
    }

    pub fn udp_port(&self) -> Option<u16> {
        self.shared.udp.receive_port()
    }

    /// Commands still waiting for a reply.
    pub fn pending_replies(&self) -> usize {
        self.shared.correlator.pending_count()
    }

    /// Wait until every model update queued so far has run.
    pub async fn flush_model(&self) {
        self.shared.executor.flush().await;
    }
}

impl Default for Api {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Api {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

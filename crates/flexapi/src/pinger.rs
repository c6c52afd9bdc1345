//! Keepalive pinger for the command channel.
//!
//! Sends `ping` at a fixed cadence and watches for replies. When no reply
//! has arrived for longer than the timeout window, it emits
//! [`ApiEvent::PingTimeout`] once, runs the timeout hook and stops.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use flexapi_core::{ApiEvent, Result};

use crate::correlator::{Reply, ReplyCallback};
use crate::tcp::TcpChannel;

/// Default ping cadence (1 second).
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(1);

/// Default reply timeout window (30 seconds).
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(30);

/// Channel the pinger sends through.
#[async_trait]
pub trait PingTransport: Send + Sync {
    /// Send one ping; `on_reply` runs when the radio answers it.
    async fn send_ping(&self, on_reply: ReplyCallback) -> Result<u32>;
}

#[async_trait]
impl PingTransport for TcpChannel {
    async fn send_ping(&self, on_reply: ReplyCallback) -> Result<u32> {
        self.send("ping", false, Some(on_reply)).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PingerOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PingerOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_PING_INTERVAL,
            timeout: DEFAULT_PING_TIMEOUT,
        }
    }
}

/// A running pinger. Dropping it stops the task.
pub struct Pinger {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Pinger {
    pub fn start(
        transport: Arc<dyn PingTransport>,
        options: PingerOptions,
        events: broadcast::Sender<ApiEvent>,
        on_timeout: impl FnOnce() + Send + 'static,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(ping_loop(
            transport,
            options,
            events,
            Box::new(on_timeout),
            cancel.clone(),
        ));
        Self { cancel, task }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Pinger {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn ping_loop(
    transport: Arc<dyn PingTransport>,
    options: PingerOptions,
    events: broadcast::Sender<ApiEvent>,
    on_timeout: Box<dyn FnOnce() + Send>,
    cancel: CancellationToken,
) {
    let last_reply = Arc::new(Mutex::new(Instant::now()));
    let mut ticker = tokio::time::interval(options.interval);
    tracing::debug!(
        interval_ms = options.interval.as_millis() as u64,
        timeout_ms = options.timeout.as_millis() as u64,
        "Pinger started"
    );
    let _ = events.send(ApiEvent::PingStarted);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!("Pinger stopped");
                return;
            }

            _ = ticker.tick() => {}
        }

        let silent_for = last_reply.lock().elapsed();
        if silent_for > options.timeout {
            tracing::warn!(
                silent_ms = silent_for.as_millis() as u64,
                "No ping reply within timeout"
            );
            let _ = events.send(ApiEvent::PingTimeout);
            on_timeout();
            return;
        }

        let sent_at = Instant::now();
        let last = Arc::clone(&last_reply);
        let reply_events = events.clone();
        let on_reply: ReplyCallback = Box::new(move |_reply: &Reply| {
            let now = Instant::now();
            *last.lock() = now;
            let _ = reply_events.send(ApiEvent::PingResponse {
                round_trip: now - sent_at,
            });
        });

        if let Err(e) = transport.send_ping(on_reply).await {
            tracing::debug!(error = %e, "Ping send failed; pinger exiting");
            return;
        }
    }
}

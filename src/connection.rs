#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant as TokioInstant, interval_at, sleep, timeout_at};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::Result;
use crate::config::Config;
use crate::error::Error;
use crate::events::{Event, EventKind, ListenerId, ListenerRegistry, Payload};
use crate::transport::{Connector, Transport as _, TransportEvent, WsConnector};

/// Heartbeat probe token sent on the wire.
const PING: &str = "ping";
/// Heartbeat acknowledgement token expected from the peer.
const PONG: &str = "pong";

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Successfully connected
    Connected {
        /// When the connection was established
        since: Instant,
    },
    /// Reconnecting after unexpected loss
    Reconnecting {
        /// Current reconnection attempt number
        attempt: u32,
    },
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// Manages one logical WebSocket connection: lifecycle, reconnection,
/// heartbeat, and listener fan-out.
///
/// The manager dials through an injected [`Connector`] and drives the
/// resulting transport from a background session task. Callers register
/// listeners per [`EventKind`], send payloads while the connection is open,
/// and tear everything down with [`disconnect`](Self::disconnect).
///
/// - An unexpected close schedules reconnection with exponential backoff,
///   capped at the configured attempt limit. After the cap the manager stays
///   [`ConnectionState::Disconnected`] until [`connect`](Self::connect) is
///   called again; no dedicated "gave up" event is emitted.
/// - Sends while not connected return `false` and are never queued.
/// - An application-level `ping`/`pong` heartbeat bounds dead-connection
///   detection; a missed acknowledgement force-closes the transport and runs
///   the normal close/reconnect path.
///
/// # Example
///
/// ```rust,no_run
/// use chatwire::{Config, ConnectionManager, EventKind};
///
/// #[tokio::main]
/// async fn main() -> chatwire::Result<()> {
///     let manager =
///         ConnectionManager::new("wss://chat.example.com/room/42".to_owned(), Config::default())?;
///
///     manager.add_event_listener(EventKind::Message, |event| {
///         println!("inbound: {event:?}");
///     });
///
///     manager.connect().await?;
///     manager.send_text("hello".to_owned());
///     manager.disconnect();
///
///     Ok(())
/// }
/// ```
pub struct ConnectionManager<C: Connector = WsConnector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<C: Connector> {
    /// Target endpoint, validated as a ws/wss URL at construction
    endpoint: String,
    /// Heartbeat and reconnection configuration
    config: Config,
    /// Factory for new transports
    connector: C,
    /// Per-kind listener callbacks
    listeners: ListenerRegistry,
    /// Watch channel sender for state changes (enables reconnection detection)
    state_tx: watch::Sender<ConnectionState>,
    /// Watch channel receiver for state changes (for checking the current state)
    state_rx: watch::Receiver<ConnectionState>,
    /// Outbound writer for the currently open transport; `None` while closed.
    /// Each epoch gets a fresh channel so nothing queued ever outlives the
    /// connection it was accepted on.
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    /// Cancellation token for the active session loop, if any
    session: Mutex<Option<CancellationToken>>,
    /// Set by `disconnect()` so the eventual close does not reconnect
    intentional_close: AtomicBool,
}

impl ConnectionManager<WsConnector> {
    /// Create a manager that dials with the default tokio-tungstenite
    /// connector. No connection is attempted until [`connect`](Self::connect).
    pub fn new(endpoint: String, config: Config) -> Result<Self> {
        Self::with_connector(endpoint, config, WsConnector)
    }
}

impl<C: Connector> ConnectionManager<C> {
    /// Create a manager with an injected [`Connector`].
    ///
    /// The endpoint must be a valid `ws://` or `wss://` URL.
    pub fn with_connector(endpoint: String, config: Config, connector: C) -> Result<Self> {
        let url = Url::parse(&endpoint)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "endpoint must use the ws or wss scheme, got {}",
                url.scheme()
            )));
        }

        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            inner: Arc::new(Inner {
                endpoint,
                config,
                connector,
                listeners: ListenerRegistry::new(),
                state_tx,
                state_rx,
                writer: Mutex::new(None),
                session: Mutex::new(None),
                intentional_close: AtomicBool::new(false),
            }),
        })
    }

    /// Establish the connection.
    ///
    /// Safe to call from any state: any existing session is torn down first
    /// so at most one transport is ever live. Resolves `Ok(())` once the
    /// transport is open (after the `Open` event has been emitted) and
    /// returns the dial error otherwise; a failed dial from this path is
    /// never retried automatically.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;

        inner.cancel_session();
        inner.clear_writer();
        inner.intentional_close.store(false, Ordering::SeqCst);
        _ = inner.state_tx.send(ConnectionState::Connecting);

        let transport = match inner.connector.connect(&inner.endpoint).await {
            Ok(transport) => transport,
            Err(e) => {
                _ = inner.state_tx.send(ConnectionState::Disconnected);
                inner.listeners.emit(&Event::Error {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        // disconnect() may have raced with the dial; honor it.
        if inner.intentional_close.load(Ordering::SeqCst) {
            let mut transport = transport;
            _ = transport.close().await;
            return Err(Error::validation("connection torn down during connect"));
        }

        let token = CancellationToken::new();
        *inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(token.clone());

        let out_rx = inner.open_epoch();
        let this = Arc::clone(inner);
        tokio::spawn(async move {
            Inner::connection_loop(this, transport, out_rx, token).await;
        });

        Ok(())
    }

    /// Tear the connection down. Idempotent.
    ///
    /// Listener teardown precedes transport teardown so an event racing in
    /// from the session task finds nobody to notify; in particular no
    /// reconnect is ever scheduled after this call. The instance is inert
    /// afterwards until [`connect`](Self::connect) is called again.
    pub fn disconnect(&self) {
        let inner = &self.inner;

        inner.intentional_close.store(true, Ordering::SeqCst);
        inner.listeners.clear();
        inner.cancel_session();
        inner.clear_writer();
        _ = inner.state_tx.send(ConnectionState::Disconnected);
    }

    /// Serialize a payload as JSON and transmit it.
    ///
    /// Returns `false` when the connection is not open or serialization
    /// fails; nothing is queued for later delivery. For raw text use
    /// [`send_text`](Self::send_text), which does not JSON-encode.
    pub fn send<R: Serialize>(&self, payload: &R) -> bool {
        match serde_json::to_string(payload) {
            Ok(json) => self.send_raw(json),
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Unable to serialize outbound payload: {e:?}");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                false
            }
        }
    }

    /// Transmit a text payload unchanged.
    ///
    /// Returns `false` when the connection is not open; nothing is queued.
    pub fn send_text(&self, text: String) -> bool {
        self.send_raw(text)
    }

    fn send_raw(&self, text: String) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.inner
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| tx.send(text).is_ok())
    }

    /// Check whether the transport is currently open. No side effects.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Subscribe to connection state changes.
    ///
    /// Returns a receiver that notifies when the connection state changes.
    /// This is useful for detecting recovery after reconnection, or that the
    /// retry budget is exhausted (the state settles on
    /// [`ConnectionState::Disconnected`]).
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Register a listener for an event kind.
    ///
    /// Returns the handle that identifies this registration for
    /// [`remove_event_listener`](Self::remove_event_listener).
    pub fn add_event_listener<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.listeners.add(kind, listener)
    }

    /// Remove a previously registered listener.
    ///
    /// Returns whether a registration was removed.
    pub fn remove_event_listener(&self, kind: EventKind, id: ListenerId) -> bool {
        self.inner.listeners.remove(kind, id)
    }
}

/// How one connection epoch ended.
enum SessionEnd {
    /// Torn down via the session token; no events are emitted
    Cancelled,
    /// The peer closed the connection
    Closed {
        code: Option<u16>,
        reason: Option<String>,
    },
    /// The transport reported an error
    Failed(Error),
    /// The heartbeat deadline fired without an acknowledgement
    HeartbeatTimeout,
}

/// One multiplexer turn of the session loop.
enum Step {
    Cancelled,
    Dead,
    Inbound(Option<Result<TransportEvent>>),
    Outbound(String),
    Probe,
}

impl<C: Connector> Inner<C> {
    /// Install a fresh outbound channel for a newly opened transport,
    /// publish the state, and notify listeners.
    fn open_epoch(&self) -> mpsc::UnboundedReceiver<String> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        *self.writer.lock().unwrap_or_else(PoisonError::into_inner) = Some(out_tx);
        _ = self.state_tx.send(ConnectionState::Connected {
            since: Instant::now(),
        });
        self.listeners.emit(&Event::Open);
        out_rx
    }

    fn clear_writer(&self) {
        *self.writer.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn cancel_session(&self) {
        if let Some(token) = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }

    /// Main connection loop: drives the open transport, then reconnects with
    /// exponential backoff on unexpected loss.
    async fn connection_loop(
        inner: Arc<Self>,
        transport: C::Transport,
        out_rx: mpsc::UnboundedReceiver<String>,
        token: CancellationToken,
    ) {
        let mut transport = transport;
        let mut out_rx = out_rx;

        loop {
            let end = Self::drive_session(&inner, transport, out_rx, &token).await;

            // Once cancelled, the writer slot and listener registry belong to
            // whoever tore this session down (disconnect or a replacing
            // connect); leave them untouched.
            if token.is_cancelled() {
                return;
            }
            inner.clear_writer();

            match end {
                SessionEnd::Cancelled => return,
                SessionEnd::Closed { code, reason } => {
                    inner.listeners.emit(&Event::Close { code, reason });
                }
                SessionEnd::Failed(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Error handling connection: {e:?}");
                    inner.listeners.emit(&Event::Error {
                        message: e.to_string(),
                    });
                    inner.listeners.emit(&Event::Close {
                        code: None,
                        reason: None,
                    });
                }
                SessionEnd::HeartbeatTimeout => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Heartbeat timeout, connection force-closed");
                    inner.listeners.emit(&Event::Close {
                        code: None,
                        reason: None,
                    });
                }
            }

            if inner.intentional_close.load(Ordering::SeqCst) {
                _ = inner.state_tx.send(ConnectionState::Disconnected);
                return;
            }

            match Self::reconnect(&inner, &token).await {
                Some(next) => {
                    out_rx = inner.open_epoch();
                    transport = next;
                }
                None => return,
            }
        }
    }

    /// Reconnect with exponential backoff, up to the configured attempt cap.
    ///
    /// Returns the freshly opened transport, or `None` when cancelled or when
    /// the retry budget is exhausted (in which case the state settles on
    /// [`ConnectionState::Disconnected`] and the caller must reconnect
    /// explicitly).
    async fn reconnect(inner: &Arc<Self>, token: &CancellationToken) -> Option<C::Transport> {
        let mut backoff: ExponentialBackoff = inner.config.reconnect.clone().into();
        let max_attempts = inner.config.reconnect.max_attempts;
        let mut attempt = 0_u32;

        loop {
            if let Some(max) = max_attempts
                && attempt >= max
            {
                _ = inner.state_tx.send(ConnectionState::Disconnected);
                return None;
            }
            attempt = attempt.saturating_add(1);
            _ = inner.state_tx.send(ConnectionState::Reconnecting { attempt });

            let delay = backoff
                .next_backoff()
                .unwrap_or(inner.config.reconnect.max_backoff);
            tokio::select! {
                () = token.cancelled() => return None,
                () = sleep(delay) => {}
            }

            _ = inner.state_tx.send(ConnectionState::Connecting);
            let dialed = tokio::select! {
                () = token.cancelled() => return None,
                dialed = inner.connector.connect(&inner.endpoint) => dialed,
            };

            match dialed {
                Ok(transport) => return Some(transport),
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(attempt, "Unable to reconnect: {e:?}");
                    inner.listeners.emit(&Event::Error {
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    /// Drive one open transport until it closes, fails, times out, or the
    /// session is cancelled. The transport is closed on every exit path.
    async fn drive_session(
        inner: &Arc<Self>,
        mut transport: C::Transport,
        mut out_rx: mpsc::UnboundedReceiver<String>,
        token: &CancellationToken,
    ) -> SessionEnd {
        // Channels to notify the heartbeat loop of acks and the session loop
        // of a missed deadline
        let (pong_tx, pong_rx) = watch::channel(TokioInstant::now());
        let (ping_tx, mut ping_rx) = mpsc::unbounded_channel();
        let (dead_tx, mut dead_rx) = mpsc::channel::<()>(1);

        let hb_state = inner.state_rx.clone();
        let hb_config = inner.config.clone();
        let heartbeat = tokio::spawn(async move {
            heartbeat_loop(&ping_tx, &hb_state, &hb_config, pong_rx, &dead_tx).await;
        });

        let end = loop {
            // The transport cannot be written to from inside a select arm
            // while another arm borrows it for reading, so each turn resolves
            // to a Step first and acts on it after the select completes.
            let step = tokio::select! {
                biased;
                () = token.cancelled() => Step::Cancelled,
                Some(()) = dead_rx.recv() => Step::Dead,
                event = transport.next() => Step::Inbound(event),
                Some(text) = out_rx.recv() => Step::Outbound(text),
                Some(()) = ping_rx.recv() => Step::Probe,
            };

            match step {
                Step::Cancelled => break SessionEnd::Cancelled,
                Step::Dead => break SessionEnd::HeartbeatTimeout,
                Step::Inbound(Some(Ok(TransportEvent::Text(text)))) => {
                    if text == PONG {
                        _ = pong_tx.send(TokioInstant::now());
                    } else {
                        inner.listeners.emit(&Event::Message {
                            payload: Payload::decode(text),
                        });
                    }
                }
                Step::Inbound(Some(Ok(TransportEvent::Closed { code, reason }))) => {
                    break SessionEnd::Closed { code, reason };
                }
                Step::Inbound(Some(Err(e))) => break SessionEnd::Failed(e),
                Step::Inbound(None) => {
                    break SessionEnd::Closed {
                        code: None,
                        reason: None,
                    };
                }
                Step::Outbound(text) => {
                    if let Err(e) = transport.send(text).await {
                        break SessionEnd::Failed(e);
                    }
                }
                Step::Probe => {
                    if let Err(e) = transport.send(PING.to_owned()).await {
                        break SessionEnd::Failed(e);
                    }
                }
            }
        };

        heartbeat.abort();
        _ = transport.close().await;

        end
    }
}

/// Heartbeat loop that requests probes and monitors acknowledgements.
///
/// Probes are requested through `ping_tx` (the session loop owns the
/// transport and performs the write); a missed ack deadline is reported
/// through `dead_tx`, after which the loop ends. All heartbeat timers live
/// inside this task, so aborting it cancels them.
async fn heartbeat_loop(
    ping_tx: &mpsc::UnboundedSender<()>,
    state_rx: &watch::Receiver<ConnectionState>,
    config: &Config,
    mut pong_rx: watch::Receiver<TokioInstant>,
    dead_tx: &mpsc::Sender<()>,
) {
    // First probe one full interval after open, not immediately
    let start = TokioInstant::now() + config.heartbeat_interval;
    let mut ping_interval = interval_at(start, config.heartbeat_interval);

    loop {
        ping_interval.tick().await;

        if !state_rx.borrow().is_connected() {
            break;
        }

        // Mark the current ack state as seen before probing so a stale ack
        // does not satisfy changed() immediately
        drop(pong_rx.borrow_and_update());

        let probe_sent = TokioInstant::now();
        if ping_tx.send(()).is_err() {
            // Session loop has terminated
            break;
        }

        // The ack must arrive before the deadline; an ack older than the
        // probe does not count
        let deadline = probe_sent + config.heartbeat_timeout;
        let acked = loop {
            match timeout_at(deadline, pong_rx.changed()).await {
                Ok(Ok(())) => {
                    if *pong_rx.borrow_and_update() >= probe_sent {
                        break true;
                    }
                }
                Ok(Err(_)) => return,
                Err(_) => break false,
            }
        };

        if !acked {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                "Heartbeat timeout: no ack received within {:?}",
                config.heartbeat_timeout
            );
            _ = dead_tx.try_send(());
            break;
        }
    }
}

#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Each integration test binary uses a subset of these helpers"
)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chatwire::error::Error;
use chatwire::{Connector, Transport, TransportEvent};
use futures_util::{SinkExt as _, StreamExt as _};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, timeout};
use tokio_tungstenite::tungstenite::Message;

/// Mock WebSocket server driven over real sockets.
pub struct MockWsServer {
    pub addr: SocketAddr,
    /// Broadcast messages to ALL connected clients
    message_tx: broadcast::Sender<String>,
    /// Receives payloads sent by clients (heartbeat probes excluded)
    received_rx: mpsc::UnboundedReceiver<String>,
    /// When set, live connections are dropped and stay droppable
    disconnect_signal: Arc<AtomicBool>,
    /// Total connections accepted so far
    connections: Arc<AtomicUsize>,
}

impl MockWsServer {
    /// Start a mock server on a random port that acknowledges heartbeat
    /// probes.
    pub async fn start() -> Self {
        Self::start_with(true).await
    }

    /// Start a mock server, choosing whether `ping` probes are answered with
    /// `pong`.
    pub async fn start_with(auto_pong: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (message_tx, _) = broadcast::channel::<String>(100);
        let (received_tx, received_rx) = mpsc::unbounded_channel::<String>();
        let disconnect_signal = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(AtomicUsize::new(0));

        let broadcast_tx = message_tx.clone();
        let disconnect = Arc::clone(&disconnect_signal);
        let accepted = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                accepted.fetch_add(1, Ordering::SeqCst);

                let (mut write, mut read) = ws_stream.split();
                let received = received_tx.clone();
                let mut msg_rx = broadcast_tx.subscribe();
                let disconnect_clone = Arc::clone(&disconnect);

                tokio::spawn(async move {
                    loop {
                        if disconnect_clone.load(Ordering::SeqCst) {
                            break;
                        }

                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) if text == "ping" => {
                                        if auto_pong
                                            && write.send(Message::Text("pong".into())).await.is_err()
                                        {
                                            break;
                                        }
                                    }
                                    Some(Ok(Message::Text(text))) => {
                                        drop(received.send(text.to_string()));
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            msg = msg_rx.recv() => {
                                match msg {
                                    Ok(text) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(_) => break,
                                }
                            }
                            () = tokio::time::sleep(Duration::from_millis(50)) => {
                                if disconnect_clone.load(Ordering::SeqCst) {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            message_tx,
            received_rx,
            disconnect_signal,
            connections,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Send a message to all connected clients.
    pub fn send(&self, message: &str) {
        drop(self.message_tx.send(message.to_owned()));
    }

    /// Receive the next payload a client sent.
    pub async fn recv(&mut self) -> Option<String> {
        timeout(Duration::from_secs(2), self.received_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// How many connections the server has accepted in total.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn drop_connections(&self) {
        self.disconnect_signal.store(true, Ordering::SeqCst);
    }

    pub fn allow_connections(&self) {
        self.disconnect_signal.store(false, Ordering::SeqCst);
    }
}

/// Outcome of one scripted dial.
#[derive(Debug, Clone, Copy)]
pub enum Dial {
    /// Produce a transport controlled through a [`TransportHandle`]
    Ok,
    /// Refuse the connection
    Fail,
}

/// Control side of one [`ScriptedTransport`].
pub struct TransportHandle {
    event_tx: mpsc::UnboundedSender<chatwire::Result<TransportEvent>>,
    pub sent_rx: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicUsize>,
}

impl TransportHandle {
    /// Deliver an inbound text frame to the manager.
    pub fn push_text(&self, text: &str) {
        drop(
            self.event_tx
                .send(Ok(TransportEvent::Text(text.to_owned()))),
        );
    }

    /// Deliver a peer-initiated close to the manager.
    pub fn push_close(&self) {
        drop(self.event_tx.send(Ok(TransportEvent::Closed {
            code: Some(1000),
            reason: None,
        })));
    }

    /// Deliver a transport error to the manager.
    pub fn push_error(&self, message: &str) {
        drop(self.event_tx.send(Err(Error::validation(message.to_owned()))));
    }

    /// Wait for the next frame the manager wrote to this transport.
    pub async fn sent(&mut self) -> Option<String> {
        self.sent_rx.recv().await
    }

    /// How many times the manager closed this transport.
    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Scripted [`Connector`] for timer-exact tests under a paused clock.
///
/// Dial outcomes are consumed front to back; once the script is exhausted
/// every further dial fails.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    inner: Arc<ScriptedInner>,
}

#[derive(Default)]
struct ScriptedInner {
    script: Mutex<VecDeque<Dial>>,
    dial_times: Mutex<Vec<Instant>>,
    handles: Mutex<VecDeque<TransportHandle>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a dial outcome to the script.
    pub fn expect(&self, dial: Dial) {
        self.inner.script.lock().unwrap().push_back(dial);
    }

    /// Instants (on the tokio clock) at which dials happened.
    pub fn dial_times(&self) -> Vec<Instant> {
        self.inner.dial_times.lock().unwrap().clone()
    }

    pub fn dial_count(&self) -> usize {
        self.inner.dial_times.lock().unwrap().len()
    }

    /// Take control of the oldest not-yet-claimed transport.
    pub fn take_handle(&self) -> Option<TransportHandle> {
        self.inner.handles.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    type Transport = ScriptedTransport;

    async fn connect(&self, _endpoint: &str) -> chatwire::Result<ScriptedTransport> {
        self.inner.dial_times.lock().unwrap().push(Instant::now());

        let dial = self
            .inner
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Dial::Fail);

        match dial {
            Dial::Fail => Err(Error::validation("dial refused")),
            Dial::Ok => {
                let (event_tx, incoming) = mpsc::unbounded_channel();
                let (sent_tx, sent_rx) = mpsc::unbounded_channel();
                let closed = Arc::new(AtomicUsize::new(0));

                self.inner.handles.lock().unwrap().push_back(TransportHandle {
                    event_tx,
                    sent_rx,
                    closed: Arc::clone(&closed),
                });

                Ok(ScriptedTransport {
                    incoming,
                    sent_tx,
                    closed,
                })
            }
        }
    }
}

/// Channel-backed [`Transport`] steered by a [`TransportHandle`].
pub struct ScriptedTransport {
    incoming: mpsc::UnboundedReceiver<chatwire::Result<TransportEvent>>,
    sent_tx: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&mut self, text: String) -> chatwire::Result<()> {
        self.sent_tx
            .send(text)
            .map_err(|_| Error::validation("peer gone"))
    }

    async fn next(&mut self) -> Option<chatwire::Result<TransportEvent>> {
        self.incoming.recv().await
    }

    async fn close(&mut self) -> chatwire::Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

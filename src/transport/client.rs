use futures::stream::{SplitStream, StreamExt};
use futures::SinkExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::state::{ConnectionState, SharedState};
use super::{Connection, Connector, ReceiveHandler};
use crate::audio::AudioChunk;
use crate::error::AgentError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a closing connection may spend on the close handshake
const CLOSE_GRACE: Duration = Duration::from_millis(250);

/// Opens binary WebSocket connections
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait::async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn Connection>, AgentError> {
        let connection = WebSocketConnection::open(endpoint, self.connect_timeout).await?;
        Ok(Box::new(connection))
    }
}

/// A single binary-framed WebSocket connection
///
/// Outbound chunks go through one writer task, so they reach the wire in
/// the order they were sent. Inbound frames are read by a task started on
/// the first `on_receive`; until then they wait in the socket.
pub struct WebSocketConnection {
    endpoint: String,
    state: SharedState,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    shutdown: Option<oneshot::Sender<()>>,
    incoming: Option<SplitStream<WsStream>>,
    handler: Arc<Mutex<Option<ReceiveHandler>>>,
    writer_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
}

impl WebSocketConnection {
    /// Connect to the endpoint; no retry on failure
    pub async fn open(endpoint: &str, connect_timeout: Duration) -> Result<Self, AgentError> {
        info!("Connecting to {}", endpoint);

        let (ws, _response) =
            tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(endpoint))
                .await
                .map_err(|_| {
                    AgentError::connection(format!(
                        "timed out after {}ms connecting to {}",
                        connect_timeout.as_millis(),
                        endpoint
                    ))
                })?
                .map_err(|e| AgentError::connection(format!("{}: {}", endpoint, e)))?;

        let (mut sink, incoming) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let state = SharedState::new(ConnectionState::Open);

        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();

        let writer_state = state.clone();
        let writer_endpoint = endpoint.to_string();
        let writer_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    // Queued chunks are dropped; only the close frame goes out
                    _ = &mut shutdown_rx => {
                        let handshake = async {
                            sink.send(Message::Close(None)).await?;
                            sink.close().await
                        };
                        match tokio::time::timeout(CLOSE_GRACE, handshake).await {
                            Ok(Ok(())) => debug!("Sent close frame to {}", writer_endpoint),
                            Ok(Err(e)) => debug!("Close frame to {} failed: {}", writer_endpoint, e),
                            Err(_) => debug!("Close frame to {} timed out", writer_endpoint),
                        }
                        break;
                    }
                    message = outbound_rx.recv() => {
                        let Some(message) = message else { break };
                        if let Err(e) = sink.send(message).await {
                            if writer_state.mark_closed() {
                                error!(
                                    "{}",
                                    AgentError::connection(format!("send to {} failed: {}", writer_endpoint, e))
                                );
                            }
                            break;
                        }
                    }
                }
            }
        });

        info!("Connected to {}", endpoint);

        Ok(Self {
            endpoint: endpoint.to_string(),
            state,
            outbound: Some(outbound),
            shutdown: Some(shutdown),
            incoming: Some(incoming),
            handler: Arc::new(Mutex::new(None)),
            writer_task: Some(writer_task),
            reader_task: None,
        })
    }

    fn spawn_reader(&mut self, mut incoming: SplitStream<WsStream>) {
        let handler = Arc::clone(&self.handler);
        let state = self.state.clone();
        let endpoint = self.endpoint.clone();

        self.reader_task = Some(tokio::spawn(async move {
            while let Some(message) = incoming.next().await {
                match message {
                    Ok(Message::Binary(data)) => {
                        let chunk = AudioChunk::new(data.to_vec());
                        match handler.lock() {
                            Ok(mut guard) => {
                                if let Some(handler) = guard.as_mut() {
                                    handler(chunk);
                                }
                            }
                            Err(_) => {
                                error!("Receive handler poisoned; dropping frame");
                            }
                        }
                    }
                    Ok(Message::Text(text)) => {
                        info!("Received text message: {}", text);
                    }
                    Ok(Message::Close(frame)) => {
                        info!("Server closed connection: {:?}", frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if state.get() != ConnectionState::Closed {
                            error!(
                                "{}",
                                AgentError::connection(format!("read from {} failed: {}", endpoint, e))
                            );
                        }
                        break;
                    }
                }
            }

            if state.mark_closed() {
                warn!("Connection to {} lost", endpoint);
            }
        }));
    }
}

impl Connection for WebSocketConnection {
    fn send(&mut self, chunk: AudioChunk) -> bool {
        if self.state.get() != ConnectionState::Open {
            debug!("Dropping {}-byte chunk: connection not open", chunk.len());
            return false;
        }

        match &self.outbound {
            Some(outbound) => outbound.send(Message::binary(chunk.data)).is_ok(),
            None => false,
        }
    }

    fn on_receive(&mut self, handler: ReceiveHandler) {
        match self.handler.lock() {
            Ok(mut slot) => *slot = Some(handler),
            Err(_) => {
                error!("Receive handler poisoned; handler not registered");
                return;
            }
        }

        if let Some(incoming) = self.incoming.take() {
            self.spawn_reader(incoming);
        }
    }

    fn close(&mut self) {
        if self.outbound.is_none() && self.reader_task.is_none() && self.writer_task.is_none() {
            return;
        }

        self.state.set(ConnectionState::Closing);

        // Pending frames in either direction are discarded
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.outbound = None;
        self.incoming = None;
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(mut task) = self.writer_task.take() {
            // The writer sends the close frame itself; stop it if the peer stalls
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        if tokio::time::timeout(CLOSE_GRACE * 2, &mut task).await.is_err() {
                            task.abort();
                        }
                    });
                }
                Err(_) => task.abort(),
            }
        }

        self.state.set(ConnectionState::Closed);
        info!("Closed connection to {}", self.endpoint);
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        self.close();
    }
}

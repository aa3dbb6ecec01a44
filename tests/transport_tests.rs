// Tests for the WebSocket transport against a loopback server

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::Message;
use voice_agent::audio::AudioChunk;
use voice_agent::transport::{Connection, ConnectionState, Connector, WebSocketConnection, WebSocketConnector};
use voice_agent::AgentError;

const TIMEOUT: Duration = Duration::from_secs(2);

/// Accept one client; report every binary frame it sends and send it `script`
async fn spawn_server(script: Vec<Message>) -> Result<(String, mpsc::UnboundedReceiver<Vec<u8>>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let endpoint = format!("ws://{}/ws", listener.local_addr()?);
    let (received_tx, received_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        for message in script {
            ws.send(message).await.unwrap();
        }

        while let Some(Ok(message)) = ws.next().await {
            if let Message::Binary(data) = message {
                if received_tx.send(data.to_vec()).is_err() {
                    break;
                }
            }
        }
    });

    Ok((endpoint, received_rx))
}

fn collecting_handler() -> (voice_agent::transport::ReceiveHandler, mpsc::UnboundedReceiver<AudioChunk>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Box::new(move |chunk| {
            let _ = tx.send(chunk);
        }),
        rx,
    )
}

#[tokio::test]
async fn test_outbound_chunks_keep_send_order() -> Result<()> {
    let (endpoint, mut received) = spawn_server(Vec::new()).await?;
    let mut connection = WebSocketConnection::open(&endpoint, TIMEOUT).await?;
    assert_eq!(connection.state(), ConnectionState::Open);

    for i in 0..20u8 {
        assert!(connection.send(AudioChunk::new(vec![i; 64])));
    }

    for i in 0..20u8 {
        let data = tokio::time::timeout(TIMEOUT, received.recv()).await?.unwrap();
        assert_eq!(data, vec![i; 64], "frame {} out of order", i);
    }

    connection.close();
    Ok(())
}

#[tokio::test]
async fn test_inbound_binary_frames_delivered_in_order_text_ignored() -> Result<()> {
    let script = vec![
        Message::binary(vec![1u8; 16]),
        Message::text("server ready"),
        Message::binary(vec![2u8; 2048]),
        Message::binary(vec![3u8; 8]),
    ];
    let (endpoint, _received) = spawn_server(script).await?;

    let connector = WebSocketConnector::new(TIMEOUT);
    let mut connection = connector.connect(&endpoint).await?;
    let (handler, mut chunks) = collecting_handler();
    connection.on_receive(handler);

    let mut lengths = Vec::new();
    let mut firsts = Vec::new();
    for _ in 0..3 {
        let chunk = tokio::time::timeout(TIMEOUT, chunks.recv()).await?.unwrap();
        lengths.push(chunk.len());
        firsts.push(chunk.data[0]);
    }

    assert_eq!(firsts, vec![1, 2, 3]);
    assert_eq!(lengths, vec![16, 2048, 8]);

    // The text frame never reaches the handler
    assert!(tokio::time::timeout(Duration::from_millis(100), chunks.recv()).await.is_err());

    connection.close();
    Ok(())
}

#[tokio::test]
async fn test_send_after_close_is_dropped() -> Result<()> {
    let (endpoint, _received) = spawn_server(Vec::new()).await?;
    let mut connection = WebSocketConnection::open(&endpoint, TIMEOUT).await?;

    connection.close();
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(!connection.send(AudioChunk::new(vec![0u8; 10])));

    // Closing again is harmless
    connection.close();
    assert_eq!(connection.state(), ConnectionState::Closed);

    Ok(())
}

#[tokio::test]
async fn test_close_sends_close_frame() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let endpoint = format!("ws://{}/ws", listener.local_addr()?);
    let (closed_tx, closed_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Close(frame) = message {
                let _ = closed_tx.send(frame);
                return;
            }
        }
    });

    let mut connection = WebSocketConnection::open(&endpoint, TIMEOUT).await?;
    connection.close();
    assert_eq!(connection.state(), ConnectionState::Closed);

    let frame = tokio::time::timeout(TIMEOUT, closed_rx).await??;
    assert!(frame.is_none(), "close frame carries no status");

    Ok(())
}

#[tokio::test]
async fn test_unreachable_endpoint_is_connection_error() -> Result<()> {
    // Reserve a port, then free it so nothing is listening
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let endpoint = format!("ws://{}/ws", listener.local_addr()?);
    drop(listener);

    let result = WebSocketConnection::open(&endpoint, TIMEOUT).await;
    assert!(matches!(result, Err(AgentError::Connection(_))));

    Ok(())
}

#[tokio::test]
async fn test_server_close_marks_connection_closed() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let endpoint = format!("ws://{}/ws", listener.local_addr()?);

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _ = ws.close(None).await;
    });

    let mut connection = WebSocketConnection::open(&endpoint, TIMEOUT).await?;
    let (handler, _chunks) = collecting_handler();
    connection.on_receive(handler);

    let mut closed = false;
    for _ in 0..200 {
        if connection.state() == ConnectionState::Closed {
            closed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(closed, "connection should notice the server closing");
    assert!(!connection.send(AudioChunk::new(vec![1u8; 4])));

    Ok(())
}

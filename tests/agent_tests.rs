// End-to-end tests for the start/stop toggle

mod common;

use anyhow::Result;
use common::{mono_frame, wait_for, MockFactory};
use std::sync::Arc;
use std::time::{Duration, Instant};
use voice_agent::audio::{AudioChunk, ChunkConfig, ChunkFormat};
use voice_agent::{Agent, AgentHandle, AgentState, SessionConfig, SessionFactory};

/// One 512-sample frame at 16kHz is exactly one 32ms raw PCM chunk of 1024 bytes
fn pcm_config() -> SessionConfig {
    SessionConfig {
        chunk: ChunkConfig {
            interval_ms: 32,
            format: ChunkFormat::Pcm,
        },
        ..SessionConfig::default()
    }
}

fn spawn_agent(factory: &Arc<MockFactory>) -> AgentHandle {
    let factory: Arc<dyn SessionFactory> = factory.clone();
    let (agent, _task) = Agent::spawn(pcm_config(), factory);
    agent
}

#[tokio::test]
async fn test_round_trip_and_release() -> Result<()> {
    let factory = Arc::new(MockFactory::with_frames(vec![mono_frame(512, 0)]));
    let agent = spawn_agent(&factory);

    assert_eq!(agent.state(), AgentState::Stopped);

    let status = agent.start().await?;
    assert_eq!(status.status, AgentState::Running);
    assert_eq!(agent.state(), AgentState::Running);

    // Outbound: one captured chunk reaches the connection
    assert!(wait_for(|| factory.connection.sent().len() == 1).await);
    let sent = factory.connection.sent();
    assert_eq!(sent[0].len(), 1024);

    // Inbound: one server frame reaches the playback buffer
    assert!(factory.connection.deliver(AudioChunk::new(vec![7u8; 2048])));
    assert!(wait_for(|| factory.buffer.appended().len() == 1).await);
    assert_eq!(factory.buffer.appended()[0].len(), 2048);

    let status = agent.stop().await?;
    assert_eq!(status.status, AgentState::Stopped);
    assert_eq!(agent.state(), AgentState::Stopped);

    assert_eq!(factory.device.closes(), 1);
    assert_eq!(factory.connection.closes(), 1);
    assert_eq!(factory.buffer.closes(), 1);

    let stats = status.stats.expect("stats of the finished session");
    assert_eq!(stats.chunks_sent, 1);
    assert_eq!(stats.frames_appended, 1);
    assert!(stats.stopped_at.is_some());

    Ok(())
}

#[tokio::test]
async fn test_stop_twice_is_noop() -> Result<()> {
    let factory = Arc::new(MockFactory::with_frames(vec![mono_frame(512, 0)]));
    let agent = spawn_agent(&factory);

    agent.start().await?;
    agent.stop().await?;
    let status = agent.stop().await?;

    assert_eq!(status.status, AgentState::Stopped);
    assert_eq!(factory.device.closes(), 1);
    assert_eq!(factory.connection.closes(), 1);
    assert_eq!(factory.buffer.closes(), 1);

    Ok(())
}

#[tokio::test]
async fn test_stop_while_stopped_touches_nothing() -> Result<()> {
    let factory = Arc::new(MockFactory::default());
    let agent = spawn_agent(&factory);

    let status = agent.stop().await?;
    assert_eq!(status.status, AgentState::Stopped);
    assert!(status.stats.is_none());
    assert_eq!(factory.connection.connects(), 0);
    assert_eq!(factory.device.closes(), 0);

    Ok(())
}

#[tokio::test]
async fn test_start_while_running_opens_nothing_new() -> Result<()> {
    let factory = Arc::new(MockFactory::with_frames(vec![mono_frame(512, 0)]));
    let agent = spawn_agent(&factory);

    let first = agent.start().await?;
    let second = agent.start().await?;

    assert_eq!(second.status, AgentState::Running);
    assert_eq!(
        first.stats.map(|s| s.session_id),
        second.stats.map(|s| s.session_id)
    );
    assert_eq!(factory.connection.connects(), 1);
    assert_eq!(factory.device.opens(), 1);

    agent.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_restart_gets_fresh_resources() -> Result<()> {
    let factory = Arc::new(MockFactory::with_frames(vec![mono_frame(512, 0)]));
    let agent = spawn_agent(&factory);

    let first = agent.start().await?;
    agent.stop().await?;
    let second = agent.start().await?;

    assert_ne!(
        first.stats.map(|s| s.session_id),
        second.stats.map(|s| s.session_id)
    );
    assert_eq!(factory.connection.connects(), 2);
    assert_eq!(factory.device.opens(), 2);

    agent.stop().await?;
    assert_eq!(factory.connection.closes(), 2);
    assert_eq!(factory.device.closes(), 2);
    assert_eq!(factory.buffer.closes(), 2);

    Ok(())
}

#[tokio::test]
async fn test_connect_failure_keeps_running_and_drops_chunks() -> Result<()> {
    let factory = Arc::new(MockFactory {
        fail_connect: true,
        ..MockFactory::with_frames(vec![mono_frame(512, 0)])
    });
    let agent = spawn_agent(&factory);

    let status = agent.start().await?;
    assert_eq!(status.status, AgentState::Running);

    let mut dropped = 0;
    for _ in 0..200 {
        dropped = agent.status().await?.stats.map(|s| s.chunks_dropped).unwrap_or(0);
        if dropped > 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(dropped, 1, "captured chunk is discarded, not queued");
    assert_eq!(agent.state(), AgentState::Running);

    agent.stop().await?;
    assert_eq!(factory.connection.closes(), 0);
    assert_eq!(factory.device.closes(), 1);
    assert_eq!(factory.buffer.closes(), 1);

    Ok(())
}

#[tokio::test]
async fn test_connect_timeout_bounds_start() -> Result<()> {
    let factory = Arc::new(MockFactory {
        connect_delay: Some(Duration::from_secs(30)),
        ..MockFactory::with_frames(vec![mono_frame(512, 0)])
    });
    let config = SessionConfig {
        connect_timeout: Duration::from_millis(50),
        ..pcm_config()
    };
    let shared: Arc<dyn SessionFactory> = factory.clone();
    let (agent, _task) = Agent::spawn(config, shared);

    let started = Instant::now();
    let status = tokio::time::timeout(Duration::from_secs(5), agent.start()).await??;
    assert_eq!(status.status, AgentState::Running);
    assert!(started.elapsed() < Duration::from_secs(5));

    // No connection came up, so the captured chunk has nowhere to go
    assert!(
        wait_for(|| factory.device.opens() == 1).await,
        "capture still starts after the connect attempt gives up"
    );
    agent.stop().await?;
    assert_eq!(factory.connection.closes(), 0);
    assert_eq!(factory.device.closes(), 1);

    Ok(())
}

#[tokio::test]
async fn test_denied_device_keeps_connection() -> Result<()> {
    let factory = Arc::new(MockFactory {
        deny_device: true,
        ..MockFactory::default()
    });
    let agent = spawn_agent(&factory);

    let status = agent.start().await?;
    assert_eq!(status.status, AgentState::Running);
    assert_eq!(factory.connection.connects(), 1);
    assert_eq!(factory.device.opens(), 0);

    // Inbound audio still plays with no microphone
    assert!(factory.connection.deliver(AudioChunk::new(vec![1u8; 64])));
    assert!(wait_for(|| factory.buffer.appended().len() == 1).await);

    agent.stop().await?;
    assert_eq!(factory.device.closes(), 0, "a device that never opened is not closed");
    assert_eq!(factory.connection.closes(), 1);

    Ok(())
}

#[tokio::test]
async fn test_busy_playback_counts_drop() -> Result<()> {
    let factory = Arc::new(MockFactory::default());
    let agent = spawn_agent(&factory);
    agent.start().await?;

    factory.buffer.set_busy(true);
    assert!(factory.connection.deliver(AudioChunk::new(vec![1u8; 16])));

    let mut busy = 0;
    for _ in 0..200 {
        busy = agent.status().await?.stats.map(|s| s.frames_dropped_busy).unwrap_or(0);
        if busy > 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(busy, 1);
    assert!(factory.buffer.appended().is_empty());

    agent.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_state_changes_are_observable() -> Result<()> {
    let factory = Arc::new(MockFactory::default());
    let agent = spawn_agent(&factory);
    let mut states = agent.subscribe();

    agent.start().await?;
    states.changed().await?;
    assert_eq!(*states.borrow_and_update(), AgentState::Running);

    agent.stop().await?;
    states.changed().await?;
    assert_eq!(*states.borrow_and_update(), AgentState::Stopped);

    Ok(())
}

#[tokio::test]
async fn test_shutdown_releases_running_session() -> Result<()> {
    let factory = Arc::new(MockFactory::with_frames(vec![mono_frame(512, 0)]));
    let shared: Arc<dyn SessionFactory> = factory.clone();
    let (agent, task) = Agent::spawn(pcm_config(), shared);

    agent.start().await?;
    agent.shutdown().await?;
    task.await?;

    assert_eq!(factory.connection.closes(), 1);
    assert_eq!(factory.device.closes(), 1);
    assert_eq!(factory.buffer.closes(), 1);
    assert!(agent.start().await.is_err(), "handle is inert after shutdown");

    Ok(())
}

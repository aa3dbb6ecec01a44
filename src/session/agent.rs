//! The start/stop toggle and the event loop behind it
//!
//! A single task owns the active session. Control commands, captured chunks
//! and inbound chunks all arrive as events and are handled one at a time, so
//! the connection, capture device and playback buffer are never touched by
//! two parties at once.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::capture::CaptureSession;
use super::config::SessionConfig;
use super::factory::SessionFactory;
use super::playback::{AppendOutcome, PlaybackSession};
use super::stats::SessionStats;
use crate::audio::AudioChunk;
use crate::error::AgentError;
use crate::transport::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    Stopped,
    Running,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentState::Stopped => write!(f, "Stopped"),
            AgentState::Running => write!(f, "Running"),
        }
    }
}

/// Status readout: current state plus stats of the current or last session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub status: AgentState,
    pub stats: Option<SessionStats>,
}

enum Command {
    Start(oneshot::Sender<AgentStatus>),
    Stop(oneshot::Sender<AgentStatus>),
    Status(oneshot::Sender<AgentStatus>),
    Shutdown(oneshot::Sender<()>),
}

enum Event {
    Control(Command),
    Captured(AudioChunk),
    CaptureEnded,
    Received(AudioChunk),
    InboundEnded,
}

/// Resources of one running session; each is owned here and nowhere else
struct ActiveSession {
    stats: SessionStats,
    capture: Option<CaptureSession>,
    captured: Option<mpsc::Receiver<AudioChunk>>,
    connection: Option<Box<dyn Connection>>,
    inbound: Option<mpsc::UnboundedReceiver<AudioChunk>>,
    playback: Option<PlaybackSession>,
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_unbounded_or_pending<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

pub struct Agent {
    config: SessionConfig,
    factory: Arc<dyn SessionFactory>,
    active: Option<ActiveSession>,
    last_stats: Option<SessionStats>,
    state: watch::Sender<AgentState>,
}

impl Agent {
    /// Spawn the agent loop and return a handle to control it
    pub fn spawn(config: SessionConfig, factory: Arc<dyn SessionFactory>) -> (AgentHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (state_tx, state_rx) = watch::channel(AgentState::Stopped);

        let agent = Agent {
            config,
            factory,
            active: None,
            last_stats: None,
            state: state_tx,
        };

        let task = tokio::spawn(agent.run(command_rx));
        let handle = AgentHandle {
            commands: command_tx,
            state: state_rx,
        };

        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!("Agent ready (endpoint {})", self.config.endpoint);

        loop {
            let event = match self.active.as_mut() {
                Some(active) => tokio::select! {
                    command = commands.recv() => match command {
                        Some(command) => Event::Control(command),
                        None => break,
                    },
                    chunk = recv_or_pending(&mut active.captured) => match chunk {
                        Some(chunk) => Event::Captured(chunk),
                        None => Event::CaptureEnded,
                    },
                    chunk = recv_unbounded_or_pending(&mut active.inbound) => match chunk {
                        Some(chunk) => Event::Received(chunk),
                        None => Event::InboundEnded,
                    },
                },
                None => match commands.recv().await {
                    Some(command) => Event::Control(command),
                    None => break,
                },
            };

            if !self.dispatch(event).await {
                return;
            }
        }

        self.stop().await;
        info!("Agent shut down");
    }

    /// Handle one event; returns false when the loop should end
    async fn dispatch(&mut self, event: Event) -> bool {
        match event {
            Event::Control(Command::Start(reply)) => {
                self.start().await;
                let _ = reply.send(self.status());
            }
            Event::Control(Command::Stop(reply)) => {
                self.stop().await;
                let _ = reply.send(self.status());
            }
            Event::Control(Command::Status(reply)) => {
                let _ = reply.send(self.status());
            }
            Event::Control(Command::Shutdown(reply)) => {
                self.stop().await;
                info!("Agent shut down");
                let _ = reply.send(());
                return false;
            }
            Event::Captured(chunk) => self.forward_captured(chunk),
            Event::Received(chunk) => self.forward_received(chunk),
            Event::CaptureEnded => {
                if let Some(active) = self.active.as_mut() {
                    info!("Capture input ended");
                    active.captured = None;
                }
            }
            Event::InboundEnded => {
                if let Some(active) = self.active.as_mut() {
                    debug!("Inbound stream ended");
                    active.inbound = None;
                }
            }
        }

        true
    }

    /// Wire capture -> connection -> playback. A no-op while running.
    ///
    /// Component failures are logged and leave the session running without
    /// that component.
    async fn start(&mut self) {
        if self.active.is_some() {
            debug!("Start ignored: already running");
            return;
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        info!("Starting session {}", session_id);
        self.state.send_replace(AgentState::Running);

        let mut session = ActiveSession {
            stats: SessionStats::new(session_id),
            capture: None,
            captured: None,
            connection: None,
            inbound: None,
            playback: None,
        };

        match self.factory.media_buffer() {
            Ok(buffer) => session.playback = Some(PlaybackSession::start(buffer)),
            Err(e) => error!("Playback unavailable: {}", e),
        }

        let connecting = tokio::time::timeout(
            self.config.connect_timeout,
            self.factory.connect(&self.config.endpoint),
        );
        match connecting.await {
            Ok(Ok(mut connection)) => {
                let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
                connection.on_receive(Box::new(move |chunk| {
                    let _ = inbound_tx.send(chunk);
                }));
                session.connection = Some(connection);
                session.inbound = Some(inbound_rx);
            }
            Ok(Err(e)) => error!("{}", e),
            Err(_) => error!(
                "{}",
                AgentError::connection(format!(
                    "{} did not answer within {}ms",
                    self.config.endpoint,
                    self.config.connect_timeout.as_millis()
                ))
            ),
        }

        match self.factory.capture_device() {
            Ok(device) => {
                let mut capture = CaptureSession::new(device, self.config.chunk.clone());
                match capture.start(&self.config.constraints).await {
                    Ok(chunks) => session.captured = Some(chunks),
                    Err(e) => error!("{}", e),
                }
                session.capture = Some(capture);
            }
            Err(e) => error!("{}", e),
        }

        self.active = Some(session);
    }

    /// Tear everything down without draining in-flight data
    async fn stop(&mut self) {
        let Some(mut session) = self.active.take() else {
            self.state.send_replace(AgentState::Stopped);
            return;
        };

        info!("Stopping session {}", session.stats.session_id);

        if let Some(mut capture) = session.capture.take() {
            capture.stop().await;
        }
        if let Some(mut connection) = session.connection.take() {
            connection.close();
        }
        if let Some(mut playback) = session.playback.take() {
            playback.stop();
        }
        self.state.send_replace(AgentState::Stopped);

        session.stats.finish();
        info!(
            "Session {} stopped after {:.1}s: {} chunks sent, {} frames played",
            session.stats.session_id,
            session.stats.duration_secs,
            session.stats.chunks_sent,
            session.stats.frames_appended
        );
        self.last_stats = Some(session.stats);
    }

    fn forward_captured(&mut self, chunk: AudioChunk) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        active.stats.chunks_captured += 1;
        let sent = match active.connection.as_mut() {
            Some(connection) => connection.send(chunk),
            None => false,
        };

        if sent {
            active.stats.chunks_sent += 1;
        } else {
            active.stats.chunks_dropped += 1;
        }
    }

    fn forward_received(&mut self, chunk: AudioChunk) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        active.stats.frames_received += 1;
        let outcome = match active.playback.as_mut() {
            Some(playback) => playback.append(chunk),
            None => AppendOutcome::Stopped,
        };

        match outcome {
            AppendOutcome::Appended => active.stats.frames_appended += 1,
            AppendOutcome::DroppedBusy => active.stats.frames_dropped_busy += 1,
            AppendOutcome::Rejected | AppendOutcome::Stopped => active.stats.frames_rejected += 1,
        }
    }

    fn status(&self) -> AgentStatus {
        match &self.active {
            Some(active) => AgentStatus {
                status: AgentState::Running,
                stats: Some(active.stats.snapshot()),
            },
            None => AgentStatus {
                status: AgentState::Stopped,
                stats: self.last_stats.clone(),
            },
        }
    }
}

/// Cloneable control surface for a running agent
#[derive(Clone)]
pub struct AgentHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<AgentState>,
}

impl AgentHandle {
    /// Start a session; does nothing if one is running
    pub async fn start(&self) -> Result<AgentStatus> {
        self.request(Command::Start).await
    }

    /// Stop the running session; does nothing if stopped
    pub async fn stop(&self) -> Result<AgentStatus> {
        self.request(Command::Stop).await
    }

    pub async fn status(&self) -> Result<AgentStatus> {
        self.request(Command::Status).await
    }

    /// Current state without a round trip through the agent
    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.state.clone()
    }

    /// Stop any session and end the agent loop
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .await
            .map_err(|_| anyhow!("agent is not running"))?;
        reply_rx.await.map_err(|_| anyhow!("agent dropped the request"))
    }
}

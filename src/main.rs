use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use voice_agent::config::CaptureSourceKind;
use voice_agent::{create_router, AgentHandle, AppState, Config, PlatformFactory, SessionConfig};

#[derive(Debug, Parser)]
#[command(name = "voice-agent", version, about = "Stream microphone audio to a voice agent and play its replies")]
struct Args {
    /// Configuration file (extension optional)
    #[arg(short, long, default_value = "config/voice-agent")]
    config: String,

    /// Server WebSocket endpoint
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Replay a WAV file instead of using the microphone
    #[arg(short, long)]
    input: Option<String>,

    /// Restart the input file when it ends
    #[arg(long)]
    loop_input: bool,

    /// Write received audio to a WAV file instead of the speaker
    #[arg(short, long)]
    output: Option<String>,

    /// Do not serve the HTTP control API
    #[arg(long)]
    no_http: bool,

    /// Start a session immediately
    #[arg(long)]
    autostart: bool,
}

fn apply_args(cfg: &mut Config, args: &Args) {
    if let Some(endpoint) = &args.endpoint {
        cfg.server.endpoint = endpoint.clone();
    }
    if let Some(input) = &args.input {
        cfg.capture.source = CaptureSourceKind::File;
        cfg.capture.input_file = Some(input.clone());
    }
    if args.loop_input {
        cfg.capture.loop_input = true;
    }
    if let Some(output) = &args.output {
        cfg.playback.output_file = Some(output.clone());
    }
    if args.no_http {
        cfg.service.http.enabled = false;
    }
}

async fn print_status(agent: &AgentHandle) {
    match agent.status().await {
        Ok(status) => {
            println!("Status: {}", status.status);
            if let Some(stats) = status.stats {
                println!(
                    "  session {}: {:.1}s, {} chunks sent ({} dropped), {} frames played ({} busy, {} rejected)",
                    stats.session_id,
                    stats.duration_secs,
                    stats.chunks_sent,
                    stats.chunks_dropped,
                    stats.frames_appended,
                    stats.frames_dropped_busy,
                    stats.frames_rejected
                );
            }
        }
        Err(e) => error!("Failed to query status: {}", e),
    }
}

/// Lines from stdin, read on a detached thread so a pending read never
/// holds up shutdown
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Read toggle commands from stdin; returns true on `quit`, false at end of input
async fn console(agent: AgentHandle) -> Result<bool> {
    let mut lines = stdin_lines();
    println!("Commands: start | stop | status | quit");

    while let Some(line) = lines.recv().await {
        match line.trim() {
            "" => continue,
            "start" => {
                agent.start().await?;
                print_status(&agent).await;
            }
            "stop" => {
                agent.stop().await?;
                print_status(&agent).await;
            }
            "status" => print_status(&agent).await,
            "quit" | "exit" => return Ok(true),
            other => warn!("Unknown command: {}", other),
        }
    }

    Ok(false)
}

async fn serve_http(cfg: &Config, agent: AgentHandle) -> Result<()> {
    let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {}", addr))?;

    info!("HTTP control API listening on http://{}", addr);
    axum::serve(listener, create_router(AppState::new(agent)))
        .await
        .context("HTTP server failed")
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut cfg = Config::load(&args.config)?;
    apply_args(&mut cfg, &args);

    info!("Voice Agent v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded config: {}", cfg.service.name);
    info!("Server endpoint: {}", cfg.server.endpoint);

    let session_config = SessionConfig::from(&cfg);
    let factory = Arc::new(PlatformFactory::new(cfg.clone()));
    let (agent, agent_task) = voice_agent::Agent::spawn(session_config, factory);

    if args.autostart {
        agent.start().await?;
    }

    let http = {
        let cfg = cfg.clone();
        let agent = agent.clone();
        async move {
            if cfg.service.http.enabled {
                serve_http(&cfg, agent).await
            } else {
                std::future::pending().await
            }
        }
    };

    let console_loop = {
        let agent = agent.clone();
        let keep_serving = cfg.service.http.enabled;
        async move {
            match console(agent).await {
                Ok(false) if keep_serving => {
                    info!("Console input closed; still serving HTTP");
                    std::future::pending::<()>().await
                }
                Ok(_) => {}
                Err(e) => error!("Console failed: {:#}", e),
            }
        }
    };

    tokio::select! {
        _ = console_loop => {}
        result = http => {
            if let Err(e) = result {
                error!("{:#}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
        }
    }

    agent.shutdown().await?;
    agent_task.await.context("Agent task panicked")?;

    Ok(())
}

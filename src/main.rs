use anyhow::{Context, Result};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use screenrelay::cli::{Cli, Commands, ShareCommand, SourceKind};
use screenrelay::client::{ConsumerSession, ProducerSession};
use screenrelay::protocol::{discovery_url, relay_url, Role};
use screenrelay::relay;
use screenrelay::screen::capture::{CaptureLoop, CaptureState};
use screenrelay::screen::rate::{RatePolicy, SignalSource};
use screenrelay::screen::source::{CaptureSource, TestPattern};
use screenrelay::screen::viewer::{run_viewer, SnapshotFileDisplay};

const PATTERN_WIDTH: u32 = 1280;
const PATTERN_HEIGHT: u32 = 720;

struct ShareOptions {
    host: Option<String>,
    port: u16,
    watching: bool,
    hidden: bool,
    policy: RatePolicy,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse_args();

    match cli.command {
        Commands::Relay { addr } => {
            relay::start_relay(addr).await?;
        }
        Commands::Share {
            host,
            port,
            source,
            frames,
            watching,
            hidden,
            active_interval_ms,
            idle_interval_ms,
        } => {
            let options = ShareOptions {
                host,
                port,
                watching,
                hidden,
                policy: RatePolicy {
                    active_interval: Duration::from_millis(active_interval_ms),
                    idle_interval: Duration::from_millis(idle_interval_ms),
                    ..RatePolicy::default()
                },
            };
            match source {
                SourceKind::Pattern => {
                    let mut pattern = TestPattern::new(PATTERN_WIDTH, PATTERN_HEIGHT);
                    if let Some(limit) = frames {
                        pattern = pattern.with_limit(limit);
                    }
                    share(pattern, options).await?;
                }
                SourceKind::Screen => share_screen(options).await?,
            }
        }
        Commands::View { host, port, output } => {
            view(&host, port, output).await?;
        }
    }

    Ok(())
}

#[cfg(feature = "screen")]
async fn share_screen(options: ShareOptions) -> Result<()> {
    let display = screenrelay::screen::source::DisplaySource::primary()
        .context("Failed to open the primary display")?;
    share(display, options).await
}

#[cfg(not(feature = "screen"))]
async fn share_screen(_options: ShareOptions) -> Result<()> {
    anyhow::bail!("screen capture is not compiled in (rebuild with --features screen)")
}

async fn share<S: CaptureSource>(source: S, options: ShareOptions) -> Result<()> {
    let host = match options.host {
        Some(host) => host,
        None => relay::discovery::resolve_relay_host(&discovery_url("localhost", options.port)).await,
    };
    let url = relay_url(&host, options.port, Role::Producer);
    println!("🔌 Connecting to relay: {}", url);

    let session = Arc::new(ProducerSession::new());
    session
        .connect(&url)
        .await
        .with_context(|| format!("Failed to connect to {}", url))?;
    println!("✅ Connected! Streaming...");
    println!("Type watch / idle / hide / show / stop");
    println!();

    let signals = SignalSource::new(options.watching, !options.hidden);
    let handle = CaptureLoop::new(source, session, signals.signals())
        .with_policy(options.policy)
        .start();

    let mut commands = stdin_commands();
    let mut state = handle.state_changes();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = state.wait_for(|s| *s == CaptureState::Stopped) => break,
            cmd = commands.recv(), if stdin_open => match cmd {
                Some(ShareCommand::Watch) => { signals.set_attention(true); }
                Some(ShareCommand::Idle) => { signals.set_attention(false); }
                Some(ShareCommand::Hide) => { signals.set_visible(false); }
                Some(ShareCommand::Show) => { signals.set_visible(true); }
                Some(ShareCommand::Stop) => handle.stop(),
                None => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => handle.stop(),
        }
    }

    let report = handle.wait().await;
    let stats = report.stats;
    println!();
    println!("⏹️  Stopped: {}", report.reason);
    println!(
        "📊 {} captured, {} sent, {} dropped, {} skipped, {} encode failures",
        stats.captured, stats.sent, stats.dropped, stats.skipped, stats.encode_failures
    );

    Ok(())
}

/// Stdin is read on a plain thread so a pending read never holds up shutdown
fn stdin_commands() -> mpsc::UnboundedReceiver<ShareCommand> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            match ShareCommand::parse(&line) {
                Some(cmd) => {
                    if tx.send(cmd).is_err() {
                        break;
                    }
                }
                None if line.trim().is_empty() => {}
                None => warn!("unknown command: {}", line.trim()),
            }
        }
    });
    rx
}

async fn view(host: &str, port: u16, output: PathBuf) -> Result<()> {
    let url = relay_url(host, port, Role::Consumer);
    println!("🔌 Connecting to relay: {}", url);

    let session = ConsumerSession::new();
    let frames = session
        .connect(&url)
        .await
        .with_context(|| format!("Failed to connect to {}", url))?;
    let status_rx = session.subscribe_status();
    println!("✅ Connected! Writing frames to {}", output.display());

    let mut display = SnapshotFileDisplay::new(output);
    let state = tokio::select! {
        state = run_viewer(frames, status_rx, session.status(), &mut display) => Some(state),
        _ = tokio::signal::ctrl_c() => None,
    };
    session.close();

    match state {
        Some(state) => info!(
            frames = state.frames_shown,
            undecodable = state.undecodable,
            status = %state.status,
            "stream ended"
        ),
        None => info!("viewer stopped"),
    }

    Ok(())
}

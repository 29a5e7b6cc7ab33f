use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::protocol::DEFAULT_PORT;
use crate::screen::{ACTIVE_INTERVAL_MS, IDLE_INTERVAL_MS};

#[derive(Parser)]
#[command(name = "screenrelay")]
#[command(about = "🖥️  LAN screen streaming through a fan-out relay", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the relay server
    Relay {
        /// Address to bind to
        #[arg(short, long, default_value = "0.0.0.0:3000")]
        addr: String,
    },

    /// Capture a source and stream it to the relay
    Share {
        /// Relay host (discovered from the relay when omitted)
        #[arg(long)]
        host: Option<String>,

        /// Relay port
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// What to capture
        #[arg(short, long, value_enum, default_value_t = SourceKind::Pattern)]
        source: SourceKind,

        /// Stop after this many frames (test pattern only)
        #[arg(long)]
        frames: Option<u64>,

        /// Start with attention active
        #[arg(long)]
        watching: bool,

        /// Start hidden
        #[arg(long)]
        hidden: bool,

        /// Capture interval while watched
        #[arg(long, default_value_t = ACTIVE_INTERVAL_MS)]
        active_interval_ms: u64,

        /// Capture interval while idle
        #[arg(long, default_value_t = IDLE_INTERVAL_MS)]
        idle_interval_ms: u64,
    },

    /// Receive the stream, keeping the latest frame on disk
    View {
        /// Relay host
        #[arg(long, default_value = "localhost")]
        host: String,

        /// Relay port
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Where the latest frame is written
        #[arg(short, long, default_value = "latest.jpg")]
        output: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceKind {
    /// Synthetic moving gradient
    Pattern,
    /// Primary display (needs the `screen` feature)
    Screen,
}

/// A line typed on stdin while sharing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareCommand {
    Watch,
    Idle,
    Hide,
    Show,
    Stop,
}

impl ShareCommand {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "watch" => Some(Self::Watch),
            "idle" => Some(Self::Idle),
            "hide" => Some(Self::Hide),
            "show" => Some(Self::Show),
            "stop" | "quit" => Some(Self::Stop),
            _ => None,
        }
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_defaults() {
        let cli = Cli::try_parse_from(["screenrelay", "share"]).unwrap();
        match cli.command {
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
                assert_eq!(host, None);
                assert_eq!(port, DEFAULT_PORT);
                assert_eq!(source, SourceKind::Pattern);
                assert_eq!(frames, None);
                assert!(!watching);
                assert!(!hidden);
                assert_eq!(active_interval_ms, 16);
                assert_eq!(idle_interval_ms, 100);
            }
            _ => panic!("expected share"),
        }
    }

    #[test]
    fn test_relay_addr() {
        let cli = Cli::try_parse_from(["screenrelay", "relay", "--addr", "127.0.0.1:9000"]).unwrap();
        assert!(matches!(cli.command, Commands::Relay { addr } if addr == "127.0.0.1:9000"));
    }

    #[test]
    fn test_view_output() {
        let cli =
            Cli::try_parse_from(["screenrelay", "view", "--host", "10.0.0.2", "-o", "f.jpg"]).unwrap();
        match cli.command {
            Commands::View { host, port, output } => {
                assert_eq!(host, "10.0.0.2");
                assert_eq!(port, DEFAULT_PORT);
                assert_eq!(output, PathBuf::from("f.jpg"));
            }
            _ => panic!("expected view"),
        }
    }

    #[test]
    fn test_share_commands() {
        assert_eq!(ShareCommand::parse(" watch\n"), Some(ShareCommand::Watch));
        assert_eq!(ShareCommand::parse("HIDE"), Some(ShareCommand::Hide));
        assert_eq!(ShareCommand::parse("quit"), Some(ShareCommand::Stop));
        assert_eq!(ShareCommand::parse("dance"), None);
    }
}
